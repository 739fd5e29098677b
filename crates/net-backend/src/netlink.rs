//! Netlink backend
//!
//! Devices, addresses, neighbors, FDB entries and routes are programmed over
//! rtnetlink. Idempotency comes from the kernel's errno: `EEXIST` on create
//! and `ENODEV`/`ENOENT`/`ESRCH` on delete mean the state is already right.

use crate::backend_trait::{DeviceHandle, NeighborKind, NetworkBackend, VethInfo};
use crate::error::{netlink_errno, BackendError};
use crate::iptables::{ForwardRule, Iptables, Position};
use crate::netns::{in_netns, open_netns};
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use mac_address::MacAddress;
use nix::errno::Errno;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::{InfoData, InfoVxlan, LinkAttribute, LinkMessage};
use rtnetlink::packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourFlags, NeighbourMessage, NeighbourState,
};
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::{Handle, LinkBridge, LinkUnspec, LinkVeth, LinkVxlan, RouteMessageBuilder};
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;
use std::path::Path;
use tracing::{debug, info};

/// UDP port of the VXLAN overlay
pub const VXLAN_PORT: u16 = 4789;

const IP_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";

/// Errnos meaning the object to delete is already gone.
const GONE: &[Errno] = &[Errno::ENODEV, Errno::ENOENT, Errno::ESRCH, Errno::EADDRNOTAVAIL];

/// Host end name of a pod veth, derived from the pod address.
#[must_use]
pub fn host_veth_name(address: Ipv4Addr) -> String {
    format!("veth{:08x}", u32::from(address))
}

/// Temporary host-side name of the pod end, before it moves into the pod.
fn staging_veth_name(address: Ipv4Addr) -> String {
    format!("tmp{:08x}", u32::from(address))
}

fn parse_mac(mac: &str) -> Result<Vec<u8>, BackendError> {
    mac.parse::<MacAddress>()
        .map(|m| m.bytes().to_vec())
        .map_err(|e| BackendError::InvalidMac(format!("{mac}: {e}")))
}

fn format_mac(bytes: &[u8]) -> Option<String> {
    <[u8; 6]>::try_from(bytes)
        .ok()
        .map(|octets| MacAddress::new(octets).to_string().to_ascii_lowercase())
}

/// Name and index of a link message.
fn device_of(message: &LinkMessage) -> Option<DeviceHandle> {
    message.attributes.iter().find_map(|attribute| match attribute {
        LinkAttribute::IfName(name) => Some(DeviceHandle {
            name: name.clone(),
            index: message.header.index,
        }),
        _ => None,
    })
}

fn mac_of(message: &LinkMessage) -> Option<String> {
    message.attributes.iter().find_map(|attribute| match attribute {
        LinkAttribute::Address(bytes) => format_mac(bytes),
        _ => None,
    })
}

/// Treats the listed errnos as success.
fn tolerate(result: Result<(), rtnetlink::Error>, op: &str, errnos: &[Errno]) -> Result<(), BackendError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if netlink_errno(&e).is_some_and(|errno| errnos.contains(&errno)) => {
            debug!("{}: nothing to do ({})", op, e);
            Ok(())
        }
        Err(e) => Err(BackendError::netlink(op, e)),
    }
}

/// Looks a link up by name through `handle`.
async fn get_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>, BackendError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(e) if netlink_errno(&e) == Some(Errno::ENODEV) => Ok(None),
        Err(e) => Err(BackendError::netlink(format!("link get {name}"), e)),
    }
}

async fn require_link(handle: &Handle, name: &str) -> Result<LinkMessage, BackendError> {
    get_link(handle, name)
        .await?
        .ok_or_else(|| BackendError::DeviceNotFound(name.to_string()))
}

async fn delete_link(handle: &Handle, name: &str) -> Result<(), BackendError> {
    match get_link(handle, name).await? {
        Some(link) => tolerate(
            handle.link().del(link.header.index).execute().await,
            &format!("link del {name}"),
            GONE,
        ),
        None => Ok(()),
    }
}

async fn replace_address(handle: &Handle, index: u32, name: &str, address: Ipv4Net) -> Result<(), BackendError> {
    handle
        .address()
        .add(index, IpAddr::V4(address.addr()), address.prefix_len())
        .replace()
        .execute()
        .await
        .map_err(|e| BackendError::netlink(format!("addr replace {address} dev {name}"), e))
}

async fn set_link(handle: &Handle, message: LinkMessage, op: String) -> Result<(), BackendError> {
    handle
        .link()
        .set(message)
        .execute()
        .await
        .map_err(|e| BackendError::netlink(op, e))
}

/// Backend programming the kernel over rtnetlink.
#[derive(Debug, Clone)]
pub struct NetlinkBackend {
    handle: Handle,
    iptables: Iptables,
}

impl NetlinkBackend {
    /// Opens a netlink connection in the current namespace.
    ///
    /// Must be called from within a Tokio runtime, which drives the connection.
    pub fn connect() -> Result<Self, BackendError> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self {
            handle,
            iptables: Iptables::default(),
        })
    }

    async fn ensure_link(&self, name: &str, message: LinkMessage) -> Result<LinkMessage, BackendError> {
        if let Some(link) = get_link(&self.handle, name).await? {
            return Ok(link);
        }
        tolerate(
            self.handle.link().add(message).execute().await,
            &format!("link add {name}"),
            &[Errno::EEXIST],
        )?;
        require_link(&self.handle, name).await
    }

    fn neighbour_message(dev: &DeviceHandle, ip: Ipv4Addr, mac: Vec<u8>, kind: NeighborKind) -> NeighbourMessage {
        let mut message = NeighbourMessage::default();
        message.header.ifindex = dev.index;
        message.header.state = NeighbourState::Permanent;
        message.attributes.push(NeighbourAttribute::Destination(NeighbourAddress::Inet(ip)));
        message.attributes.push(NeighbourAttribute::LinkLocalAddress(mac));
        match kind {
            NeighborKind::Arp => message.header.family = AddressFamily::Inet,
            NeighborKind::Fdb => {
                message.header.family = AddressFamily::Bridge;
                message.header.flags = NeighbourFlags::Own;
            }
        }
        message
    }
}

#[async_trait::async_trait]
impl NetworkBackend for NetlinkBackend {
    async fn link(&self, name: &str) -> Result<Option<DeviceHandle>, BackendError> {
        Ok(get_link(&self.handle, name).await?.as_ref().and_then(device_of))
    }

    async fn ensure_bridge(&self, name: &str, mtu: u32, gateway: Ipv4Net) -> Result<DeviceHandle, BackendError> {
        let link = self.ensure_link(name, LinkBridge::new(name).mtu(mtu).build()).await?;
        let index = link.header.index;
        replace_address(&self.handle, index, name, gateway).await?;
        set_link(
            &self.handle,
            LinkUnspec::new_with_index(index).mtu(mtu).up().build(),
            format!("link set {name} up"),
        )
        .await?;
        debug!("Bridge {} (index {}) up with {}", name, index, gateway);
        Ok(DeviceHandle {
            name: name.to_string(),
            index,
        })
    }

    async fn delete_bridge(&self, name: &str) -> Result<(), BackendError> {
        info!("Deleting bridge {}", name);
        delete_link(&self.handle, name).await
    }

    async fn ensure_vxlan(&self, name: &str, vni: u32, mac: &str, local: Ipv4Net) -> Result<DeviceHandle, BackendError> {
        let mac = parse_mac(mac)?;
        let message = LinkVxlan::new(name, vni)
            .set_info_data(InfoData::Vxlan(vec![
                InfoVxlan::Id(vni),
                InfoVxlan::Port(VXLAN_PORT),
                InfoVxlan::Learning(false),
                InfoVxlan::Local(local.addr()),
            ]))
            .build();
        let link = self.ensure_link(name, message).await?;
        let index = link.header.index;

        let mut up = LinkUnspec::new_with_index(index).up().build();
        up.attributes.push(LinkAttribute::Address(mac));
        set_link(&self.handle, up, format!("link set {name} up")).await?;
        replace_address(&self.handle, index, name, local).await?;
        debug!("VXLAN {} (vni {}, index {}) up with {}", name, vni, index, local);
        Ok(DeviceHandle {
            name: name.to_string(),
            index,
        })
    }

    async fn delete_vxlan(&self, name: &str) -> Result<(), BackendError> {
        info!("Deleting vxlan {}", name);
        delete_link(&self.handle, name).await
    }

    async fn attach_veth(
        &self,
        netns: &str,
        if_name: &str,
        bridge: &str,
        address: Ipv4Net,
        gateway: Ipv4Addr,
        mtu: u32,
    ) -> Result<VethInfo, BackendError> {
        let host = host_veth_name(address.addr());
        let staging = staging_veth_name(address.addr());
        let netns_path = Path::new(netns);
        let bridge_index = require_link(&self.handle, bridge).await?.header.index;

        // A previous attempt may have left half a pair behind.
        delete_link(&self.handle, &host).await?;
        delete_link(&self.handle, &staging).await?;
        let stale_if = if_name.to_string();
        in_netns(netns_path, move |handle| async move { delete_link(&handle, &stale_if).await }).await?;

        tolerate(
            self.handle
                .link()
                .add(LinkVeth::new(&host, &staging).mtu(mtu).build())
                .execute()
                .await,
            &format!("link add {host} type veth peer {staging}"),
            &[Errno::EEXIST],
        )?;

        let pod_end = require_link(&self.handle, &staging).await?.header.index;
        let fd = open_netns(netns_path)?;
        set_link(
            &self.handle,
            LinkUnspec::new_with_index(pod_end).setns_by_fd(fd.as_raw_fd()).build(),
            format!("link set {staging} netns {netns}"),
        )
        .await?;

        let pod_if = if_name.to_string();
        let container_mac = in_netns(netns_path, move |handle| async move {
            let index = require_link(&handle, &staging).await?.header.index;
            set_link(
                &handle,
                LinkUnspec::new_with_index(index).name(pod_if.clone()).mtu(mtu).up().build(),
                format!("link set {staging} name {pod_if} up"),
            )
            .await?;
            replace_address(&handle, index, &pod_if, address).await?;
            handle
                .route()
                .add(
                    RouteMessageBuilder::<Ipv4Addr>::new()
                        .output_interface(index)
                        .gateway(gateway)
                        .build(),
                )
                .replace()
                .execute()
                .await
                .map_err(|e| BackendError::netlink(format!("route replace default via {gateway} dev {pod_if}"), e))?;
            Ok(mac_of(&require_link(&handle, &pod_if).await?))
        })
        .await?;

        let host_index = require_link(&self.handle, &host).await?.header.index;
        set_link(
            &self.handle,
            LinkUnspec::new_with_index(host_index)
                .controller(bridge_index)
                .mtu(mtu)
                .up()
                .build(),
            format!("link set {host} master {bridge} up"),
        )
        .await?;

        info!("Attached {} in {} to {} via {}", if_name, netns, bridge, host);
        Ok(VethInfo {
            host_if_name: host,
            container_mac,
        })
    }

    async fn detach_veth(&self, netns: &str, if_name: &str) -> Result<(), BackendError> {
        if netns.is_empty() || !Path::new(netns).exists() {
            debug!("Network namespace {} is gone, nothing to detach", netns);
            return Ok(());
        }
        let if_name = if_name.to_string();
        in_netns(Path::new(netns), move |handle| async move { delete_link(&handle, &if_name).await }).await
    }

    async fn check_veth(&self, netns: &str, if_name: &str, expected: Ipv4Addr) -> Result<bool, BackendError> {
        let if_name = if_name.to_string();
        in_netns(Path::new(netns), move |handle| async move {
            let Some(link) = get_link(&handle, &if_name).await? else {
                return Ok(false);
            };
            let mut addresses = handle
                .address()
                .get()
                .set_link_index_filter(link.header.index)
                .execute();
            while let Some(message) = addresses
                .try_next()
                .await
                .map_err(|e| BackendError::netlink(format!("addr show dev {if_name}"), e))?
            {
                let carries = message.attributes.iter().any(|attribute| {
                    matches!(attribute, AddressAttribute::Address(IpAddr::V4(ip)) if *ip == expected)
                });
                if carries {
                    return Ok(true);
                }
            }
            Ok(false)
        })
        .await
    }

    async fn add_neighbor(&self, dev: &DeviceHandle, ip: Ipv4Addr, mac: &str, kind: NeighborKind) -> Result<(), BackendError> {
        let lladdr = parse_mac(mac)?;
        let request = match kind {
            NeighborKind::Arp => self
                .handle
                .neighbours()
                .add(dev.index, IpAddr::V4(ip))
                .link_local_address(&lladdr)
                .state(NeighbourState::Permanent),
            NeighborKind::Fdb => self
                .handle
                .neighbours()
                .add_bridge(dev.index, &lladdr)
                .destination(IpAddr::V4(ip)),
        };
        request
            .replace()
            .execute()
            .await
            .map_err(|e| BackendError::netlink(format!("{kind:?} replace {ip} {mac} dev {}", dev.name), e))
    }

    async fn del_neighbor(&self, dev: &DeviceHandle, ip: Ipv4Addr, mac: &str, kind: NeighborKind) -> Result<(), BackendError> {
        let message = Self::neighbour_message(dev, ip, parse_mac(mac)?, kind);
        tolerate(
            self.handle.neighbours().del(message).execute().await,
            &format!("{kind:?} del {ip} {mac} dev {}", dev.name),
            GONE,
        )
    }

    async fn add_route(&self, dev: &DeviceHandle, dest: Ipv4Net, via: Option<Ipv4Addr>) -> Result<(), BackendError> {
        let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(dest.addr(), dest.prefix_len())
            .output_interface(dev.index);
        if let Some(via) = via {
            builder = builder.gateway(via);
        }
        self.handle
            .route()
            .add(builder.build())
            .replace()
            .execute()
            .await
            .map_err(|e| BackendError::netlink(format!("route replace {dest} dev {}", dev.name), e))
    }

    async fn del_route(&self, dev: &DeviceHandle, dest: Ipv4Net) -> Result<(), BackendError> {
        let message = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(dest.addr(), dest.prefix_len())
            .output_interface(dev.index)
            .build();
        tolerate(
            self.handle.route().del(message).execute().await,
            &format!("route del {dest} dev {}", dev.name),
            GONE,
        )
    }

    async fn allow_forward(&self, cidr: Ipv4Net) -> Result<(), BackendError> {
        self.iptables.ensure(&ForwardRule::accept_from(cidr), Position::Append).await?;
        self.iptables.ensure(&ForwardRule::accept_to(cidr), Position::Append).await
    }

    async fn isolate(&self, a: Ipv4Net, b: Ipv4Net) -> Result<(), BackendError> {
        // Inserted so they win over the ACCEPT rules appended by allow_forward.
        self.iptables.ensure(&ForwardRule::drop_between(a, b), Position::Insert).await?;
        self.iptables.ensure(&ForwardRule::drop_between(b, a), Position::Insert).await
    }

    async fn enable_ipv4_forwarding(&self) -> Result<(), BackendError> {
        let current = tokio::fs::read_to_string(IP_FORWARD_SYSCTL).await?;
        if current.trim() != "1" {
            info!("Enabling IPv4 forwarding");
            tokio::fs::write(IP_FORWARD_SYSCTL, "1").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kernel_error;

    #[test]
    fn test_veth_names_fit_interface_limit() {
        let address = "10.1.0.2".parse().unwrap();
        assert_eq!(host_veth_name(address), "veth0a010002");
        assert_eq!(staging_veth_name(address), "tmp0a010002");
        assert!(host_veth_name(Ipv4Addr::BROADCAST).len() <= 15);
    }

    #[test]
    fn test_mac_conversion() {
        let bytes = parse_mac("0A:58:0A:01:00:02").unwrap();
        assert_eq!(bytes, vec![0x0a, 0x58, 0x0a, 0x01, 0x00, 0x02]);
        assert_eq!(format_mac(&bytes).as_deref(), Some("0a:58:0a:01:00:02"));
        assert_eq!(format_mac(&[1, 2, 3]), None);
        assert!(matches!(parse_mac("not-a-mac"), Err(BackendError::InvalidMac(_))));
    }

    #[test]
    fn test_device_of_link_message() {
        let mut message = LinkMessage::default();
        message.header.index = 7;
        message.attributes.push(LinkAttribute::Address(vec![0x0a, 0x58, 0x0a, 0x01, 0x00, 0x02]));
        message.attributes.push(LinkAttribute::IfName("br-acme".to_string()));

        assert_eq!(
            device_of(&message),
            Some(DeviceHandle {
                name: "br-acme".to_string(),
                index: 7,
            })
        );
        assert_eq!(mac_of(&message).as_deref(), Some("0a:58:0a:01:00:02"));
        assert_eq!(device_of(&LinkMessage::default()), None);
    }

    #[test]
    fn test_existing_object_is_tolerated_on_create() {
        assert!(tolerate(Err(kernel_error(Errno::EEXIST)), "link add br-acme", &[Errno::EEXIST]).is_ok());

        let err = tolerate(Err(kernel_error(Errno::EPERM)), "link add br-acme", &[Errno::EEXIST]).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EPERM));
    }

    #[test]
    fn test_missing_object_is_tolerated_on_delete() {
        for errno in [Errno::ENODEV, Errno::ENOENT, Errno::ESRCH] {
            assert!(tolerate(Err(kernel_error(errno)), "route del", GONE).is_ok());
        }
        assert!(tolerate(Err(kernel_error(Errno::EBUSY)), "link del acme.42", GONE).is_err());
    }

    #[test]
    fn test_fdb_entries_target_the_device_itself() {
        let dev = DeviceHandle {
            name: "acme.42".to_string(),
            index: 12,
        };
        let message = NetlinkBackend::neighbour_message(
            &dev,
            "192.168.0.11".parse().unwrap(),
            parse_mac("0a:58:c0:a8:00:0b").unwrap(),
            NeighborKind::Fdb,
        );
        assert_eq!(message.header.family, AddressFamily::Bridge);
        assert_eq!(message.header.flags, NeighbourFlags::Own);
        assert_eq!(message.header.ifindex, 12);

        let arp = NetlinkBackend::neighbour_message(
            &dev,
            "10.1.1.0".parse().unwrap(),
            parse_mac("0a:58:c0:a8:00:0b").unwrap(),
            NeighborKind::Arp,
        );
        assert_eq!(arp.header.family, AddressFamily::Inet);
    }
}
