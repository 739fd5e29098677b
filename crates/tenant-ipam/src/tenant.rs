//! Tenant IPAM
//!
//! One [`TenantRecord`] exists per tenant present on the node. It carries the
//! bridge and VXLAN parameters derived from the tenant subnet and the pod
//! addresses handed out inside it.

use crate::config::StoreConfig;
use crate::error::IpamError;
use crate::store::Store;
use crate::Result;
use ipnet::Ipv4Net;
use mac_address::MacAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Longest interface name the kernel accepts.
pub const MAX_IFNAME_LEN: usize = 15;

/// Bridge housing the veths of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeInfo {
    /// Bridge device name
    pub name: String,
    /// Address the bridge carries, the default route of the tenant's pods
    pub gateway: Ipv4Addr,
    /// MTU of the bridge and of the veths attached to it
    pub mtu: u32,
}

/// VXLAN tunnel endpoint of one tenant on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VxlanInfo {
    /// VXLAN device name
    pub vtep_name: String,
    /// Overlay address of the VTEP, shared with the bridge gateway
    #[serde(rename = "vtepIP")]
    pub vtep_ip: Ipv4Addr,
    /// MAC address of the VXLAN device, generated once
    pub vtep_mac: String,
    /// VXLAN network identifier
    pub vni: u32,
}

/// Owner of an allocated address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerNetInfo {
    /// Runtime container ID the address was allocated for
    #[serde(rename = "containerID")]
    pub container_id: String,
    /// Interface name inside the container
    pub if_name: String,
}

/// Persisted state of one tenant on this node.
///
/// Records are stored under the tenant name, which pods reference through
/// their tenant annotation, so a name belongs to one Tenant object across
/// the cluster. `owner` names that object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
    /// Tenant name, also the name of the record directory
    pub tenant_name: String,
    /// `namespace/name` of the Tenant object that materialized the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Prefix length of the per-node tenant subnets
    pub tenant_prefix: u8,
    /// Subnet this node holds for the tenant
    #[serde(rename = "tenantCIDR")]
    pub tenant_cidr: Ipv4Net,
    /// Tenant bridge
    pub bridge: BridgeInfo,
    /// Tenant VTEP
    pub vxlan: VxlanInfo,
    /// Pod addresses handed out, with their owners
    #[serde(rename = "allocatedIPs", default)]
    pub allocated_ips: BTreeMap<Ipv4Addr, ContainerNetInfo>,
    /// Rotation cursor of the allocator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_allocated: Option<Ipv4Addr>,
}

impl TenantRecord {
    /// Pairs `ip` with the prefix length of the tenant subnet.
    #[must_use]
    pub fn ip_net_of(&self, ip: Ipv4Addr) -> Ipv4Net {
        // The prefix length comes from a valid Ipv4Net, so this cannot fail.
        Ipv4Net::new(ip, self.tenant_cidr.prefix_len()).unwrap_or(self.tenant_cidr)
    }

    /// Address owned by `container_id`, if any.
    #[must_use]
    pub fn address_of(&self, container_id: &str) -> Option<Ipv4Addr> {
        self.allocated_ips
            .iter()
            .find(|(_, owner)| owner.container_id == container_id)
            .map(|(ip, _)| *ip)
    }

    /// Next free address after the rotation cursor.
    ///
    /// The scan walks the host range of the subnet, wraps back to the first
    /// host once it runs off the end, skips the gateway and every allocated
    /// address, and gives up after visiting each host once.
    fn next_free(&self) -> Option<Ipv4Addr> {
        let first = u32::from(self.tenant_cidr.network()).checked_add(1)?;
        let last = u32::from(self.tenant_cidr.broadcast()).checked_sub(1)?;
        if first > last {
            return None;
        }

        let start = self
            .last_allocated
            .filter(|ip| self.tenant_cidr.contains(ip))
            .unwrap_or(self.bridge.gateway);
        let mut cursor = u32::from(start);
        for _ in first..=last {
            cursor = if cursor < first || cursor >= last { first } else { cursor + 1 };
            let candidate = Ipv4Addr::from(cursor);
            if candidate != self.bridge.gateway && !self.allocated_ips.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Bridge device name for a tenant.
///
/// `br-<tenant>` when it fits in an interface name, otherwise derived from
/// the subnet so it stays unique on the node.
#[must_use]
pub fn bridge_name(tenant: &str, subnet: Ipv4Net) -> String {
    let name = format!("br-{tenant}");
    if name.len() <= MAX_IFNAME_LEN {
        name
    } else {
        format!("br-{:08x}", u32::from(subnet.network()))
    }
}

/// VTEP device name for a tenant, `<tenant>.<vni>` when it fits.
#[must_use]
pub fn vtep_name(tenant: &str, vni: u32, subnet: Ipv4Net) -> String {
    let name = format!("{tenant}.{vni}");
    if name.len() <= MAX_IFNAME_LEN {
        name
    } else {
        format!("vx-{:08x}", u32::from(subnet.network()))
    }
}

/// Random unicast, locally administered MAC address.
fn random_vtep_mac() -> String {
    let mut bytes: [u8; 6] = rand::random();
    bytes[0] = (bytes[0] & 0xfe) | 0x02;
    MacAddress::new(bytes).to_string().to_lowercase()
}

/// Address allocator for one tenant on this node.
#[derive(Debug)]
pub struct TenantIpam {
    tenant: String,
    store: Store<Option<TenantRecord>>,
}

impl TenantIpam {
    /// Opens the record of `tenant`, creating its directory when missing.
    pub fn open(config: &StoreConfig, tenant: &str) -> Result<Self> {
        Ok(Self {
            tenant: tenant.to_string(),
            store: Store::open(config.tenant_dir(tenant), tenant)?,
        })
    }

    /// Opens the record of `tenant` only if the tenant is present on this node.
    pub fn open_existing(config: &StoreConfig, tenant: &str) -> Result<Self> {
        if !config.tenant_dir(tenant).is_dir() {
            return Err(IpamError::TenantNotMaterialized(tenant.to_string()));
        }
        Self::open(config, tenant)
    }

    /// Names of every tenant with a directory under the state root.
    pub fn list(config: &StoreConfig) -> Result<Vec<String>> {
        let dir = config.tenants_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IpamError::io(&dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| IpamError::io(&dir, e))?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Finds the tenant holding an address for `container_id`.
    ///
    /// Used when the pod index has no entry for a pod being torn down.
    pub fn find_container(config: &StoreConfig, container_id: &str) -> Result<Option<String>> {
        for tenant in Self::list(config)? {
            let ipam = Self::open(config, &tenant)?;
            if ipam.lookup(container_id)?.is_some() {
                return Ok(Some(tenant));
            }
        }
        Ok(None)
    }

    /// Tenant name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.tenant
    }

    /// Creates the tenant record for `subnet` on behalf of the Tenant object
    /// `owner` unless one already exists.
    ///
    /// The gateway and the VTEP both take the first host of the subnet. The
    /// VTEP MAC is generated once and kept for the life of the record. An
    /// existing record without an owner is adopted by `owner`; one owned by
    /// another object is returned unchanged.
    pub fn materialize(&self, owner: &str, subnet: Ipv4Net, vni: u32, prefix: u8, mtu: u32) -> Result<TenantRecord> {
        self.store.update(|doc| {
            if let Some(existing) = doc {
                debug!("Tenant {} already materialized with {}", self.tenant, existing.tenant_cidr);
                if existing.owner.is_none() {
                    existing.owner = Some(owner.to_string());
                }
                return Ok(existing.clone());
            }

            let subnet = subnet.trunc();
            let gateway = subnet
                .hosts()
                .next()
                .ok_or_else(|| IpamError::InvalidCidr {
                    cidr: subnet.to_string(),
                    reason: "subnet has no usable host address".to_string(),
                })?;

            let record = TenantRecord {
                tenant_name: self.tenant.clone(),
                owner: Some(owner.to_string()),
                tenant_prefix: prefix,
                tenant_cidr: subnet,
                bridge: BridgeInfo {
                    name: bridge_name(&self.tenant, subnet),
                    gateway,
                    mtu,
                },
                vxlan: VxlanInfo {
                    vtep_name: vtep_name(&self.tenant, vni, subnet),
                    vtep_ip: gateway,
                    vtep_mac: random_vtep_mac(),
                    vni,
                },
                allocated_ips: BTreeMap::new(),
                last_allocated: None,
            };
            info!(
                "Materialized tenant {} with subnet {} (bridge {}, vtep {})",
                self.tenant, subnet, record.bridge.name, record.vxlan.vtep_name
            );
            *doc = Some(record.clone());
            Ok(record)
        })
    }

    /// Current tenant record, `None` if the tenant was never materialized.
    pub fn record(&self) -> Result<Option<TenantRecord>> {
        self.store.read(Clone::clone)
    }

    /// Allocates an address for `container_id`.
    ///
    /// A container that already owns an address gets the same address back.
    pub fn allocate_ip(&self, container_id: &str, if_name: &str) -> Result<Ipv4Addr> {
        self.store.update(|doc| {
            let record = doc
                .as_mut()
                .ok_or_else(|| IpamError::TenantNotMaterialized(self.tenant.clone()))?;

            if let Some(ip) = record.address_of(container_id) {
                debug!("Container {} already owns {} in tenant {}", container_id, ip, self.tenant);
                return Ok(ip);
            }

            let ip = record.next_free().ok_or_else(|| IpamError::PoolExhausted {
                tenant: self.tenant.clone(),
                subnet: record.tenant_cidr.to_string(),
            })?;
            record.allocated_ips.insert(
                ip,
                ContainerNetInfo {
                    container_id: container_id.to_string(),
                    if_name: if_name.to_string(),
                },
            );
            record.last_allocated = Some(ip);
            info!("Allocated {} to container {} in tenant {}", ip, container_id, self.tenant);
            Ok(ip)
        })
    }

    /// Releases the address of `container_id`. Releasing nothing is not an error.
    pub fn release_ip(&self, container_id: &str) -> Result<Option<Ipv4Addr>> {
        self.store.update(|doc| {
            let Some(record) = doc.as_mut() else {
                return Ok(None);
            };
            let released = record.address_of(container_id);
            if let Some(ip) = released {
                record.allocated_ips.remove(&ip);
                info!("Released {} of container {} in tenant {}", ip, container_id, self.tenant);
            }
            Ok(released)
        })
    }

    /// Address owned by `container_id`, if any.
    pub fn lookup(&self, container_id: &str) -> Result<Option<Ipv4Addr>> {
        self.store
            .read(|doc| doc.as_ref().and_then(|r| r.address_of(container_id)))
    }

    /// Removes the tenant directory from disk.
    pub fn destroy(self) -> Result<()> {
        info!("Removing record of tenant {}", self.tenant);
        self.store.destroy()
    }
}
