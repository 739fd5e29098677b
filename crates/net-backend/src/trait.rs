//! NetworkBackend trait
//!
//! Abstracts the device operations so the reconciler and the CNI commands
//! can be unit tested against [`crate::MockNetworkBackend`].

use crate::error::BackendError;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// A network device known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    /// Interface name
    pub name: String,
    /// Kernel interface index
    pub index: u32,
}

/// Host side of an attached pod interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethInfo {
    /// Host end of the veth pair, enslaved to the tenant bridge
    pub host_if_name: String,
    /// MAC of the pod end, when the backend can report it
    pub container_mac: Option<String>,
}

/// Neighbor table a remote VTEP entry goes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NeighborKind {
    /// Remote VTEP address to VTEP MAC
    Arp,
    /// Remote VTEP MAC to underlay node address
    Fdb,
}

/// Trait for network device operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Looks up a device by name.
    async fn link(&self, name: &str) -> Result<Option<DeviceHandle>, BackendError>;

    /// Creates the bridge if missing, assigns the gateway address and brings it up.
    async fn ensure_bridge(&self, name: &str, mtu: u32, gateway: Ipv4Net) -> Result<DeviceHandle, BackendError>;

    async fn delete_bridge(&self, name: &str) -> Result<(), BackendError>;

    /// Creates the VXLAN device if missing, sets its MAC and local address and brings it up.
    async fn ensure_vxlan(&self, name: &str, vni: u32, mac: &str, local: Ipv4Net) -> Result<DeviceHandle, BackendError>;

    async fn delete_vxlan(&self, name: &str) -> Result<(), BackendError>;

    /// Creates a veth pair, moves `if_name` into `netns` with `address` and a
    /// default route via `gateway`, and enslaves the host end to `bridge`.
    async fn attach_veth(
        &self,
        netns: &str,
        if_name: &str,
        bridge: &str,
        address: Ipv4Net,
        gateway: Ipv4Addr,
        mtu: u32,
    ) -> Result<VethInfo, BackendError>;

    /// Removes `if_name` from `netns`. Succeeds when it is already gone.
    async fn detach_veth(&self, netns: &str, if_name: &str) -> Result<(), BackendError>;

    /// True when `if_name` in `netns` carries `expected`.
    async fn check_veth(&self, netns: &str, if_name: &str, expected: Ipv4Addr) -> Result<bool, BackendError>;

    async fn add_neighbor(&self, dev: &DeviceHandle, ip: Ipv4Addr, mac: &str, kind: NeighborKind) -> Result<(), BackendError>;

    async fn del_neighbor(&self, dev: &DeviceHandle, ip: Ipv4Addr, mac: &str, kind: NeighborKind) -> Result<(), BackendError>;

    /// Adds an on-link route to `dest`, through `via` when given.
    async fn add_route(&self, dev: &DeviceHandle, dest: Ipv4Net, via: Option<Ipv4Addr>) -> Result<(), BackendError>;

    async fn del_route(&self, dev: &DeviceHandle, dest: Ipv4Net) -> Result<(), BackendError>;

    /// Accepts forwarded traffic from and to `cidr`.
    async fn allow_forward(&self, cidr: Ipv4Net) -> Result<(), BackendError>;

    /// Drops forwarded traffic between `a` and `b` in both directions.
    async fn isolate(&self, a: Ipv4Net, b: Ipv4Net) -> Result<(), BackendError>;

    async fn enable_ipv4_forwarding(&self) -> Result<(), BackendError>;
}
