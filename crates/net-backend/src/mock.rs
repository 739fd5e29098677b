//! Mock NetworkBackend for unit testing
//!
//! Keeps an in-memory model of the devices, neighbors, routes and firewall
//! rules a real backend would create, records every call, and can be told
//! to fail specific operations.

use crate::backend_trait::{DeviceHandle, NeighborKind, NetworkBackend, VethInfo};
use crate::error::BackendError;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    EnsureBridge { name: String, mtu: u32, gateway: Ipv4Net },
    DeleteBridge(String),
    EnsureVxlan { name: String, vni: u32, mac: String, local: Ipv4Net },
    DeleteVxlan(String),
    AttachVeth { netns: String, if_name: String, bridge: String, address: Ipv4Net, gateway: Ipv4Addr },
    DetachVeth { netns: String, if_name: String },
    AddNeighbor { dev: String, ip: Ipv4Addr, mac: String, kind: NeighborKind },
    DelNeighbor { dev: String, ip: Ipv4Addr, mac: String, kind: NeighborKind },
    AddRoute { dev: String, dest: Ipv4Net, via: Option<Ipv4Addr> },
    DelRoute { dev: String, dest: Ipv4Net },
    AllowForward(Ipv4Net),
    Isolate(Ipv4Net, Ipv4Net),
    EnableIpv4Forwarding,
}

/// Neighbor entry held by the mock: device, address, MAC and table.
pub type MockNeighbor = (String, Ipv4Addr, String, NeighborKind);

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<BackendCall>,
    links: HashMap<String, DeviceHandle>,
    bridge_creations: usize,
    vxlan_creations: usize,
    next_index: u32,
    veths: HashMap<(String, String), Ipv4Net>,
    neighbors: BTreeSet<MockNeighbor>,
    routes: BTreeMap<(String, Ipv4Net), Option<Ipv4Addr>>,
    forwarded: HashSet<Ipv4Net>,
    isolated: HashSet<(Ipv4Net, Ipv4Net)>,
    ip_forward: bool,
    failures: HashSet<&'static str>,
}

impl MockState {
    fn check(&self, op: &'static str) -> Result<(), BackendError> {
        if self.failures.contains(op) {
            return Err(BackendError::Command {
                command: op.to_string(),
                status: "injected".to_string(),
                stderr: format!("{op} failed"),
            });
        }
        Ok(())
    }

    fn add_link(&mut self, name: &str) -> DeviceHandle {
        self.next_index += 1;
        let handle = DeviceHandle {
            name: name.to_string(),
            index: self.next_index + 100,
        };
        self.links.insert(name.to_string(), handle.clone());
        handle
    }

    /// Removing a device drops every neighbor and route pointing at it.
    fn remove_link(&mut self, name: &str) {
        self.links.remove(name);
        self.neighbors.retain(|(dev, ..)| dev != name);
        self.routes.retain(|(dev, _), _| dev != name);
    }
}

/// In-memory backend for tests.
#[derive(Debug, Clone, Default)]
pub struct MockNetworkBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockNetworkBackend {
    /// Creates an empty mock with IPv4 forwarding disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every later call of `op` (the trait method name) fail.
    pub fn fail_on(&self, op: &'static str) {
        self.state().failures.insert(op);
    }

    /// Lets `op` succeed again.
    pub fn clear_failure(&self, op: &'static str) {
        self.state().failures.remove(op);
    }

    /// Every call recorded so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of bridges actually created (not merely ensured).
    #[must_use]
    pub fn bridge_creations(&self) -> usize {
        self.state().bridge_creations
    }

    /// Number of VXLAN devices actually created.
    #[must_use]
    pub fn vxlan_creations(&self) -> usize {
        self.state().vxlan_creations
    }

    #[must_use]
    pub fn has_link(&self, name: &str) -> bool {
        self.state().links.contains_key(name)
    }

    #[must_use]
    pub fn neighbors(&self) -> Vec<MockNeighbor> {
        self.state().neighbors.iter().cloned().collect()
    }

    #[must_use]
    pub fn routes(&self) -> Vec<(String, Ipv4Net, Option<Ipv4Addr>)> {
        self.state()
            .routes
            .iter()
            .map(|((dev, dest), via)| (dev.clone(), *dest, *via))
            .collect()
    }

    #[must_use]
    pub fn is_forwarded(&self, cidr: Ipv4Net) -> bool {
        self.state().forwarded.contains(&cidr)
    }

    /// True when traffic is dropped in both directions between `a` and `b`.
    #[must_use]
    pub fn is_isolated(&self, a: Ipv4Net, b: Ipv4Net) -> bool {
        let state = self.state();
        state.isolated.contains(&(a, b)) && state.isolated.contains(&(b, a))
    }

    #[must_use]
    pub fn ip_forward_enabled(&self) -> bool {
        self.state().ip_forward
    }

    /// Address of an attached pod interface.
    #[must_use]
    pub fn veth(&self, netns: &str, if_name: &str) -> Option<Ipv4Net> {
        self.state()
            .veths
            .get(&(netns.to_string(), if_name.to_string()))
            .copied()
    }
}

#[async_trait::async_trait]
impl NetworkBackend for MockNetworkBackend {
    async fn link(&self, name: &str) -> Result<Option<DeviceHandle>, BackendError> {
        let state = self.state();
        state.check("link")?;
        Ok(state.links.get(name).cloned())
    }

    async fn ensure_bridge(&self, name: &str, mtu: u32, gateway: Ipv4Net) -> Result<DeviceHandle, BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::EnsureBridge {
            name: name.to_string(),
            mtu,
            gateway,
        });
        state.check("ensure_bridge")?;
        if let Some(handle) = state.links.get(name) {
            return Ok(handle.clone());
        }
        state.bridge_creations += 1;
        Ok(state.add_link(name))
    }

    async fn delete_bridge(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::DeleteBridge(name.to_string()));
        state.check("delete_bridge")?;
        state.remove_link(name);
        Ok(())
    }

    async fn ensure_vxlan(&self, name: &str, vni: u32, mac: &str, local: Ipv4Net) -> Result<DeviceHandle, BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::EnsureVxlan {
            name: name.to_string(),
            vni,
            mac: mac.to_string(),
            local,
        });
        state.check("ensure_vxlan")?;
        if let Some(handle) = state.links.get(name) {
            return Ok(handle.clone());
        }
        state.vxlan_creations += 1;
        Ok(state.add_link(name))
    }

    async fn delete_vxlan(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::DeleteVxlan(name.to_string()));
        state.check("delete_vxlan")?;
        state.remove_link(name);
        Ok(())
    }

    async fn attach_veth(
        &self,
        netns: &str,
        if_name: &str,
        bridge: &str,
        address: Ipv4Net,
        gateway: Ipv4Addr,
        _mtu: u32,
    ) -> Result<VethInfo, BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::AttachVeth {
            netns: netns.to_string(),
            if_name: if_name.to_string(),
            bridge: bridge.to_string(),
            address,
            gateway,
        });
        state.check("attach_veth")?;
        if !state.links.contains_key(bridge) {
            return Err(BackendError::DeviceNotFound(bridge.to_string()));
        }
        state
            .veths
            .insert((netns.to_string(), if_name.to_string()), address);
        Ok(VethInfo {
            host_if_name: format!("veth{:08x}", u32::from(address.addr())),
            container_mac: Some("0a:58:00:00:00:01".to_string()),
        })
    }

    async fn detach_veth(&self, netns: &str, if_name: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::DetachVeth {
            netns: netns.to_string(),
            if_name: if_name.to_string(),
        });
        state.check("detach_veth")?;
        state.veths.remove(&(netns.to_string(), if_name.to_string()));
        Ok(())
    }

    async fn check_veth(&self, netns: &str, if_name: &str, expected: Ipv4Addr) -> Result<bool, BackendError> {
        let state = self.state();
        state.check("check_veth")?;
        Ok(state
            .veths
            .get(&(netns.to_string(), if_name.to_string()))
            .is_some_and(|net| net.addr() == expected))
    }

    async fn add_neighbor(&self, dev: &DeviceHandle, ip: Ipv4Addr, mac: &str, kind: NeighborKind) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::AddNeighbor {
            dev: dev.name.clone(),
            ip,
            mac: mac.to_string(),
            kind,
        });
        state.check("add_neighbor")?;
        if !state.links.contains_key(&dev.name) {
            return Err(BackendError::DeviceNotFound(dev.name.clone()));
        }
        state
            .neighbors
            .insert((dev.name.clone(), ip, mac.to_string(), kind));
        Ok(())
    }

    async fn del_neighbor(&self, dev: &DeviceHandle, ip: Ipv4Addr, mac: &str, kind: NeighborKind) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::DelNeighbor {
            dev: dev.name.clone(),
            ip,
            mac: mac.to_string(),
            kind,
        });
        state.check("del_neighbor")?;
        state
            .neighbors
            .remove(&(dev.name.clone(), ip, mac.to_string(), kind));
        Ok(())
    }

    async fn add_route(&self, dev: &DeviceHandle, dest: Ipv4Net, via: Option<Ipv4Addr>) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::AddRoute {
            dev: dev.name.clone(),
            dest,
            via,
        });
        state.check("add_route")?;
        if !state.links.contains_key(&dev.name) {
            return Err(BackendError::DeviceNotFound(dev.name.clone()));
        }
        state.routes.insert((dev.name.clone(), dest), via);
        Ok(())
    }

    async fn del_route(&self, dev: &DeviceHandle, dest: Ipv4Net) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::DelRoute {
            dev: dev.name.clone(),
            dest,
        });
        state.check("del_route")?;
        state.routes.remove(&(dev.name.clone(), dest));
        Ok(())
    }

    async fn allow_forward(&self, cidr: Ipv4Net) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::AllowForward(cidr));
        state.check("allow_forward")?;
        state.forwarded.insert(cidr);
        Ok(())
    }

    async fn isolate(&self, a: Ipv4Net, b: Ipv4Net) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::Isolate(a, b));
        state.check("isolate")?;
        state.isolated.insert((a, b));
        state.isolated.insert((b, a));
        Ok(())
    }

    async fn enable_ipv4_forwarding(&self) -> Result<(), BackendError> {
        let mut state = self.state();
        state.calls.push(BackendCall::EnableIpv4Forwarding);
        state.check("enable_ipv4_forwarding")?;
        state.ip_forward = true;
        Ok(())
    }
}
