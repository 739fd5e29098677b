//! Tenant reconciliation.
//!
//! Each node runs its own reconciler and only ever touches its own share of
//! a tenant: the subnet it holds for the tenant, the tenant bridge and VXLAN
//! device, and its own entry in the Tenant's node list.
//!
//! - `add`: materialize the tenant locally and publish this node's VTEP
//! - `update`: membership changes, peer programming, immutable-field reverts
//! - `delete`: drain pods, remove devices, return the subnet

mod add;
mod delete;
mod update;

#[cfg(test)]
mod add_test;

use crate::cluster::{ClusterApi, EventSeverity};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::queue::TenantEvent;
use crds::{Tenant, TenantNode, TenantSpec};
use ipnet::Ipv4Net;
use kube::ResourceExt;
use net_backend::{DeviceHandle, NeighborKind, NetworkBackend};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tenant_ipam::{TenantIpam, TenantRecord};
use tracing::{debug, warn};

const CONFLICT_BASE_DELAY: Duration = Duration::from_millis(20);
const CONFLICT_MAX_DELAY: Duration = Duration::from_secs(1);

/// Where a tenant stands on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantState {
    /// Nothing materialized locally
    Absent,
    /// Subnet and bridge exist, no overlay
    LocalOnly,
    /// VXLAN device is up
    Meshed,
}

/// Reconciles Tenant events for one node.
#[derive(Clone)]
pub struct Reconciler {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) backend: Arc<dyn NetworkBackend>,
    pub(crate) config: Arc<ControllerConfig>,
    pub(crate) metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("node", &self.config.node_name)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        backend: Arc<dyn NetworkBackend>,
        config: Arc<ControllerConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cluster,
            backend,
            config,
            metrics,
        }
    }

    fn node_name(&self) -> &str {
        &self.config.node_name
    }

    /// Handles one event. Returns follow-up events to queue.
    pub async fn reconcile(&self, event: &TenantEvent) -> Result<Vec<TenantEvent>, ControllerError> {
        match event {
            TenantEvent::Add(tenant) => self.add_tenant(tenant).await.map(|()| Vec::new()),
            TenantEvent::Update { old, new } => self.update_tenant(old, new).await,
            TenantEvent::Delete(tenant) => self.delete_tenant(tenant).await.map(|()| Vec::new()),
        }
    }

    /// Current local state of `tenant`.
    pub async fn local_state(&self, tenant: &str) -> Result<TenantState, ControllerError> {
        let Some(record) = self.local_record(tenant)? else {
            return Ok(TenantState::Absent);
        };
        if self.backend.link(&record.vxlan.vtep_name).await?.is_some() {
            Ok(TenantState::Meshed)
        } else {
            Ok(TenantState::LocalOnly)
        }
    }

    /// Persisted record of `tenant` on this node, if materialized.
    pub(crate) fn local_record(&self, tenant: &str) -> Result<Option<TenantRecord>, ControllerError> {
        match TenantIpam::open_existing(&self.config.store, tenant) {
            Ok(ipam) => Ok(ipam.record()?),
            Err(tenant_ipam::IpamError::TenantNotMaterialized(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Owner of the local record named like `tenant` when that record
    /// belongs to a different Tenant object.
    pub(crate) fn foreign_owner(&self, tenant: &Tenant) -> Result<Option<String>, ControllerError> {
        let key = object_key(tenant);
        Ok(self
            .local_record(&tenant.spec.name)?
            .and_then(|record| record.owner)
            .filter(|owner| *owner != key))
    }

    /// Reloads, mutates and replaces a Tenant until the update sticks.
    ///
    /// `mutate` returns false when the Tenant already has the wanted shape,
    /// which ends the loop without writing. Returns `None` when the Tenant
    /// is gone.
    pub(crate) async fn update_tenant_spec<F>(&self, tenant: &Tenant, mutate: F) -> Result<Option<Tenant>, ControllerError>
    where
        F: Fn(&mut TenantSpec) -> bool + Sync,
    {
        let namespace = tenant.namespace().unwrap_or_else(|| "default".to_string());
        let name = tenant.name_any();
        let mut delay = CONFLICT_BASE_DELAY;

        for attempt in 1..=self.config.conflict_retries {
            let Some(mut current) = self.cluster.get_tenant(&namespace, &name).await? else {
                debug!("Tenant {}/{} is gone, nothing to update", namespace, name);
                return Ok(None);
            };
            if !mutate(&mut current.spec) {
                return Ok(Some(current));
            }
            match self.cluster.replace_tenant(&current).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(e) if e.is_conflict() && attempt < self.config.conflict_retries => {
                    self.metrics.record_conflict();
                    debug!("Conflict updating Tenant {}/{} (attempt {}), retrying", namespace, name, attempt);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(CONFLICT_MAX_DELAY);
                }
                Err(ControllerError::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Err(ControllerError::Conflict(format!("{namespace}/{name}")))
    }

    /// Ensures the tenant's VXLAN device.
    pub(crate) async fn ensure_vxlan(&self, record: &TenantRecord) -> Result<DeviceHandle, ControllerError> {
        let local = Ipv4Net::new(record.vxlan.vtep_ip, 32)
            .map_err(|e| ControllerError::Reconciliation(e.to_string()))?;
        Ok(self
            .backend
            .ensure_vxlan(&record.vxlan.vtep_name, record.vxlan.vni, &record.vxlan.vtep_mac, local)
            .await?)
    }

    /// Points the overlay at a remote node: ARP for its VTEP, FDB towards
    /// its underlay address, and routes to its VTEP and tenant subnet.
    pub(crate) async fn program_peer(&self, vtep: &DeviceHandle, peer: &TenantNode, prefix: u8) -> Result<(), ControllerError> {
        let Some(peer) = PeerAddrs::parse(peer, prefix) else {
            return Ok(());
        };
        self.backend
            .add_neighbor(vtep, peer.vtep_ip, &peer.vtep_mac, NeighborKind::Arp)
            .await?;
        self.backend
            .add_neighbor(vtep, peer.node_ip, &peer.vtep_mac, NeighborKind::Fdb)
            .await?;
        self.backend.add_route(vtep, peer.host_route(), None).await?;
        self.backend.add_route(vtep, peer.subnet, Some(peer.vtep_ip)).await?;
        debug!("Programmed peer {} ({} via {})", peer.name, peer.subnet, peer.node_ip);
        Ok(())
    }

    /// Removes what [`Self::program_peer`] added. Missing entries are ignored.
    pub(crate) async fn remove_peer(&self, vtep: &DeviceHandle, peer: &TenantNode, prefix: u8) {
        let Some(peer) = PeerAddrs::parse(peer, prefix) else {
            return;
        };
        let results = [
            self.backend.del_route(vtep, peer.subnet).await,
            self.backend.del_route(vtep, peer.host_route()).await,
            self.backend
                .del_neighbor(vtep, peer.node_ip, &peer.vtep_mac, NeighborKind::Fdb)
                .await,
            self.backend
                .del_neighbor(vtep, peer.vtep_ip, &peer.vtep_mac, NeighborKind::Arp)
                .await,
        ];
        for result in results {
            if let Err(e) = result {
                warn!("Failed to remove overlay entry for peer {}: {}", peer.name, e);
            }
        }
        debug!("Removed peer {}", peer.name);
    }

    /// Records a Kubernetes event. Failures are only logged.
    pub(crate) async fn record_event(&self, tenant: &Tenant, severity: EventSeverity, reason: &str, note: String) {
        if let Err(e) = self.cluster.publish_event(tenant, severity, reason, note).await {
            warn!("Failed to publish {} event for Tenant {}: {}", reason, tenant.name_any(), e);
        }
    }

    /// Refreshes the local tenant gauge.
    pub(crate) fn update_tenant_gauge(&self) {
        if let Ok(tenants) = TenantIpam::list(&self.config.store) {
            self.metrics.set_local_tenants(tenants.len());
        }
    }
}

/// `namespace/name` of a Tenant object.
pub(crate) fn object_key(tenant: &Tenant) -> String {
    format!("{}/{}", tenant.namespace().unwrap_or_else(|| "default".to_string()), tenant.name_any())
}

/// Parsed overlay addresses of a published peer.
struct PeerAddrs<'a> {
    name: &'a str,
    vtep_ip: Ipv4Addr,
    vtep_mac: String,
    node_ip: Ipv4Addr,
    subnet: Ipv4Net,
}

impl<'a> PeerAddrs<'a> {
    fn parse(peer: &'a TenantNode, prefix: u8) -> Option<Self> {
        let (Some(vtep_ip), Some(vtep_mac), Some(node_ip)) = (&peer.vtep_ip, &peer.vtep_mac, &peer.node_ip)
        else {
            debug!("Node {} not initialized yet, skipping", peer.name);
            return None;
        };
        if !peer.is_published() {
            debug!("Node {} not initialized yet, skipping", peer.name);
            return None;
        }
        let parsed = vtep_ip
            .parse::<Ipv4Addr>()
            .ok()
            .zip(node_ip.parse::<Ipv4Addr>().ok())
            .and_then(|(vtep_ip, node_ip)| Ipv4Net::new(vtep_ip, prefix).ok().map(|net| (vtep_ip, node_ip, net.trunc())));
        let Some((vtep_ip_addr, node_ip_addr, subnet)) = parsed else {
            warn!("Node {} published unusable VTEP details {}/{}, skipping", peer.name, vtep_ip, node_ip);
            return None;
        };
        Some(Self {
            name: &peer.name,
            vtep_ip: vtep_ip_addr,
            vtep_mac: vtep_mac.to_lowercase(),
            node_ip: node_ip_addr,
            subnet,
        })
    }

    fn host_route(&self) -> Ipv4Net {
        Ipv4Net::from(self.vtep_ip)
    }
}
