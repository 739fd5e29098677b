//! Tenant Add: Absent -> LocalOnly -> Meshed.

use super::{object_key, Reconciler, TenantState};
use crate::cluster::EventSeverity;
use crate::error::ControllerError;
use crds::{node_tenant_annotation, Tenant, DEFAULT_TENANT};
use ipnet::Ipv4Net;
use kube::ResourceExt;
use std::net::Ipv4Addr;
use tenant_ipam::{NodeIpam, TenantIpam, TenantRecord};
use tracing::{debug, info, warn};

impl Reconciler {
    /// Materializes `tenant` on this node when the node is one of its members.
    ///
    /// Every step is idempotent, so a repeated Add converges on the same
    /// record and devices.
    pub(crate) async fn add_tenant(&self, tenant: &Tenant) -> Result<(), ControllerError> {
        let spec = &tenant.spec;
        let node_name = self.node_name();
        if !spec.has_node(node_name) {
            debug!("Tenant {} does not span node {}, ignoring", spec.name, node_name);
            return Ok(());
        }
        if spec.prefix != self.config.subnet_prefix {
            warn!(
                "Tenant {} asks for /{} subnets but node {} hands out /{}, ignoring",
                spec.name, spec.prefix, node_name, self.config.subnet_prefix
            );
            self.record_event(
                tenant,
                EventSeverity::Warning,
                "InvalidPrefix",
                format!(
                    "Tenant prefix /{} does not match the /{} subnets of node: {node_name}",
                    spec.prefix, self.config.subnet_prefix
                ),
            )
            .await;
            return Ok(());
        }
        if let Some(owner) = self.foreign_owner(tenant)? {
            warn!("Tenant name {} is already held by {}, ignoring {}", spec.name, owner, object_key(tenant));
            self.record_event(
                tenant,
                EventSeverity::Warning,
                "NameConflict",
                format!("Tenant name {} is already used by {owner} on node: {node_name}", spec.name),
            )
            .await;
            return Ok(());
        }

        let before = self.local_state(&spec.name).await?;
        info!("Adding Tenant {} on node {} ({:?})", spec.name, node_name, before);

        let node = NodeIpam::open(&self.config.store, node_name)?;
        let already_assigned = node.tenant_subnet(&spec.name)?.is_some();
        let subnet = node.allocate_tenant_subnet(&spec.name)?;
        if !already_assigned {
            self.metrics.record_subnet_allocated();
            info!("Assigned subnet {} to Tenant {}", subnet, spec.name);
        }

        let record = TenantIpam::open(&self.config.store, &spec.name)?.materialize(
            &object_key(tenant),
            subnet,
            spec.vni,
            spec.prefix,
            self.config.bridge_mtu,
        )?;
        self.update_tenant_gauge();

        let gateway = record.ip_net_of(record.bridge.gateway);
        self.backend
            .ensure_bridge(&record.bridge.name, record.bridge.mtu, gateway)
            .await?;

        let node_ip = node.record()?.node_ip.ok_or_else(|| {
            ControllerError::Reconciliation(format!("node {node_name} has not been initialized"))
        })?;
        let Some(latest) = self.publish_vtep(tenant, &record, node_ip).await? else {
            info!("Tenant {} was deleted while being added", spec.name);
            return Ok(());
        };

        if latest.spec.nodes.len() > 1 {
            let vtep = self.ensure_vxlan(&record).await?;
            for peer in latest.spec.published_peers(node_name) {
                self.program_peer(&vtep, peer, record.tenant_prefix).await?;
            }
        }

        self.annotate_node(&spec.name, Some(&subnet.to_string())).await?;
        self.apply_isolation(&record, &node).await?;

        let after = self.local_state(&spec.name).await?;
        info!("Tenant {} on node {}: {:?} -> {:?}", spec.name, node_name, before, after);
        self.record_event(
            &latest,
            EventSeverity::Normal,
            "Add",
            format!("Tenant has been created on node: {node_name}"),
        )
        .await;
        Ok(())
    }

    /// Writes this node's VTEP details into its entry of the Tenant.
    async fn publish_vtep(
        &self,
        tenant: &Tenant,
        record: &TenantRecord,
        node_ip: Ipv4Addr,
    ) -> Result<Option<Tenant>, ControllerError> {
        let node_name = self.node_name().to_string();
        let vtep_ip = record.vxlan.vtep_ip.to_string();
        let vtep_mac = record.vxlan.vtep_mac.clone();
        let node_ip = node_ip.to_string();

        let updated = self
            .update_tenant_spec(tenant, |spec| {
                let Some(entry) = spec.node_mut(&node_name) else {
                    return false;
                };
                if entry.vtep_ip.as_ref() == Some(&vtep_ip)
                    && entry.vtep_mac.as_ref() == Some(&vtep_mac)
                    && entry.node_ip.as_ref() == Some(&node_ip)
                {
                    return false;
                }
                entry.vtep_ip = Some(vtep_ip.clone());
                entry.vtep_mac = Some(vtep_mac.clone());
                entry.node_ip = Some(node_ip.clone());
                true
            })
            .await?;
        if updated.is_some() {
            debug!("Published VTEP {} ({}) of node {} on Tenant {}", vtep_ip, vtep_mac, node_name, tenant.name_any());
        }
        Ok(updated)
    }

    /// Sets or clears this node's annotation for `tenant`.
    pub(crate) async fn annotate_node(&self, tenant: &str, subnet: Option<&str>) -> Result<(), ControllerError> {
        let key = node_tenant_annotation(tenant);
        self.cluster.annotate_node(self.node_name(), &key, subnet).await
    }

    /// Allows forwarding for the tenant subnet and cuts it off from every
    /// other tenant on the node. The default tenant is never isolated.
    async fn apply_isolation(&self, record: &TenantRecord, node: &NodeIpam) -> Result<(), ControllerError> {
        let subnet: Ipv4Net = record.tenant_cidr;
        self.backend.allow_forward(subnet).await?;
        if record.tenant_name == DEFAULT_TENANT {
            return Ok(());
        }

        for (other, other_subnet) in &node.record()?.tenant_subnets {
            if other == &record.tenant_name || other == DEFAULT_TENANT {
                continue;
            }
            match self.backend.isolate(subnet, *other_subnet).await {
                Ok(()) => info!("Blocked traffic between tenants {} and {}", record.tenant_name, other),
                Err(e) => {
                    warn!("Failed to isolate {} from {}: {}", record.tenant_name, other, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

impl TenantState {
    /// True once the overlay device exists.
    #[must_use]
    pub fn is_meshed(self) -> bool {
        self == Self::Meshed
    }
}
