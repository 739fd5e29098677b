//! Tenant Update: membership changes, peer programming and reverts of
//! immutable fields.

use super::{object_key, Reconciler};
use crate::cluster::EventSeverity;
use crate::error::ControllerError;
use crate::queue::TenantEvent;
use crds::{Tenant, TenantNode};
use kube::ResourceExt;
use tenant_ipam::TenantRecord;
use tracing::{debug, info, warn};

impl Reconciler {
    /// Works out what an update means for this node.
    ///
    /// Joining or leaving the node list is turned into an Add or Delete
    /// follow-up. A node that stays a member reprograms its peers.
    pub(crate) async fn update_tenant(&self, old: &Tenant, new: &Tenant) -> Result<Vec<TenantEvent>, ControllerError> {
        if old.spec == new.spec {
            debug!("Tenant {} resynced without changes", new.spec.name);
            return Ok(Vec::new());
        }

        let node_name = self.node_name();
        match (old.spec.has_node(node_name), new.spec.has_node(node_name)) {
            (false, false) => return Ok(Vec::new()),
            (false, true) => {
                info!("Node {} joined Tenant {}", node_name, new.spec.name);
                return Ok(vec![TenantEvent::Add(new.clone())]);
            }
            (true, false) => {
                info!("Node {} left Tenant {}", node_name, old.spec.name);
                return Ok(vec![TenantEvent::Delete(old.clone())]);
            }
            (true, true) => {}
        }

        if let Some(owner) = self.foreign_owner(old)? {
            warn!("Tenant name {} is held by {}, ignoring update of {}", old.spec.name, owner, object_key(old));
            return Ok(Vec::new());
        }

        // The record is stored under the name the tenant was created with.
        let Some(record) = self.local_record(&old.spec.name)? else {
            info!("Tenant {} is not materialized on node {}, adding it", new.spec.name, node_name);
            return Ok(vec![TenantEvent::Add(new.clone())]);
        };

        let namespace = new.namespace().unwrap_or_else(|| "default".to_string());
        let Some(latest) = self.cluster.get_tenant(&namespace, &new.name_any()).await? else {
            debug!("Tenant {} is gone, skipping update", new.spec.name);
            return Ok(Vec::new());
        };
        let Some(latest) = self.revert_immutable_fields(&latest, &record).await? else {
            return Ok(Vec::new());
        };

        self.sync_peers(old, &latest, &record).await?;

        self.record_event(
            &latest,
            EventSeverity::Normal,
            "Update",
            format!("Tenant has been updated on node: {node_name}"),
        )
        .await;
        Ok(Vec::new())
    }

    /// Removes peers that left or changed, then programs every published peer.
    async fn sync_peers(&self, old: &Tenant, latest: &Tenant, record: &TenantRecord) -> Result<(), ControllerError> {
        let node_name = self.node_name();

        if let Some(vtep) = self.backend.link(&record.vxlan.vtep_name).await? {
            for stale in old
                .spec
                .published_peers(node_name)
                .filter(|peer| latest.spec.node(&peer.name) != Some(*peer))
            {
                info!("Removing peer {} of Tenant {}", stale.name, record.tenant_name);
                self.remove_peer(&vtep, stale, record.tenant_prefix).await;
            }
        }

        if latest.spec.nodes.len() <= 1 {
            return Ok(());
        }

        let before = self.local_state(&record.tenant_name).await?;
        let vtep = self.ensure_vxlan(record).await?;
        if !before.is_meshed() {
            info!("Tenant {} on node {}: {:?} -> Meshed", record.tenant_name, node_name, before);
        }

        let peers: Vec<&TenantNode> = latest.spec.published_peers(node_name).collect();
        for peer in &peers {
            self.program_peer(&vtep, peer, record.tenant_prefix).await?;
        }
        let waiting = latest.spec.nodes.len().saturating_sub(peers.len() + 1);
        if waiting > 0 {
            debug!("{} peers of Tenant {} have not published their VTEP yet", waiting, record.tenant_name);
        }
        Ok(())
    }

    /// Puts name, VNI and prefix back to what this node materialized.
    ///
    /// Returns the Tenant as it stands afterwards, `None` when it is gone.
    async fn revert_immutable_fields(&self, tenant: &Tenant, record: &TenantRecord) -> Result<Option<Tenant>, ControllerError> {
        let spec = &tenant.spec;
        if spec.name == record.tenant_name && spec.vni == record.vxlan.vni && spec.prefix == record.tenant_prefix {
            return Ok(Some(tenant.clone()));
        }

        warn!(
            "Tenant {} changed immutable fields (name {}, vni {}, prefix {}), reverting to {}/{}/{}",
            record.tenant_name, spec.name, spec.vni, spec.prefix, record.tenant_name, record.vxlan.vni, record.tenant_prefix
        );
        self.record_event(
            tenant,
            EventSeverity::Warning,
            "FailedUpdate",
            format!(
                "Tenant name, VNI and prefix cannot be changed, restoring {}/{}/{}",
                record.tenant_name, record.vxlan.vni, record.tenant_prefix
            ),
        )
        .await;

        let name = record.tenant_name.clone();
        let vni = record.vxlan.vni;
        let prefix = record.tenant_prefix;
        self.update_tenant_spec(tenant, |spec| {
            if spec.name == name && spec.vni == vni && spec.prefix == prefix {
                return false;
            }
            spec.name = name.clone();
            spec.vni = vni;
            spec.prefix = prefix;
            true
        })
        .await
    }
}
