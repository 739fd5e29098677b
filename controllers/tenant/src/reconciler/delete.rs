//! Tenant Delete: drain pods, remove devices, return the subnet.

use super::{object_key, Reconciler};
use crate::error::ControllerError;
use crds::Tenant;
use std::time::Duration;
use tenant_ipam::{IpamError, NodeIpam, PodIndex, TenantIpam};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl Reconciler {
    /// Tears `tenant` down on this node.
    ///
    /// Removing the bridge and VXLAN devices also removes every neighbor and
    /// route that pointed at them.
    pub(crate) async fn delete_tenant(&self, tenant: &Tenant) -> Result<(), ControllerError> {
        let name = &tenant.spec.name;
        let node_name = self.node_name();
        if !tenant.spec.has_node(node_name) {
            debug!("Tenant {} does not span node {}, ignoring delete", name, node_name);
            return Ok(());
        }
        if let Some(owner) = self.foreign_owner(tenant)? {
            warn!("Tenant name {} is held by {}, not deleting it for {}", name, owner, object_key(tenant));
            return Ok(());
        }
        info!("Deleting Tenant {} on node {}", name, node_name);

        let index = PodIndex::open(&self.config.store)?;
        let pods = index.pods_of(name)?;
        self.delete_pods(name, &pods).await;

        match TenantIpam::open_existing(&self.config.store, name) {
            Ok(ipam) => {
                if let Some(record) = ipam.record()? {
                    self.wait_for_drain(&ipam).await?;
                    self.backend.delete_vxlan(&record.vxlan.vtep_name).await?;
                    self.backend.delete_bridge(&record.bridge.name).await?;
                    info!("Removed devices {} and {}", record.bridge.name, record.vxlan.vtep_name);
                }
                ipam.destroy()?;
            }
            Err(IpamError::TenantNotMaterialized(_)) => {
                debug!("Tenant {} has no local record", name);
            }
            Err(e) => return Err(e.into()),
        }

        for pod in &pods {
            index.forget_pod(pod)?;
        }

        if let Some(subnet) = NodeIpam::open(&self.config.store, node_name)?.release_tenant_subnet(name)? {
            self.metrics.record_subnet_released();
            info!("Returned subnet {} of Tenant {} to node {}", subnet, name, node_name);
        }
        self.annotate_node(name, None).await?;
        self.update_tenant_gauge();
        Ok(())
    }

    async fn delete_pods(&self, tenant: &str, pods: &[String]) {
        for pod in pods {
            let Some((namespace, pod_name)) = pod.split_once('/') else {
                warn!("Skipping malformed pod key {} of Tenant {}", pod, tenant);
                continue;
            };
            match self.cluster.delete_pod(namespace, pod_name).await {
                Ok(()) => info!("Deleted pod {} of Tenant {}", pod, tenant),
                Err(e) => warn!("Failed to delete pod {} of Tenant {}: {}", pod, tenant, e),
            }
        }
    }

    /// Waits until the CNI plugin has released every address of the tenant,
    /// or the drain timeout runs out.
    async fn wait_for_drain(&self, ipam: &TenantIpam) -> Result<(), ControllerError> {
        let deadline = Instant::now() + self.config.pod_drain_timeout;
        loop {
            let remaining = ipam.record()?.map_or(0, |r| r.allocated_ips.len());
            if remaining == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "Tenant {} still holds {} addresses after {:?}, removing it anyway",
                    ipam.name(),
                    remaining,
                    self.config.pod_drain_timeout
                );
                return Ok(());
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}
