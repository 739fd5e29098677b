//! ADD, DEL and CHECK.

use crate::error::CniError;
use crate::invocation::Invocation;
use ipnet::Ipv4Net;
use net_backend::{BackendError, NetworkBackend, VethInfo};
use std::net::Ipv4Addr;
use std::time::Duration;
use tenant_ipam::{IpamError, PodIndex, StoreConfig, TenantIpam, TenantRecord};
use tracing::{debug, info, warn};

/// How long ADD waits for the controller to record a new pod.
///
/// The controller's pod watcher races the kubelet, so the pod index may not
/// know the pod yet. Lookups are retried with doubling delays; running out
/// of attempts means something is wrong with the controller, not a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvePolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            attempts: crate::settings::DEFAULT_RESOLVE_ATTEMPTS,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// A pod attached to its tenant bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Host end of the veth pair
    pub host_if_name: String,
    /// Pod end of the veth pair
    pub if_name: String,
    /// Pod network namespace path
    pub netns: String,
    /// MAC address of the pod end, when it could be read
    pub container_mac: Option<String>,
    /// Pod address with the tenant prefix length
    pub address: Ipv4Net,
    /// Tenant bridge address, the pod's default route
    pub gateway: Ipv4Addr,
}

/// One plugin invocation's view of the node.
pub struct Plugin<'a> {
    store: StoreConfig,
    backend: &'a dyn NetworkBackend,
    resolve: ResolvePolicy,
    mtu: Option<u32>,
}

impl std::fmt::Debug for Plugin<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("store", &self.store)
            .field("resolve", &self.resolve)
            .field("mtu", &self.mtu)
            .finish_non_exhaustive()
    }
}

impl<'a> Plugin<'a> {
    /// Creates a plugin working on `store` through `backend`.
    pub fn new(store: StoreConfig, backend: &'a dyn NetworkBackend) -> Self {
        Self {
            store,
            backend,
            resolve: ResolvePolicy::default(),
            mtu: None,
        }
    }

    #[must_use]
    pub fn with_resolve_policy(mut self, resolve: ResolvePolicy) -> Self {
        self.resolve = resolve;
        self
    }

    /// Overrides the pod interface MTU, which otherwise follows the bridge.
    #[must_use]
    pub fn with_mtu(mut self, mtu: Option<u32>) -> Self {
        self.mtu = mtu;
        self
    }

    /// Looks the pod up in the pod index, retrying while it is unknown.
    async fn resolve_tenant(&self, pod: &str) -> Result<String, CniError> {
        let index = PodIndex::open(&self.store)?;
        let mut delay = self.resolve.initial_delay;
        for attempt in 1..=self.resolve.attempts.max(1) {
            if let Some(tenant) = index.resolve_tenant(pod)? {
                debug!("Pod {} belongs to tenant {} (attempt {})", pod, tenant, attempt);
                return Ok(tenant);
            }
            if attempt < self.resolve.attempts {
                debug!("Pod {} not in pod index yet, retrying in {:?}", pod, delay);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.resolve.max_delay);
            }
        }
        Err(CniError::TenantNotResolved(pod.to_string()))
    }

    /// Tenant of a pod being torn down or checked.
    ///
    /// Falls back to scanning tenant records for the container when the pod
    /// index has no entry, so DEL still releases the address after the index
    /// entry is gone.
    fn find_tenant(&self, args: &Invocation) -> Result<Option<String>, CniError> {
        if let Some(pod) = &args.pod {
            if let Some(tenant) = PodIndex::open(&self.store)?.resolve_tenant(pod)? {
                return Ok(Some(tenant));
            }
        }
        Ok(TenantIpam::find_container(&self.store, &args.container_id)?)
    }

    /// Ensures the tenant bridge and plugs the pod into it.
    async fn wire_pod(
        &self,
        args: &Invocation,
        record: &TenantRecord,
        address: Ipv4Net,
        mtu: u32,
    ) -> Result<VethInfo, BackendError> {
        let gateway = record.bridge.gateway;
        self.backend
            .ensure_bridge(&record.bridge.name, record.bridge.mtu, record.ip_net_of(gateway))
            .await?;
        self.backend
            .attach_veth(&args.netns, &args.if_name, &record.bridge.name, address, gateway, mtu)
            .await
    }

    /// Attaches the pod to its tenant bridge.
    ///
    /// The address is released again when the pod cannot be wired up, so a
    /// failed ADD leaves nothing allocated.
    pub async fn add(&self, args: &Invocation) -> Result<Attachment, CniError> {
        let pod = args
            .pod
            .as_deref()
            .ok_or_else(|| CniError::InvalidEnvironment("K8S_POD_NAME missing from CNI_ARGS".to_string()))?;
        info!("ADD container {} for pod {}", args.container_id, pod);

        let tenant_name = self.resolve_tenant(pod).await?;
        let tenant = TenantIpam::open_existing(&self.store, &tenant_name)?;
        let record = tenant
            .record()?
            .ok_or_else(|| IpamError::TenantNotMaterialized(tenant_name.clone()))?;

        let ip = tenant.allocate_ip(&args.container_id, &args.if_name)?;
        let address = record.ip_net_of(ip);
        let mtu = self.mtu.unwrap_or(record.bridge.mtu);

        let veth = match self.wire_pod(args, &record, address, mtu).await {
            Ok(veth) => veth,
            Err(e) => {
                warn!("Attaching container {} failed, releasing {}: {}", args.container_id, ip, e);
                if let Err(release) = tenant.release_ip(&args.container_id) {
                    warn!("Failed to release {} after failed ADD: {}", ip, release);
                }
                return Err(e.into());
            }
        };

        info!("Pod {} attached to {} with {}", pod, record.bridge.name, address);
        Ok(Attachment {
            host_if_name: veth.host_if_name,
            if_name: args.if_name.clone(),
            netns: args.netns.clone(),
            container_mac: veth.container_mac,
            address,
            gateway: record.bridge.gateway,
        })
    }

    /// Detaches the pod and releases its address. Safe to repeat.
    ///
    /// The interface goes first: an address stays allocated for as long as
    /// it may still be configured in the pod.
    pub async fn del(&self, args: &Invocation) -> Result<(), CniError> {
        info!("DEL container {}", args.container_id);

        self.backend.detach_veth(&args.netns, &args.if_name).await?;

        match self.find_tenant(args)? {
            Some(tenant_name) => match TenantIpam::open_existing(&self.store, &tenant_name) {
                Ok(tenant) => {
                    tenant.release_ip(&args.container_id)?;
                }
                Err(IpamError::TenantNotMaterialized(_)) => {
                    debug!("Tenant {} already removed from this node", tenant_name);
                }
                Err(e) => return Err(e.into()),
            },
            None => debug!("No address recorded for container {}", args.container_id),
        }

        if let Some(pod) = &args.pod {
            PodIndex::open(&self.store)?.forget_pod(pod)?;
        }
        Ok(())
    }

    /// Verifies the pod interface still carries its allocated address.
    pub async fn check(&self, args: &Invocation) -> Result<Ipv4Addr, CniError> {
        info!("CHECK container {}", args.container_id);

        let tenant_name = self
            .find_tenant(args)?
            .ok_or_else(|| CniError::NoAddress(args.container_id.clone()))?;
        let ip = TenantIpam::open_existing(&self.store, &tenant_name)?
            .lookup(&args.container_id)?
            .ok_or_else(|| CniError::NoAddress(args.container_id.clone()))?;

        if !self.backend.check_veth(&args.netns, &args.if_name, ip).await? {
            return Err(CniError::InterfaceMismatch {
                netns: args.netns.clone(),
                if_name: args.if_name.clone(),
                ip: ip.to_string(),
            });
        }
        Ok(ip)
    }
}
