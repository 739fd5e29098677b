//! Kubernetes resource watchers.
//!
//! The Tenant watcher turns watch events into Add/Update/Delete work items.
//! The watch stream only carries the new object, so a cache of the last
//! seen Tenants supplies the old side of every update. The Pod watcher keeps
//! the pod index in step with the pods scheduled on this node.

use crate::error::ControllerError;
use crate::queue::{TenantEvent, WorkQueue};
use crds::{Tenant, DEFAULT_TENANT, POD_TENANT_ANNOTATION};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, ResourceExt};
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use std::collections::{HashMap, HashSet};
use tenant_ipam::{pod_key, PodIndex, StoreConfig};
use tokio::sync::watch;
use tracing::{debug, info, warn};

fn tenant_key(tenant: &Tenant) -> String {
    format!("{}/{}", tenant.namespace().unwrap_or_default(), tenant.name_any())
}

/// Last seen version of every Tenant.
#[derive(Debug, Default)]
pub struct TenantCache {
    tenants: HashMap<String, Tenant>,
    /// Keys seen since the current relist started
    relisted: Option<HashSet<String>>,
}

impl TenantCache {
    /// Records `tenant`, returning Add the first time and Update afterwards.
    pub fn apply(&mut self, tenant: Tenant) -> TenantEvent {
        let key = tenant_key(&tenant);
        if let Some(seen) = self.relisted.as_mut() {
            seen.insert(key.clone());
        }
        match self.tenants.insert(key, tenant.clone()) {
            Some(old) => TenantEvent::Update { old, new: tenant },
            None => TenantEvent::Add(tenant),
        }
    }

    /// Forgets `tenant`.
    pub fn delete(&mut self, tenant: Tenant) -> TenantEvent {
        self.tenants.remove(&tenant_key(&tenant));
        TenantEvent::Delete(tenant)
    }

    /// Starts a relist. Tenants not applied before [`Self::finish_relist`]
    /// are treated as deleted.
    pub fn begin_relist(&mut self) {
        self.relisted = Some(HashSet::new());
    }

    /// Ends a relist, returning a Delete for every Tenant that vanished
    /// while the watch was down.
    pub fn finish_relist(&mut self) -> Vec<TenantEvent> {
        let Some(seen) = self.relisted.take() else {
            return Vec::new();
        };
        let vanished: Vec<String> = self
            .tenants
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        vanished
            .into_iter()
            .filter_map(|key| self.tenants.remove(&key))
            .map(TenantEvent::Delete)
            .collect()
    }

    /// Translates one watch event into work items.
    pub fn handle(&mut self, event: watcher::Event<Tenant>) -> Vec<TenantEvent> {
        match event {
            watcher::Event::Apply(tenant) | watcher::Event::InitApply(tenant) => vec![self.apply(tenant)],
            watcher::Event::Delete(tenant) => vec![self.delete(tenant)],
            watcher::Event::Init => {
                debug!("Tenant relist started");
                self.begin_relist();
                Vec::new()
            }
            watcher::Event::InitDone => {
                let deleted = self.finish_relist();
                info!("Tenant relist complete, {} tenants known", self.tenants.len());
                deleted
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

/// Tenant a pod belongs to, `None` for host-network pods.
pub fn pod_tenant(pod: &Pod) -> Option<String> {
    let host_network = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false);
    if host_network {
        return None;
    }
    Some(
        pod.annotations()
            .get(POD_TENANT_ANNOTATION)
            .filter(|tenant| !tenant.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_TENANT.to_string()),
    )
}

fn pod_index_key(pod: &Pod) -> String {
    pod_key(&pod.namespace().unwrap_or_default(), &pod.name_any())
}

/// Applies pod watch events to the pod index.
///
/// A failed index update is logged and dropped; the next event for the pod
/// or the next relist records it again.
pub struct PodTracker {
    index: PodIndex,
}

impl PodTracker {
    pub fn new(index: PodIndex) -> Self {
        Self { index }
    }

    /// Records or forgets the pod of one watch event.
    pub fn handle(&self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                let Some(tenant) = pod_tenant(&pod) else {
                    return;
                };
                let key = pod_index_key(&pod);
                match self.index.resolve_tenant(&key) {
                    Ok(known) if known.as_deref() == Some(tenant.as_str()) => {}
                    Ok(_) => match self.index.record_pod(&key, &tenant) {
                        Ok(()) => debug!("Pod {} belongs to Tenant {}", key, tenant),
                        Err(e) => warn!("Failed to record pod {} for Tenant {}: {}", key, tenant, e),
                    },
                    Err(e) => warn!("Failed to look up pod {}: {}", key, e),
                }
            }
            watcher::Event::Delete(pod) => {
                let key = pod_index_key(&pod);
                if let Err(e) = self.index.forget_pod(&key) {
                    warn!("Failed to forget pod {}: {}", key, e);
                }
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
}

/// Watches Tenants and pods for one node.
pub struct Watcher {
    tenant_api: Api<Tenant>,
    pod_api: Api<Pod>,
    node_name: String,
    store: StoreConfig,
    queue: WorkQueue,
}

impl Watcher {
    pub fn new(tenant_api: Api<Tenant>, pod_api: Api<Pod>, node_name: String, store: StoreConfig, queue: WorkQueue) -> Self {
        Self {
            tenant_api,
            pod_api,
            node_name,
            store,
            queue,
        }
    }

    /// Feeds Tenant changes into the work queue until shutdown.
    pub async fn watch_tenants(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        info!("Starting Tenant watcher");
        let mut cache = TenantCache::default();
        let mut stream = watcher(self.tenant_api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();

        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    for work in cache.handle(event) {
                        self.queue.enqueue(work);
                    }
                }
                Some(Err(e)) => warn!("Tenant watch error: {}", e),
                None => {
                    return Err(ControllerError::Watch("Tenant watch stream ended".to_string()));
                }
            }
        }
        info!("Tenant watcher stopped");
        Ok(())
    }

    /// Keeps the pod index in step with pods on this node until shutdown.
    pub async fn watch_pods(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        info!("Starting Pod watcher for node {}", self.node_name);
        let tracker = PodTracker::new(PodIndex::open(&self.store)?);
        let config = watcher::Config::default().fields(&format!("spec.nodeName={}", self.node_name));
        let mut stream = watcher(self.pod_api.clone(), config).default_backoff().boxed();

        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => tracker.handle(event),
                Some(Err(e)) => warn!("Pod watch error: {}", e),
                None => {
                    return Err(ControllerError::Watch("Pod watch stream ended".to_string()));
                }
            }
        }
        info!("Pod watcher stopped");
        Ok(())
    }
}
