//! Test utilities for unit testing reconcilers
//!
//! An in-memory cluster with resource versions and injectable update
//! conflicts, plus helpers for building Tenants and reconcilers on top of a
//! temporary state directory.

use crate::cluster::{ClusterApi, EventSeverity, NodeInfo};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use async_trait::async_trait;
use crds::{Tenant, TenantNode, TenantSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use net_backend::MockNetworkBackend;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tenant_ipam::{NodeIpam, StoreConfig};

pub const NAMESPACE: &str = "default";

/// Event recorded by [`MockCluster`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub tenant: String,
    pub severity: EventSeverity,
    pub reason: String,
    pub note: String,
}

#[derive(Debug, Default)]
struct ClusterState {
    tenants: BTreeMap<(String, String), Tenant>,
    nodes: BTreeMap<String, NodeInfo>,
    annotations: BTreeMap<(String, String), String>,
    deleted_pods: Vec<String>,
    events: Vec<RecordedEvent>,
    pending_conflicts: u32,
    replace_attempts: u32,
    next_version: u64,
}

impl ClusterState {
    fn bump(&mut self, tenant: &mut Tenant) {
        self.next_version += 1;
        tenant.metadata.resource_version = Some(self.next_version.to_string());
    }
}

/// In-memory [`ClusterApi`].
#[derive(Debug, Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_node(&self, name: &str, pod_cidr: &str, internal_ip: &str) {
        self.state().nodes.insert(
            name.to_string(),
            NodeInfo {
                name: name.to_string(),
                pod_cidr: Some(pod_cidr.to_string()),
                internal_ip: internal_ip.parse().ok(),
            },
        );
    }

    /// Stores a Tenant as if a user had applied it, returning the stored copy.
    pub fn put_tenant(&self, mut tenant: Tenant) -> Tenant {
        let mut state = self.state();
        state.bump(&mut tenant);
        state.tenants.insert(key_of(&tenant), tenant.clone());
        tenant
    }

    pub fn tenant(&self, name: &str) -> Option<Tenant> {
        self.state()
            .tenants
            .get(&(NAMESPACE.to_string(), name.to_string()))
            .cloned()
    }

    pub fn remove_tenant(&self, name: &str) -> Option<Tenant> {
        self.state()
            .tenants
            .remove(&(NAMESPACE.to_string(), name.to_string()))
    }

    /// Makes the next `count` replace calls fail with a conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.state().pending_conflicts = count;
    }

    pub fn replace_attempts(&self) -> u32 {
        self.state().replace_attempts
    }

    pub fn annotation(&self, node: &str, key: &str) -> Option<String> {
        self.state()
            .annotations
            .get(&(node.to_string(), key.to_string()))
            .cloned()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.state().deleted_pods.clone()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state().events.clone()
    }
}

fn key_of(tenant: &Tenant) -> (String, String) {
    (
        tenant.metadata.namespace.clone().unwrap_or_else(|| NAMESPACE.to_string()),
        tenant.metadata.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get_tenant(&self, namespace: &str, name: &str) -> Result<Option<Tenant>, ControllerError> {
        Ok(self
            .state()
            .tenants
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn replace_tenant(&self, tenant: &Tenant) -> Result<Tenant, ControllerError> {
        let mut state = self.state();
        state.replace_attempts += 1;
        let key = key_of(tenant);
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(ControllerError::Conflict(key.1));
        }
        let current_version = match state.tenants.get(&key) {
            Some(current) => current.metadata.resource_version.clone(),
            None => return Err(ControllerError::NotFound(key.1)),
        };
        if current_version != tenant.metadata.resource_version {
            return Err(ControllerError::Conflict(key.1));
        }
        let mut updated = tenant.clone();
        state.bump(&mut updated);
        state.tenants.insert(key, updated.clone());
        Ok(updated)
    }

    async fn create_tenant(&self, tenant: &Tenant) -> Result<bool, ControllerError> {
        let mut state = self.state();
        let key = key_of(tenant);
        if state.tenants.contains_key(&key) {
            return Ok(false);
        }
        let mut created = tenant.clone();
        state.bump(&mut created);
        state.tenants.insert(key, created);
        Ok(true)
    }

    async fn get_node(&self, name: &str) -> Result<NodeInfo, ControllerError> {
        self.state()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(format!("node {name}")))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ControllerError> {
        Ok(self.state().nodes.values().cloned().collect())
    }

    async fn annotate_node(&self, node: &str, key: &str, value: Option<&str>) -> Result<(), ControllerError> {
        let mut state = self.state();
        let entry = (node.to_string(), key.to_string());
        match value {
            Some(value) => {
                state.annotations.insert(entry, value.to_string());
            }
            None => {
                state.annotations.remove(&entry);
            }
        }
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        self.state().deleted_pods.push(format!("{namespace}/{name}"));
        Ok(())
    }

    async fn publish_event(
        &self,
        tenant: &Tenant,
        severity: EventSeverity,
        reason: &str,
        note: String,
    ) -> Result<(), ControllerError> {
        self.state().events.push(RecordedEvent {
            tenant: tenant.metadata.name.clone().unwrap_or_default(),
            severity,
            reason: reason.to_string(),
            note,
        });
        Ok(())
    }
}

/// Helper to create a test Tenant CRD spanning `nodes`
pub fn create_test_tenant(name: &str, vni: u32, prefix: u8, nodes: &[&str]) -> Tenant {
    Tenant {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: TenantSpec {
            name: name.to_string(),
            vni,
            prefix,
            nodes: nodes.iter().map(|n| TenantNode::new(*n)).collect(),
        },
    }
}

/// Published entry for a remote node.
pub fn published_node(name: &str, vtep_ip: &str, vtep_mac: &str, node_ip: &str) -> TenantNode {
    TenantNode {
        name: name.to_string(),
        vtep_mac: Some(vtep_mac.to_string()),
        vtep_ip: Some(vtep_ip.to_string()),
        node_ip: Some(node_ip.to_string()),
    }
}

/// Everything a reconciler test needs, on a fresh state directory.
pub struct TestHarness {
    pub cluster: MockCluster,
    pub backend: MockNetworkBackend,
    pub config: ControllerConfig,
    pub reconciler: Reconciler,
    _dir: tempfile::TempDir,
}

impl TestHarness {
    /// Harness for `node-a` holding `node_cidr`, partitioned into /24s.
    pub fn new(node_cidr: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ControllerConfig::new("node-a", StoreConfig::new(dir.path()));
        config.pod_drain_timeout = Duration::ZERO;

        NodeIpam::open(&config.store, "node-a")
            .unwrap()
            .initialize("192.168.0.10".parse().unwrap(), node_cidr.parse().unwrap(), 24)
            .unwrap();

        let cluster = MockCluster::new();
        cluster.add_node("node-a", node_cidr, "192.168.0.10");
        let backend = MockNetworkBackend::new();
        let reconciler = Reconciler::new(
            Arc::new(cluster.clone()),
            Arc::new(backend.clone()),
            Arc::new(config.clone()),
            Arc::new(Metrics::new().unwrap()),
        );
        Self {
            cluster,
            backend,
            config,
            reconciler,
            _dir: dir,
        }
    }

    pub fn node_ipam(&self) -> NodeIpam {
        NodeIpam::open(&self.config.store, "node-a").unwrap()
    }
}
