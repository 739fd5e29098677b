//! Cluster API seam.
//!
//! Everything the reconciler asks of the Kubernetes API goes through
//! [`ClusterApi`], so reconciliation can be tested against an in-memory
//! cluster. [`KubeCluster`] is the real implementation.

use crate::error::{api_status, ControllerError};
use async_trait::async_trait;
use crds::{Tenant, FIELD_MANAGER};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, CustomResourceExt, Resource};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// What the controller needs to know about a cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    /// CIDR the cluster assigned to the node's pods
    pub pod_cidr: Option<String>,
    pub internal_ip: Option<Ipv4Addr>,
}

impl NodeInfo {
    fn from_node(node: &Node) -> Self {
        let internal_ip = node
            .status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .and_then(|addrs| {
                addrs
                    .iter()
                    .filter(|a| a.type_ == "InternalIP")
                    .find_map(|a| a.address.parse().ok())
            });
        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            pod_cidr: node.spec.as_ref().and_then(|s| s.pod_cidr.clone()),
            internal_ip,
        }
    }
}

/// Severity of an event recorded against a Tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Kubernetes operations used by the controller.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Latest version of a Tenant, `None` once it is gone.
    async fn get_tenant(&self, namespace: &str, name: &str) -> Result<Option<Tenant>, ControllerError>;

    /// Replaces a Tenant at the resource version it carries.
    ///
    /// Fails with [`ControllerError::Conflict`] when another writer got there first.
    async fn replace_tenant(&self, tenant: &Tenant) -> Result<Tenant, ControllerError>;

    /// Creates a Tenant. Returns false when it already exists.
    async fn create_tenant(&self, tenant: &Tenant) -> Result<bool, ControllerError>;

    async fn get_node(&self, name: &str) -> Result<NodeInfo, ControllerError>;

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ControllerError>;

    /// Sets a node annotation, or removes it when `value` is `None`.
    async fn annotate_node(&self, node: &str, key: &str, value: Option<&str>) -> Result<(), ControllerError>;

    /// Deletes a pod. Deleting a pod that is already gone succeeds.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ControllerError>;

    /// Records a Kubernetes event against a Tenant.
    async fn publish_event(
        &self,
        tenant: &Tenant,
        severity: EventSeverity,
        reason: &str,
        note: String,
    ) -> Result<(), ControllerError>;
}

/// [`ClusterApi`] backed by the API server.
pub struct KubeCluster {
    client: Client,
    recorder: Recorder,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

impl KubeCluster {
    /// Creates the cluster client. Events are reported as coming from `node`.
    #[must_use]
    pub fn new(client: Client, node: &str) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: Some(node.to_string()),
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }

    /// Registers the Tenant CRD. An existing definition is left untouched.
    pub async fn register_tenant_crd(&self) -> Result<(), ControllerError> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        match api.create(&post_params(), &Tenant::crd()).await {
            Ok(_) => {
                info!("Registered CRD {}", Tenant::crd_name());
                Ok(())
            }
            Err(e) if api_status(&e) == Some(409) => {
                debug!("CRD {} already registered", Tenant::crd_name());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_tenant(&self, namespace: &str, name: &str) -> Result<Option<Tenant>, ControllerError> {
        let api: Api<Tenant> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_tenant(&self, tenant: &Tenant) -> Result<Tenant, ControllerError> {
        let namespace = tenant.metadata.namespace.as_deref().unwrap_or("default");
        let name = tenant
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ControllerError::Reconciliation("Tenant without a name".to_string()))?;
        let api: Api<Tenant> = Api::namespaced(self.client.clone(), namespace);
        match api.replace(name, &post_params(), tenant).await {
            Ok(updated) => Ok(updated),
            Err(e) if api_status(&e) == Some(409) => Err(ControllerError::Conflict(format!("{namespace}/{name}"))),
            Err(e) if api_status(&e) == Some(404) => Err(ControllerError::NotFound(format!("{namespace}/{name}"))),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_tenant(&self, tenant: &Tenant) -> Result<bool, ControllerError> {
        let namespace = tenant.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Tenant> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&post_params(), tenant).await {
            Ok(_) => Ok(true),
            Err(e) if api_status(&e) == Some(409) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_node(&self, name: &str) -> Result<NodeInfo, ControllerError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node = api
            .get_opt(name)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("node {name}")))?;
        Ok(NodeInfo::from_node(&node))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ControllerError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(NodeInfo::from_node).collect())
    }

    async fn annotate_node(&self, node: &str, key: &str, value: Option<&str>) -> Result<(), ControllerError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "metadata": { "annotations": { key: value } }
        });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if api_status(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_event(
        &self,
        tenant: &Tenant,
        severity: EventSeverity,
        reason: &str,
        note: String,
    ) -> Result<(), ControllerError> {
        let type_ = match severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        self.recorder.publish(&event, &tenant.object_ref(&())).await?;
        Ok(())
    }
}
