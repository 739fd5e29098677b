//! Tenant CRD
//!
//! A tenant is an isolation domain: one subnet per node it spans, joined
//! by a VXLAN overlay once it spans more than one node.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "tenantnet.microscaler.io",
    version = "v1alpha1",
    kind = "Tenant",
    namespaced,
    shortname = "tnt",
    printcolumn = r#"{"name":"VNI","type":"integer","jsonPath":".spec.vni"}"#,
    printcolumn = r#"{"name":"Prefix","type":"integer","jsonPath":".spec.prefix"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TenantSpec {
    /// Tenant name, unique across the cluster: pods and node state refer to
    /// the tenant by it. Immutable once the tenant has been materialized on a node.
    pub name: String,

    /// VXLAN network identifier of the tenant overlay. Immutable.
    pub vni: u32,

    /// Prefix length of each per-node tenant subnet. Immutable.
    pub prefix: u8,

    /// Nodes the tenant spans, with the VTEP details each node publishes.
    #[serde(default)]
    pub nodes: Vec<TenantNode>,
}

/// Per-node entry of a tenant.
///
/// The node controller fills in the VTEP fields once the tenant has been
/// materialized locally; peers ignore entries until they are populated.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TenantNode {
    /// Kubernetes node name
    pub name: String,

    /// MAC address of the node's VTEP for this tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vtep_mac: Option<String>,

    /// IP address of the node's VTEP for this tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vtep_ip: Option<String>,

    /// Underlay address of the node
    #[serde(default, rename = "nodeIP", skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<String>,
}

impl TenantNode {
    /// Creates an unpublished entry for a node.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// True once the node has published every VTEP field.
    #[must_use]
    pub fn is_published(&self) -> bool {
        [&self.vtep_mac, &self.vtep_ip, &self.node_ip]
            .iter()
            .all(|field| field.as_deref().is_some_and(|v| !v.is_empty()))
    }
}

impl TenantSpec {
    /// Returns true when `node` is one of the tenant's nodes.
    #[must_use]
    pub fn has_node(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n.name == node)
    }

    /// Returns the entry for `node`, if any.
    #[must_use]
    pub fn node(&self, node: &str) -> Option<&TenantNode> {
        self.nodes.iter().find(|n| n.name == node)
    }

    /// Returns a mutable entry for `node`, if any.
    pub fn node_mut(&mut self, node: &str) -> Option<&mut TenantNode> {
        self.nodes.iter_mut().find(|n| n.name == node)
    }

    /// Entries of every node other than `local` that have published their VTEP.
    pub fn published_peers<'a>(&'a self, local: &'a str) -> impl Iterator<Item = &'a TenantNode> {
        self.nodes
            .iter()
            .filter(move |n| n.name != local && n.is_published())
    }
}
