//! Tenant network CRD Definitions
//!
//! Kubernetes Custom Resource Definitions shared by the tenant controller
//! and the CNI plugin.

pub mod tenant;

pub use tenant::*;

/// Tenant every pod without a tenant annotation belongs to.
///
/// The default tenant spans every node and is never isolated from other tenants.
pub const DEFAULT_TENANT: &str = "defaulttenant";

/// Pod annotation naming the tenant a pod belongs to.
pub const POD_TENANT_ANNOTATION: &str = "tenantnet.microscaler.io/tenant";

/// Prefix of the node annotations recording the subnet a tenant holds on that node.
///
/// The full key is `<prefix>/<tenant>`.
pub const NODE_TENANT_ANNOTATION_PREFIX: &str = "tenants.tenantnet.microscaler.io";

/// Field manager used for every write the controller makes.
pub const FIELD_MANAGER: &str = "tenant-controller";

/// Returns the node annotation key for a tenant.
#[must_use]
pub fn node_tenant_annotation(tenant: &str) -> String {
    format!("{NODE_TENANT_ANNOTATION_PREFIX}/{tenant}")
}
