//! Controller-specific error types.

use kube::Error as KubeError;
use net_backend::BackendError;
use tenant_ipam::IpamError;
use thiserror::Error;

/// Errors that can occur in the Tenant Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// On-disk address store error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Device, neighbor, route or firewall operation failed
    #[error("Network backend error: {0}")]
    Backend(#[from] BackendError),

    /// Optimistic-concurrency update lost against another writer
    #[error("Update conflict on {0}")]
    Conflict(String),

    /// Resource vanished from the API
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),
}

impl ControllerError {
    /// True when an update lost against a concurrent writer.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// HTTP status of a Kubernetes API error response.
pub(crate) fn api_status(err: &KubeError) -> Option<u16> {
    match err {
        KubeError::Api(ae) => Some(ae.code),
        _ => None,
    }
}
