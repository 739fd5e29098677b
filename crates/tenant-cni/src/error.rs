//! CNI errors
//!
//! Each variant maps to a CNI error code so the runtime can tell a
//! misconfiguration from a condition worth retrying.

use net_backend::BackendError;
use tenant_ipam::IpamError;
use thiserror::Error;

/// Errors returned by a plugin command.
#[derive(Debug, Error)]
pub enum CniError {
    /// Required invocation parameter missing or malformed
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    /// Plugin keys of the network configuration could not be decoded
    #[error("Invalid network configuration: {0}")]
    InvalidNetworkConfig(String),

    /// The pod index never produced a tenant for the pod
    #[error("No tenant known for pod {0}")]
    TenantNotResolved(String),

    /// No address is recorded for the container
    #[error("No address allocated for container {0}")]
    NoAddress(String),

    /// The pod interface does not carry its allocated address
    #[error("Interface {if_name} in {netns} does not carry {ip}")]
    InterfaceMismatch {
        netns: String,
        if_name: String,
        ip: String,
    },

    /// Address store failure
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Device operation failure
    #[error("Network backend error: {0}")]
    Backend(#[from] BackendError),

    /// A reply field could not be represented
    #[error("Invalid reply: {0}")]
    Reply(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CniError {
    /// CNI error code reported to the runtime.
    ///
    /// 11 asks the runtime to try again later: the controller has not yet
    /// recorded the pod or set up its tenant on this node.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidEnvironment(_) => 4,
            Self::InvalidNetworkConfig(_) => 7,
            Self::TenantNotResolved(_) | Self::Ipam(IpamError::TenantNotMaterialized(_)) => 11,
            _ => 999,
        }
    }

    /// Short message of the error reply; the details carry the full error.
    #[must_use]
    pub fn msg(&self) -> &'static str {
        match self {
            Self::InvalidEnvironment(_) => "invalid environment variables",
            Self::InvalidNetworkConfig(_) => "invalid network config",
            Self::TenantNotResolved(_) | Self::Ipam(IpamError::TenantNotMaterialized(_)) => "try again later",
            Self::NoAddress(_) | Self::InterfaceMismatch { .. } => "pod interface check failed",
            Self::Ipam(_) => "address management failed",
            Self::Backend(_) => "network setup failed",
            Self::Reply(_) | Self::Io(_) => "internal error",
        }
    }
}
