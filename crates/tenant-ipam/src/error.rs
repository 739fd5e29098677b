//! IPAM errors

use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the IPAM stores.
#[derive(Debug, Error)]
pub enum IpamError {
    /// Filesystem error while reading or writing a store
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The advisory lock could not be taken
    #[error("Failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    /// A store document could not be encoded or decoded
    #[error("Corrupt store document {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Every tenant subnet of the node is assigned
    #[error("No tenant subnets left on node {0}")]
    SubnetsExhausted(String),

    /// Every address of the tenant subnet is allocated
    #[error("No addresses left in tenant {tenant} subnet {subnet}")]
    PoolExhausted { tenant: String, subnet: String },

    /// A CIDR cannot be partitioned as requested
    #[error("Invalid CIDR {cidr}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    /// The tenant has no record on this node
    #[error("Tenant {0} is not present on this node")]
    TenantNotMaterialized(String),
}

impl IpamError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for exhaustion errors, which only an operator can resolve.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::SubnetsExhausted(_) | Self::PoolExhausted { .. })
    }
}
