//! Tenant IPAM
//!
//! Crash-safe address management for the tenant network. Every record lives
//! in its own JSON document on local disk, guarded by an advisory file lock so
//! the long-running controller and the short-lived CNI processes can mutate
//! the same state without a shared in-memory cache.
//!
//! - [`NodeIpam`] partitions a node's pod CIDR into tenant subnets.
//! - [`TenantIpam`] hands out pod addresses inside one tenant subnet.
//! - [`PodIndex`] maps pods to the tenant they belong to.
//!
//! # Example
//!
//! ```no_run
//! use tenant_ipam::{NodeIpam, StoreConfig, TenantIpam};
//!
//! # fn example() -> Result<(), tenant_ipam::IpamError> {
//! let config = StoreConfig::default();
//! let node = NodeIpam::open(&config, "node-a")?;
//! node.initialize("192.168.0.10".parse().unwrap(), "10.1.0.0/16".parse().unwrap(), 24)?;
//!
//! let subnet = node.allocate_tenant_subnet("acme")?;
//! let tenant = TenantIpam::open(&config, "acme")?;
//! tenant.materialize("default/acme", subnet, 42, 24, 1450)?;
//! let ip = tenant.allocate_ip("c1", "eth0")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod node;
pub mod pod_index;
pub mod store;
pub mod tenant;

pub use config::StoreConfig;
pub use error::IpamError;
pub use node::{partition, NodeIpam, NodeRecord};
pub use pod_index::{pod_key, PodIndex};
pub use store::{Store, StoreLock};
pub use tenant::{
    BridgeInfo, ContainerNetInfo, TenantIpam, TenantRecord, VxlanInfo, bridge_name, vtep_name,
};

/// Result type used throughout the IPAM stores.
pub type Result<T, E = IpamError> = std::result::Result<T, E>;
