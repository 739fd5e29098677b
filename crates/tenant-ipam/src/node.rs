//! Node IPAM
//!
//! Owns the node's pod CIDR and partitions it into fixed-size tenant
//! subnets. Allocation always takes the head of the available list and a
//! released subnet goes back to the tail, so subnets are handed out
//! first-fit with as little churn as possible.

use crate::config::StoreConfig;
use crate::error::IpamError;
use crate::store::Store;
use crate::Result;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Persisted state of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// Underlay address of the node
    #[serde(rename = "nodeIP", default, skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<Ipv4Addr>,

    /// Pod CIDR assigned to the node by the cluster
    #[serde(rename = "nodeCIDR", default, skip_serializing_if = "Option::is_none")]
    pub node_cidr: Option<Ipv4Net>,

    /// Prefix length the node CIDR is partitioned at
    #[serde(default)]
    pub subnet_prefix: u8,

    /// Subnets not assigned to any tenant, in allocation order
    #[serde(default)]
    pub available_subnets: Vec<Ipv4Net>,

    /// Tenant name to assigned subnet
    #[serde(default)]
    pub tenant_subnets: BTreeMap<String, Ipv4Net>,
}

/// Every subnet of length `prefix_len` inside `cidr`, in ascending order.
///
/// # Errors
///
/// Returns [`IpamError::InvalidCidr`] when `prefix_len` is shorter than the
/// CIDR's own prefix or longer than 32.
pub fn partition(cidr: Ipv4Net, prefix_len: u8) -> Result<Vec<Ipv4Net>> {
    cidr.trunc()
        .subnets(prefix_len)
        .map(|subnets| subnets.collect())
        .map_err(|e| IpamError::InvalidCidr {
            cidr: cidr.to_string(),
            reason: format!("cannot partition at /{prefix_len}: {e}"),
        })
}

/// Subnet allocator for one node.
#[derive(Debug)]
pub struct NodeIpam {
    node: String,
    store: Store<NodeRecord>,
}

impl NodeIpam {
    /// Opens the record of `node`, creating its directory when missing.
    pub fn open(config: &StoreConfig, node: &str) -> Result<Self> {
        Ok(Self {
            node: node.to_string(),
            store: Store::open(config.node_dir(node), node)?,
        })
    }

    /// Node name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.node
    }

    /// Seeds the record from the node's CIDR.
    ///
    /// When the CIDR and partition length are unchanged the available list
    /// keeps its current order. Otherwise it is rebuilt from
    /// [`partition`], leaving out subnets already assigned to a tenant.
    pub fn initialize(&self, node_ip: Ipv4Addr, node_cidr: Ipv4Net, prefix_len: u8) -> Result<NodeRecord> {
        let subnets = partition(node_cidr, prefix_len)?;
        self.store.update(|record| {
            record.node_ip = Some(node_ip);
            let node_cidr = node_cidr.trunc();
            if record.node_cidr == Some(node_cidr) && record.subnet_prefix == prefix_len {
                debug!("Node {} already initialized with {}", self.node, node_cidr);
                return Ok(record.clone());
            }

            info!(
                "Initializing node {} with CIDR {} partitioned at /{}",
                self.node, node_cidr, prefix_len
            );
            record.node_cidr = Some(node_cidr);
            record.subnet_prefix = prefix_len;
            record.available_subnets = subnets
                .into_iter()
                .filter(|s| !record.tenant_subnets.values().any(|t| t == s))
                .collect();
            Ok(record.clone())
        })
    }

    /// Returns the subnet of `tenant`, assigning the head of the available
    /// list the first time the tenant is seen.
    pub fn allocate_tenant_subnet(&self, tenant: &str) -> Result<Ipv4Net> {
        self.store.update(|record| {
            if let Some(subnet) = record.tenant_subnets.get(tenant) {
                debug!("Tenant {} already holds {} on node {}", tenant, subnet, self.node);
                return Ok(*subnet);
            }
            if record.available_subnets.is_empty() {
                return Err(IpamError::SubnetsExhausted(self.node.clone()));
            }
            let subnet = record.available_subnets.remove(0);
            record.tenant_subnets.insert(tenant.to_string(), subnet);
            info!("Assigned subnet {} to tenant {} on node {}", subnet, tenant, self.node);
            Ok(subnet)
        })
    }

    /// Returns the subnet of `tenant` to the tail of the available list.
    ///
    /// Returns the released subnet, or `None` when the tenant held none.
    pub fn release_tenant_subnet(&self, tenant: &str) -> Result<Option<Ipv4Net>> {
        self.store.update(|record| {
            let released = record.tenant_subnets.remove(tenant);
            if let Some(subnet) = released {
                if !record.available_subnets.contains(&subnet) {
                    record.available_subnets.push(subnet);
                }
                info!("Released subnet {} of tenant {} on node {}", subnet, tenant, self.node);
            }
            Ok(released)
        })
    }

    /// Subnet currently assigned to `tenant`.
    pub fn tenant_subnet(&self, tenant: &str) -> Result<Option<Ipv4Net>> {
        self.store.read(|record| record.tenant_subnets.get(tenant).copied())
    }

    /// Current node record
    pub fn record(&self) -> Result<NodeRecord> {
        self.store.read(Clone::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn node(tmp: &tempfile::TempDir, cidr: &str) -> NodeIpam {
        let ipam = NodeIpam::open(&StoreConfig::new(tmp.path()), "node-a").unwrap();
        ipam.initialize("192.168.0.10".parse().unwrap(), net(cidr), 24).unwrap();
        ipam
    }

    #[test]
    fn test_partition_slash16_into_slash24() {
        let subnets = partition(net("10.0.0.0/16"), 24).unwrap();

        assert_eq!(subnets.len(), 256);
        assert_eq!(subnets[0], net("10.0.0.0/24"));
        assert_eq!(subnets[255], net("10.0.255.0/24"));
        assert!(subnets.windows(2).all(|w| w[0].network() < w[1].network()));
        assert!(subnets.iter().all(|s| net("10.0.0.0/16").contains(s)));
    }

    #[test]
    fn test_partition_rejects_shorter_prefix() {
        assert!(matches!(
            partition(net("10.0.0.0/24"), 16),
            Err(IpamError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn test_allocate_takes_head_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let ipam = node(&tmp, "10.1.0.0/23");

        assert_eq!(ipam.allocate_tenant_subnet("acme").unwrap(), net("10.1.0.0/24"));
        assert_eq!(ipam.allocate_tenant_subnet("acme").unwrap(), net("10.1.0.0/24"));
        assert_eq!(ipam.record().unwrap().available_subnets, vec![net("10.1.1.0/24")]);
    }

    #[test]
    fn test_exhaustion() {
        let tmp = tempfile::tempdir().unwrap();
        let ipam = node(&tmp, "10.1.0.0/24");

        ipam.allocate_tenant_subnet("a").unwrap();
        let err = ipam.allocate_tenant_subnet("b").unwrap_err();
        assert!(matches!(err, IpamError::SubnetsExhausted(ref n) if n == "node-a"));
        assert!(err.is_exhausted());
    }

    #[test]
    fn test_released_subnet_goes_to_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let ipam = node(&tmp, "10.1.0.0/22");

        let first = ipam.allocate_tenant_subnet("a").unwrap();
        assert_eq!(ipam.release_tenant_subnet("a").unwrap(), Some(first));

        assert_eq!(ipam.allocate_tenant_subnet("b").unwrap(), net("10.1.1.0/24"));
        assert_eq!(ipam.allocate_tenant_subnet("c").unwrap(), net("10.1.2.0/24"));
        assert_eq!(ipam.allocate_tenant_subnet("d").unwrap(), net("10.1.3.0/24"));
        assert_eq!(ipam.allocate_tenant_subnet("e").unwrap(), first);
    }

    #[test]
    fn test_release_unknown_tenant_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let ipam = node(&tmp, "10.1.0.0/23");

        assert_eq!(ipam.release_tenant_subnet("ghost").unwrap(), None);
        assert_eq!(ipam.record().unwrap().available_subnets.len(), 2);
    }

    #[test]
    fn test_reinitialize_preserves_order_and_assignments() {
        let tmp = tempfile::tempdir().unwrap();
        let ipam = node(&tmp, "10.1.0.0/22");
        ipam.allocate_tenant_subnet("a").unwrap();
        ipam.release_tenant_subnet("a").unwrap();
        ipam.allocate_tenant_subnet("b").unwrap();

        let before = ipam.record().unwrap();
        let after = ipam
            .initialize("192.168.0.10".parse().unwrap(), net("10.1.0.0/22"), 24)
            .unwrap();
        assert_eq!(before.available_subnets, after.available_subnets);

        // A new CIDR reseeds the list but never hands out an assigned subnet.
        let reseeded = ipam
            .initialize("192.168.0.10".parse().unwrap(), net("10.1.0.0/21"), 24)
            .unwrap();
        assert_eq!(reseeded.available_subnets.len(), 7);
        assert!(!reseeded.available_subnets.contains(&net("10.1.1.0/24")));
        assert_eq!(reseeded.tenant_subnets.get("b"), Some(&net("10.1.1.0/24")));
    }

    #[test]
    fn test_record_serializes_with_expected_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let ipam = node(&tmp, "10.1.0.0/23");
        ipam.allocate_tenant_subnet("acme").unwrap();

        let raw = std::fs::read_to_string(tmp.path().join("nodes/node-a/node-a.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["nodeIP"], "192.168.0.10");
        assert_eq!(json["nodeCIDR"], "10.1.0.0/23");
        assert_eq!(json["availableSubnets"][0], "10.1.1.0/24");
        assert_eq!(json["tenantSubnets"]["acme"], "10.1.0.0/24");
    }
}
