//! Controller configuration.
//!
//! Loaded from environment variables. Parsing goes through a lookup function
//! so tests can feed variables without touching the process environment.

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tenant_ipam::StoreConfig;

const DEFAULT_SUBNET_PREFIX: u8 = 24;
const DEFAULT_BRIDGE_MTU: u32 = 1450;
const DEFAULT_CONFLICT_RETRIES: u32 = 5;
const DEFAULT_POD_DRAIN_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TENANT_VNI: u32 = 1;

/// Runtime configuration of one node's controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Node this controller manages (`NODE_NAME`, required)
    pub node_name: String,
    /// Namespace to watch; all namespaces when unset
    pub namespace: Option<String>,
    /// Root of the on-disk stores shared with the CNI plugin
    pub store: StoreConfig,
    /// Prefix length the node CIDR is partitioned into
    pub subnet_prefix: u8,
    /// MTU of tenant bridges (leaves room for VXLAN encapsulation)
    pub bridge_mtu: u32,
    pub probe_addr: SocketAddr,
    /// Attempts per optimistic-concurrency update
    pub conflict_retries: u32,
    /// How long tenant teardown waits for pods to release their addresses
    pub pod_drain_timeout: Duration,
    pub default_tenant_vni: u32,
    /// Register the Tenant CRD at start-up
    pub register_crd: bool,
}

impl ControllerConfig {
    /// Configuration for `node_name` with every optional setting at its default.
    #[must_use]
    pub fn new(node_name: impl Into<String>, store: StoreConfig) -> Self {
        Self {
            node_name: node_name.into(),
            namespace: None,
            store,
            subnet_prefix: DEFAULT_SUBNET_PREFIX,
            bridge_mtu: DEFAULT_BRIDGE_MTU,
            probe_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            pod_drain_timeout: Duration::from_secs(DEFAULT_POD_DRAIN_TIMEOUT_SECS),
            default_tenant_vni: DEFAULT_TENANT_VNI,
            register_crd: true,
        }
    }

    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let node_name = lookup("NODE_NAME")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ControllerError::InvalidConfig("NODE_NAME environment variable is required".to_string())
            })?;
        let store = lookup("TENANT_STATE_DIR").map_or_else(StoreConfig::default, StoreConfig::new);

        let mut config = Self::new(node_name, store);
        config.namespace = lookup("WATCH_NAMESPACE").filter(|v| !v.is_empty());
        config.subnet_prefix = parse_var(&lookup, "TENANT_SUBNET_PREFIX", DEFAULT_SUBNET_PREFIX)?;
        config.bridge_mtu = parse_var(&lookup, "BRIDGE_MTU", DEFAULT_BRIDGE_MTU)?;
        config.probe_addr = parse_var(&lookup, "PROBE_ADDR", config.probe_addr)?;
        config.conflict_retries = parse_var(&lookup, "CONFLICT_RETRIES", DEFAULT_CONFLICT_RETRIES)?;
        config.pod_drain_timeout = Duration::from_secs(parse_var(
            &lookup,
            "POD_DRAIN_TIMEOUT_SECS",
            DEFAULT_POD_DRAIN_TIMEOUT_SECS,
        )?);
        config.default_tenant_vni = parse_var(&lookup, "DEFAULT_TENANT_VNI", DEFAULT_TENANT_VNI)?;
        config.register_crd = parse_var(&lookup, "REGISTER_CRD", true)?;

        if !(1..=30).contains(&config.subnet_prefix) {
            return Err(ControllerError::InvalidConfig(format!(
                "TENANT_SUBNET_PREFIX must be between 1 and 30, got {}",
                config.subnet_prefix
            )));
        }
        if config.conflict_retries == 0 {
            return Err(ControllerError::InvalidConfig(
                "CONFLICT_RETRIES must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Namespace for resources the controller creates itself.
    #[must_use]
    pub fn resource_namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("default")
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ControllerError> {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => value.trim().parse().map_err(|_| {
            ControllerError::InvalidConfig(format!("{key} has invalid value {value:?}"))
        }),
        _ => Ok(default),
    }
}
