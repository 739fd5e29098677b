//! Plugin-specific network configuration keys.
//!
//! `cni_plugin` decodes the standard keys of the network configuration and
//! keeps every other key in `NetworkConfig::specific`:
//!
//! ```json
//! {
//!   "cniVersion": "1.0.0",
//!   "name": "tenantnet",
//!   "type": "tenantcni",
//!   "stateDir": "/var/lib/cni/tenantcni",
//!   "mtu": 1450
//! }
//! ```

use crate::error::CniError;
use cni_plugin::config::NetworkConfig;
use serde::Deserialize;
use std::path::PathBuf;
use tenant_ipam::StoreConfig;

/// Default number of pod index lookups before ADD gives up.
pub const DEFAULT_RESOLVE_ATTEMPTS: u32 = 10;

/// Settings of this plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSettings {
    /// IPAM state root shared with the controller
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// MTU of the pod interface. Defaults to the tenant bridge MTU.
    #[serde(default)]
    pub mtu: Option<u32>,

    /// Pod index lookups before ADD fails
    #[serde(default)]
    pub resolve_attempts: Option<u32>,

    /// Log file of the plugin
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl PluginSettings {
    /// Decodes the plugin keys of `config`.
    pub fn from_config(config: &NetworkConfig) -> Result<Self, CniError> {
        let specific = serde_json::Value::Object(config.specific.clone().into_iter().collect());
        serde_json::from_value(specific).map_err(|e| CniError::InvalidNetworkConfig(e.to_string()))
    }

    /// Store layout the plugin reads and writes.
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        self.state_dir.clone().map(StoreConfig::new).unwrap_or_default()
    }
}
