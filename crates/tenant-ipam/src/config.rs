//! Store layout configuration.

use std::path::{Path, PathBuf};

/// Default state root shared by the controller and the CNI plugin.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/cni/tenantcni";

/// On-disk layout of the IPAM state.
///
/// ```text
/// <root>/nodes/<node>/<node>.json
/// <root>/tenants/<tenant>/<tenant>.json
/// <root>/podlist/podlist.json
/// ```
///
/// Every directory also holds the `lock` file guarding its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    root: PathBuf,
}

impl StoreConfig {
    /// Creates a configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// State root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the record of `node`.
    #[must_use]
    pub fn node_dir(&self, node: &str) -> PathBuf {
        self.root.join("nodes").join(node)
    }

    /// Parent directory of every tenant record.
    #[must_use]
    pub fn tenants_dir(&self) -> PathBuf {
        self.root.join("tenants")
    }

    /// Directory holding the record of `tenant`.
    #[must_use]
    pub fn tenant_dir(&self, tenant: &str) -> PathBuf {
        self.tenants_dir().join(tenant)
    }

    /// Directory holding the pod index.
    #[must_use]
    pub fn pod_index_dir(&self) -> PathBuf {
        self.root.join("podlist")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_DIR)
    }
}
