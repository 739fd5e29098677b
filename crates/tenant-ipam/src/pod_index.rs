//! Pod Index
//!
//! Node-wide map from pod to owning tenant. The controller fills it from
//! pod annotations and the CNI plugin reads it to decide which tenant a new
//! pod attaches to. Keys are `namespace/name`.

use crate::config::StoreConfig;
use crate::store::Store;
use crate::Result;
use std::collections::BTreeMap;
use tracing::debug;

const POD_INDEX_NAME: &str = "podlist";

/// Index key of a pod.
#[must_use]
pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Shared pod to tenant map.
#[derive(Debug)]
pub struct PodIndex {
    store: Store<BTreeMap<String, String>>,
}

impl PodIndex {
    /// Opens the pod index, creating it when missing.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            store: Store::open(config.pod_index_dir(), POD_INDEX_NAME)?,
        })
    }

    /// Tenant owning `pod`, if recorded.
    pub fn resolve_tenant(&self, pod: &str) -> Result<Option<String>> {
        self.store.read(|pods| pods.get(pod).cloned())
    }

    /// Records that `pod` belongs to `tenant`.
    pub fn record_pod(&self, pod: &str, tenant: &str) -> Result<()> {
        self.store.update(|pods| {
            debug!("Recording pod {} in tenant {}", pod, tenant);
            pods.insert(pod.to_string(), tenant.to_string());
            Ok(())
        })
    }

    /// Forgets `pod`, returning the tenant it belonged to.
    pub fn forget_pod(&self, pod: &str) -> Result<Option<String>> {
        self.store.update(|pods| {
            let removed = pods.remove(pod);
            if removed.is_some() {
                debug!("Forgot pod {}", pod);
            }
            Ok(removed)
        })
    }

    /// Every pod recorded for `tenant`, sorted by key.
    pub fn pods_of(&self, tenant: &str) -> Result<Vec<String>> {
        self.store.read(|pods| {
            pods.iter()
                .filter(|(_, t)| t.as_str() == tenant)
                .map(|(pod, _)| pod.clone())
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_resolve_forget() {
        let tmp = tempfile::tempdir().unwrap();
        let index = PodIndex::open(&StoreConfig::new(tmp.path())).unwrap();
        let key = pod_key("default", "web-0");

        assert_eq!(index.resolve_tenant(&key).unwrap(), None);
        index.record_pod(&key, "acme").unwrap();
        assert_eq!(index.resolve_tenant(&key).unwrap().as_deref(), Some("acme"));

        assert_eq!(index.forget_pod(&key).unwrap().as_deref(), Some("acme"));
        assert_eq!(index.forget_pod(&key).unwrap(), None);
        assert_eq!(index.resolve_tenant(&key).unwrap(), None);
    }

    #[test]
    fn test_pods_of_tenant() {
        let tmp = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(tmp.path());
        let index = PodIndex::open(&config).unwrap();
        index.record_pod("ns/b", "acme").unwrap();
        index.record_pod("ns/a", "acme").unwrap();
        index.record_pod("ns/c", "other").unwrap();

        // A second handle sees the same document.
        let other = PodIndex::open(&config).unwrap();
        assert_eq!(other.pods_of("acme").unwrap(), vec!["ns/a", "ns/b"]);
        assert!(other.pods_of("nobody").unwrap().is_empty());
        assert!(tmp.path().join("podlist/podlist.json").exists());
    }
}
