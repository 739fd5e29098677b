//! Invocation parameters
//!
//! `cni_plugin::Cni` carries the container, interface and namespace. Pod
//! identity only travels in `CNI_ARGS`, as `K8S_POD_NAMESPACE` and
//! `K8S_POD_NAME` among other `K=V` pairs separated by `;`.

use std::path::Path;

/// What one ADD, DEL or CHECK is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Runtime container ID
    pub container_id: String,
    /// Pod network namespace path, empty when the runtime already removed it
    pub netns: String,
    /// Interface name to create inside the pod
    pub if_name: String,
    /// `namespace/name` of the pod, when the runtime named it
    pub pod: Option<String>,
}

impl Invocation {
    /// Builds an invocation from the parameters decoded by `cni_plugin` and
    /// the raw `CNI_ARGS` value.
    pub fn new(container_id: String, netns: Option<&Path>, if_name: String, cni_args: Option<&str>) -> Self {
        Self {
            container_id,
            netns: netns.map(|p| p.display().to_string()).unwrap_or_default(),
            if_name,
            pod: cni_args.and_then(pod_from_cni_args),
        }
    }
}

/// Pod index key named by `CNI_ARGS`. The namespace defaults to `default`.
#[must_use]
pub fn pod_from_cni_args(cni_args: &str) -> Option<String> {
    let arg = |key: &str| {
        cni_args
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    };
    let name = arg("K8S_POD_NAME")?;
    Some(tenant_ipam::pod_key(arg("K8S_POD_NAMESPACE").unwrap_or("default"), name))
}
