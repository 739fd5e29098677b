//! Start-up tasks run before the watchers begin.

use crate::cluster::ClusterApi;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::queue::TenantEvent;
use crds::{Tenant, TenantNode, TenantSpec, DEFAULT_TENANT};
use ipnet::Ipv4Net;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use net_backend::NetworkBackend;
use tenant_ipam::{NodeIpam, NodeRecord, TenantIpam};
use tracing::info;

/// Seeds the node record from the Node's pod CIDR and internal address and
/// enables IPv4 forwarding.
pub async fn initialize_node(
    cluster: &dyn ClusterApi,
    backend: &dyn NetworkBackend,
    config: &ControllerConfig,
) -> Result<NodeRecord, ControllerError> {
    let node = cluster.get_node(&config.node_name).await?;
    let pod_cidr = node.pod_cidr.ok_or_else(|| {
        ControllerError::InvalidConfig(format!("node {} has no podCIDR", config.node_name))
    })?;
    let node_cidr: Ipv4Net = pod_cidr.parse().map_err(|e| {
        ControllerError::InvalidConfig(format!("node {} has an invalid podCIDR {pod_cidr}: {e}", config.node_name))
    })?;
    let node_ip = node.internal_ip.ok_or_else(|| {
        ControllerError::InvalidConfig(format!("node {} has no InternalIP address", config.node_name))
    })?;

    let record = NodeIpam::open(&config.store, &config.node_name)?.initialize(node_ip, node_cidr, config.subnet_prefix)?;
    info!(
        "Node {} ({}) holds {} with {} free /{} subnets",
        config.node_name,
        node_ip,
        node_cidr,
        record.available_subnets.len(),
        config.subnet_prefix
    );

    backend.enable_ipv4_forwarding().await?;
    Ok(record)
}

/// The default tenant spanning every node of the cluster.
pub fn default_tenant(config: &ControllerConfig, nodes: impl IntoIterator<Item = String>) -> Tenant {
    Tenant {
        metadata: ObjectMeta {
            name: Some(DEFAULT_TENANT.to_string()),
            namespace: Some(config.resource_namespace().to_string()),
            ..Default::default()
        },
        spec: TenantSpec {
            name: DEFAULT_TENANT.to_string(),
            vni: config.default_tenant_vni,
            prefix: config.subnet_prefix,
            nodes: nodes.into_iter().map(TenantNode::new).collect(),
        },
    }
}

/// Creates the default tenant unless it already exists.
///
/// Every node's controller races to do this; losing the race is fine.
pub async fn register_default_tenant(cluster: &dyn ClusterApi, config: &ControllerConfig) -> Result<bool, ControllerError> {
    let nodes = cluster.list_nodes().await?;
    let tenant = default_tenant(config, nodes.into_iter().map(|n| n.name));
    let created = cluster.create_tenant(&tenant).await?;
    if created {
        info!("Created default tenant spanning {} nodes", tenant.spec.nodes.len());
    } else {
        info!("Default tenant already exists");
    }
    Ok(created)
}

/// Delete events for local tenant records whose Tenant object is gone.
///
/// Tenants deleted while the controller was down never show up in the
/// watch, so their devices and subnets would otherwise stay behind. A record
/// without an owner is looked up by its name in the resource namespace.
pub async fn collect_orphans(cluster: &dyn ClusterApi, config: &ControllerConfig) -> Result<Vec<TenantEvent>, ControllerError> {
    let mut orphans = Vec::new();
    for name in TenantIpam::list(&config.store)? {
        let record = TenantIpam::open_existing(&config.store, &name)?.record()?;
        let (namespace, object) = match record.as_ref().and_then(|r| r.owner.as_deref()).and_then(|o| o.split_once('/')) {
            Some((namespace, object)) => (namespace.to_string(), object.to_string()),
            None => (config.resource_namespace().to_string(), name.clone()),
        };
        if cluster.get_tenant(&namespace, &object).await?.is_some() {
            continue;
        }

        info!("Tenant {}/{} is gone, removing its local state", namespace, object);
        orphans.push(TenantEvent::Delete(Tenant {
            metadata: ObjectMeta {
                name: Some(object),
                namespace: Some(namespace),
                ..Default::default()
            },
            spec: TenantSpec {
                vni: record.as_ref().map_or(0, |r| r.vxlan.vni),
                prefix: record.as_ref().map_or(config.subnet_prefix, |r| r.tenant_prefix),
                name,
                nodes: vec![TenantNode::new(config.node_name.clone())],
            },
        }));
    }
    Ok(orphans)
}
