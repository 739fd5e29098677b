//! Tenant Controller
//!
//! Runs on every node as part of a DaemonSet. Reconciles `Tenant` resources
//! into per-node state shared with the CNI plugin:
//! - a subnet of the node's pod CIDR per tenant
//! - a bridge per tenant, and a VXLAN device once the tenant spans nodes
//! - ARP/FDB/route entries towards peer nodes
//! - forwarding rules isolating tenants from each other

mod backoff;
mod cluster;
mod config;
mod controller;
mod error;
mod metrics;
mod probes;
mod queue;
mod reconciler;
mod startup;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube's rustls client needs a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Tenant Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Node: {}", config.node_name);
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  State directory: {}", config.store.root().display());
    info!("  Subnet prefix: /{}", config.subnet_prefix);
    info!("  Probe address: {}", config.probe_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
