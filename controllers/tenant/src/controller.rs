//! Main controller implementation.
//!
//! Initializes the node and queues removal of tenants deleted while it was
//! down. The probe server, the work queue worker and both watchers then run
//! as background tasks until a shutdown signal arrives or one of them fails.

use crate::cluster::{ClusterApi, KubeCluster};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::probes::{self, ProbeState};
use crate::queue::{self, RetryPolicy, WorkQueue};
use crate::reconciler::Reconciler;
use crate::startup;
use crate::watcher::Watcher;
use crds::Tenant;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use net_backend::{NetlinkBackend, NetworkBackend};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

type TaskResult = (&'static str, Result<(), ControllerError>);

/// Per-node tenant controller.
pub struct Controller {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<TaskResult>,
}

impl Controller {
    /// Initializes the node and starts every background task.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Tenant Controller for node {}", config.node_name);

        let client = Client::try_default().await?;
        let kube_cluster = KubeCluster::new(client.clone(), &config.node_name);
        if config.register_crd {
            kube_cluster.register_tenant_crd().await?;
        }
        let cluster: Arc<dyn ClusterApi> = Arc::new(kube_cluster);
        let backend: Arc<dyn NetworkBackend> = Arc::new(NetlinkBackend::connect()?);
        let metrics = Arc::new(Metrics::new()?);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        // Liveness must answer while the node is still being initialized.
        let probe_state = ProbeState::new(metrics.clone());
        let probe_addr = config.probe_addr;
        let probe_shutdown = shutdown_rx.clone();
        let probe_server_state = probe_state.clone();
        tasks.spawn(async move {
            ("probe server", probes::serve(probe_addr, probe_server_state, probe_shutdown).await)
        });

        startup::initialize_node(cluster.as_ref(), backend.as_ref(), &config).await?;
        startup::register_default_tenant(cluster.as_ref(), &config).await?;
        probe_state.set_ready(true);

        let tenant_api: Api<Tenant> = match &config.namespace {
            Some(namespace) => Api::namespaced(client.clone(), namespace),
            None => Api::all(client.clone()),
        };
        let pod_api: Api<Pod> = Api::all(client);

        let (work_queue, work_rx) = WorkQueue::new();
        for orphan in startup::collect_orphans(cluster.as_ref(), &config).await? {
            work_queue.enqueue(orphan);
        }
        let config = Arc::new(config);
        let reconciler = Arc::new(Reconciler::new(cluster, backend, config.clone(), metrics.clone()));
        let watcher = Arc::new(Watcher::new(
            tenant_api,
            pod_api,
            config.node_name.clone(),
            config.store.clone(),
            work_queue.clone(),
        ));

        let worker_shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            queue::run_worker(reconciler, work_queue, work_rx, worker_shutdown, metrics, RetryPolicy::default()).await;
            ("worker", Ok(()))
        });

        let tenant_watcher = watcher.clone();
        let tenant_shutdown = shutdown_rx.clone();
        tasks.spawn(async move { ("tenant watcher", tenant_watcher.watch_tenants(tenant_shutdown).await) });

        tasks.spawn(async move { ("pod watcher", watcher.watch_pods(shutdown_rx).await) });

        Ok(Self { shutdown, tasks })
    }

    /// Runs until a shutdown signal arrives or a background task exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Tenant Controller running");

        let mut failure = None;
        tokio::select! {
            () = shutdown_signal() => info!("Shutdown signal received"),
            Some(joined) = self.tasks.join_next() => {
                failure = task_failure(joined);
            }
        }

        // Receivers may already be gone; nothing to notify then.
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Some(e) = task_failure(joined) {
                failure.get_or_insert(e);
            }
        }

        info!("Tenant Controller stopped");
        failure.map_or(Ok(()), Err)
    }
}

fn task_failure(joined: Result<TaskResult, JoinError>) -> Option<ControllerError> {
    match joined {
        Ok((name, Ok(()))) => {
            info!("{} exited", name);
            None
        }
        Ok((name, Err(e))) => {
            error!("{} failed: {}", name, e);
            Some(e)
        }
        Err(e) => {
            error!("Background task panicked: {}", e);
            Some(ControllerError::Watch(format!("background task panicked: {e}")))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
