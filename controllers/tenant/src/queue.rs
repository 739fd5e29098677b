//! Work queue feeding the reconciler.
//!
//! Watch callbacks push [`TenantEvent`]s; a single worker drains the queue and
//! reconciles one item at a time. Failed items come back after a Fibonacci
//! backoff until they run out of attempts. Shutdown is observed between
//! items, never in the middle of one.

use crate::backoff::FibonacciBackoff;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crds::Tenant;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Items are dropped after this many failed attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// A change to one Tenant, as seen by this node.
#[derive(Debug, Clone)]
pub enum TenantEvent {
    Add(Tenant),
    Update { old: Tenant, new: Tenant },
    Delete(Tenant),
}

impl TenantEvent {
    /// `namespace/name` of the Tenant.
    #[must_use]
    pub fn key(&self) -> String {
        let tenant = match self {
            Self::Add(t) | Self::Delete(t) => t,
            Self::Update { new, .. } => new,
        };
        format!("{}/{}", tenant.namespace().unwrap_or_default(), tenant.name_any())
    }

    /// Lower-case event name, for logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Update { .. } => "update",
            Self::Delete(_) => "delete",
        }
    }
}

/// One queued event and how often it has failed.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub event: TenantEvent,
    pub attempts: u32,
}

/// Sending half of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl WorkQueue {
    /// Creates the queue and the receiver the worker drains.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues a fresh event.
    pub fn enqueue(&self, event: TenantEvent) {
        debug!("Queueing {} for Tenant {}", event.kind(), event.key());
        if self.tx.send(WorkItem { event, attempts: 0 }).is_err() {
            warn!("Work queue closed, dropping event");
        }
    }

    /// Puts a failed item back after `delay`.
    pub fn requeue_after(&self, item: WorkItem, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The worker may have shut down meanwhile.
            let _ = tx.send(item);
        });
    }
}

/// Retry policy of the worker.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: FibonacciBackoff,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: FibonacciBackoff::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Drains the queue until shutdown is signalled or every sender is gone.
pub async fn run_worker(
    reconciler: Arc<Reconciler>,
    queue: WorkQueue,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
) {
    info!("Tenant worker started");
    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        process(&reconciler, &queue, &metrics, retry, item).await;
        if *shutdown.borrow() {
            break;
        }
    }
    info!("Tenant worker stopped");
}

async fn process(reconciler: &Reconciler, queue: &WorkQueue, metrics: &Metrics, retry: RetryPolicy, mut item: WorkItem) {
    let kind = item.event.kind();
    let key = item.event.key();
    info!("Reconciling {} of Tenant {} (attempt {})", kind, key, item.attempts + 1);

    match reconciler.reconcile(&item.event).await {
        Ok(follow_ups) => {
            metrics.record_reconcile(kind, true);
            for event in follow_ups {
                queue.enqueue(event);
            }
        }
        Err(e) => {
            metrics.record_reconcile(kind, false);
            item.attempts += 1;
            if item.attempts >= retry.max_attempts {
                error!("Giving up on {} of Tenant {} after {} attempts: {}", kind, key, item.attempts, e);
                return;
            }
            let delay = retry.backoff.delay_for(item.attempts - 1);
            warn!("Failed to reconcile {} of Tenant {}, retrying in {:?}: {}", kind, key, delay, e);
            queue.requeue_after(item, delay);
        }
    }
}
