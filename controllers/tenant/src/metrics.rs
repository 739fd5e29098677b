//! Prometheus metrics for the controller.

use crate::error::ControllerError;
use prometheus::{opts, Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};

const NAMESPACE: &str = "tenant_controller";

/// Counters exposed on `/metrics`.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    reconciles: IntCounterVec,
    conflicts: IntCounter,
    subnets_allocated: IntCounter,
    subnets_released: IntCounter,
    local_tenants: IntGauge,
}

impl Metrics {
    /// Creates and registers every metric on a private registry.
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let reconciles = IntCounterVec::new(
            opts!("reconcile_total", "Tenant work items processed").namespace(NAMESPACE),
            &["event", "result"],
        )?;
        let conflicts = IntCounter::with_opts(
            opts!("update_conflicts_total", "Tenant updates retried after a conflict").namespace(NAMESPACE),
        )?;
        let subnets_allocated = IntCounter::with_opts(
            opts!("subnets_allocated_total", "Tenant subnets assigned on this node").namespace(NAMESPACE),
        )?;
        let subnets_released = IntCounter::with_opts(
            opts!("subnets_released_total", "Tenant subnets returned to the node pool").namespace(NAMESPACE),
        )?;
        let local_tenants = IntGauge::with_opts(
            opts!("local_tenants", "Tenants materialized on this node").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(conflicts.clone()))?;
        registry.register(Box::new(subnets_allocated.clone()))?;
        registry.register(Box::new(subnets_released.clone()))?;
        registry.register(Box::new(local_tenants.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            conflicts,
            subnets_allocated,
            subnets_released,
            local_tenants,
        })
    }

    /// Counts one reconciliation of `event`, by outcome.
    pub fn record_reconcile(&self, event: &str, ok: bool) {
        let result = if ok { "success" } else { "error" };
        self.reconciles.with_label_values(&[event, result]).inc();
    }

    /// Counts a Tenant update lost to a concurrent writer.
    pub fn record_conflict(&self) {
        self.conflicts.inc();
    }

    /// Counts a subnet handed to a tenant.
    pub fn record_subnet_allocated(&self) {
        self.subnets_allocated.inc();
    }

    /// Counts a subnet returned to the node pool.
    pub fn record_subnet_released(&self) {
        self.subnets_released.inc();
    }

    /// Sets the number of tenants materialized on this node.
    pub fn set_local_tenants(&self, count: usize) {
        self.local_tenants.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Renders every metric in the Prometheus text format.
    pub fn render(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| ControllerError::Reconciliation(format!("metrics are not UTF-8: {e}")))
    }
}
