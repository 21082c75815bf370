//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `geo_config_reconciliations_total` - Total number of reconciliation cycles
//! - `geo_config_reconciliation_errors_total` - Reconciliation errors by kind
//! - `geo_config_reconciliation_duration_seconds` - Duration of reconciliation cycles
//! - `geo_config_deployments_total` - Finished deployments by outcome
//! - `geo_config_rollbacks_total` - Automatic and forced rollbacks
//! - `geo_config_pending_approvals` - Approval requests currently open
//! - `geo_config_state_write_failures_total` - Failed state document writes

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "geo_config_reconciliations_total",
        "Total number of reconciliation cycles",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "geo_config_reconciliation_errors_total",
            "Total number of reconciliation errors by kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "geo_config_reconciliation_duration_seconds",
            "Duration of reconciliation cycles in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static DEPLOYMENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "geo_config_deployments_total",
            "Finished deployments by outcome",
        ),
        &["outcome"],
    )
    .expect("Failed to create DEPLOYMENTS_TOTAL metric - this should never happen")
});

static ROLLBACKS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "geo_config_rollbacks_total",
        "Total number of rollbacks (automatic and forced)",
    )
    .expect("Failed to create ROLLBACKS_TOTAL metric - this should never happen")
});

static PENDING_APPROVALS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "geo_config_pending_approvals",
        "Approval requests currently open",
    )
    .expect("Failed to create PENDING_APPROVALS metric - this should never happen")
});

static STATE_WRITE_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "geo_config_state_write_failures_total",
        "Failed writes of the durable per-environment state document",
    )
    .expect("Failed to create STATE_WRITE_FAILURES_TOTAL metric - this should never happen")
});

/// Register all metrics with the global registry. Called once at startup.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(DEPLOYMENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ROLLBACKS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PENDING_APPROVALS.clone()))?;
    REGISTRY.register(Box::new(STATE_WRITE_FAILURES_TOTAL.clone()))?;
    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconciliation_duration(seconds: f64) {
    RECONCILIATION_DURATION.observe(seconds);
}

pub fn increment_deployments(outcome: &str) {
    DEPLOYMENTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn increment_rollbacks() {
    ROLLBACKS_TOTAL.inc();
}

pub fn inc_pending_approvals() {
    PENDING_APPROVALS.inc();
}

pub fn dec_pending_approvals() {
    PENDING_APPROVALS.dec();
}

pub fn increment_state_write_failures() {
    STATE_WRITE_FAILURES_TOTAL.inc();
}
