//! # GitWatcher
//!
//! One independent polling task per watched environment. Each loop ticks on
//! the configured interval (or earlier when a reconciliation trigger fires),
//! runs the pipeline, and keeps going no matter what a single cycle did —
//! an unhandled error is logged, counted, and retried after a Fibonacci
//! backoff that resets on the next clean cycle.
//!
//! Environments never block each other: they share nothing mutable, each
//! owns its working copy, its state document, and its pipeline.

use crate::constants::{BACKOFF_MAX_MINUTES, BACKOFF_MIN_MINUTES};
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::pipeline::{EnvironmentRuntime, TickOutcome};
use crate::error::ReconcileError;
use crate::observability::metrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};

/// Shared handle the admin API uses to reach one environment's watcher
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    pub name: String,
    /// Early-wake signal: `TriggerReconciliation`
    pub trigger: Arc<Notify>,
    /// Set by `ForceRollback`; consumed by the next cycle
    pub force_rollback: Arc<AtomicBool>,
}

impl EnvironmentHandle {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            trigger: Arc::new(Notify::new()),
            force_rollback: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trigger_reconciliation(&self) {
        info!("Manual reconciliation triggered for {}", self.name);
        self.trigger.notify_one();
    }

    pub fn request_force_rollback(&self) {
        info!("Forced rollback requested for {}", self.name);
        self.force_rollback.store(true, Ordering::SeqCst);
        self.trigger.notify_one();
    }
}

/// Run one environment's watch loop until shutdown.
///
/// `unhealthy` is the process-wide critical flag raised on state-store
/// failures; it feeds the readiness probe.
pub async fn run(
    runtime: Arc<EnvironmentRuntime>,
    handle: EnvironmentHandle,
    poll_interval: Duration,
    unhealthy: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "Watching {} on branch {} every {:?}",
        handle.name, runtime.branch, poll_interval
    );
    let mut backoff = FibonacciBackoff::new(BACKOFF_MIN_MINUTES, BACKOFF_MAX_MINUTES);
    let mut sleep_for = Duration::ZERO;

    loop {
        tokio::select! {
            () = tokio::time::sleep(sleep_for) => {}
            () = handle.trigger.notified() => {
                debug!("Early wake for {}", handle.name);
            }
            _ = shutdown.changed() => {
                info!("Watcher for {} shutting down", handle.name);
                return;
            }
        }

        let started = Instant::now();

        if handle.force_rollback.swap(false, Ordering::SeqCst) {
            if let Err(e) = runtime.force_rollback().await {
                error!("Forced rollback of {} failed: {}", handle.name, e);
                metrics::increment_reconciliation_errors(e.kind());
                flag_if_critical(&e, &unhealthy);
            }
        }

        // A single failed cycle must never terminate the watcher
        match runtime.tick().await {
            Ok(outcome) => {
                backoff.reset();
                sleep_for = poll_interval;
                metrics::observe_reconciliation_duration(started.elapsed().as_secs_f64());
                match outcome {
                    TickOutcome::Idle => debug!("No relevant changes for {}", handle.name),
                    TickOutcome::Reconciled => {
                        info!("Reconciliation cycle for {} finished", handle.name);
                    }
                    TickOutcome::Suspended => {
                        debug!("Deployment for {} is waiting; will re-check next tick", handle.name);
                    }
                }
            }
            Err(e) => {
                metrics::increment_reconciliation_errors(e.kind());
                flag_if_critical(&e, &unhealthy);
                sleep_for = std::cmp::max(poll_interval, backoff.next_backoff());
                error!(
                    "Reconciliation cycle for {} failed ({}), retrying in {:?}: {}",
                    handle.name,
                    e.kind(),
                    sleep_for,
                    e
                );
            }
        }
    }
}

/// A failing state store threatens the "state file is truth" invariant;
/// raise the process-wide critical signal.
fn flag_if_critical(error: &ReconcileError, unhealthy: &Arc<AtomicBool>) {
    if matches!(error, ReconcileError::StateStore(_)) {
        unhealthy.store(true, Ordering::SeqCst);
    }
}
