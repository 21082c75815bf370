//! # Geo Config Controller
//!
//! A GitOps controller that keeps a running geospatial server's declarative
//! configuration (service/layer metadata, datasource bindings) continuously
//! synchronized with a version-controlled source of truth.
//!
//! ## Overview
//!
//! The controller provides GitOps-style configuration management by:
//!
//! 1. **Watching a Git repository** - One polling loop per environment,
//!    diffing against a private observation cursor
//! 2. **Loading declarative files** - Strictly validated service, layer,
//!    and datasource documents at a given commit
//! 3. **Planning** - A pure diff between the deployed and the candidate
//!    configuration, classified by risk
//! 4. **Policy-gated approval** - Human sign-off for risky plans, with
//!    scheduling windows, timeouts, and supersession
//! 5. **Applying** - Datasources before services, fail-fast, with automatic
//!    rollback from a persisted snapshot
//! 6. **Durable state** - Crash-safe per-environment state documents at a
//!    well-known path
//!
//! ## Features
//!
//! - **Single-flight per environment**: never two concurrent applies for
//!   one environment; environments reconcile fully in parallel
//! - **Prometheus metrics**: reconciliation counts, durations, outcomes
//! - **Health probes**: HTTP endpoints for liveness and readiness checks
//! - **Admin API and CLI**: trigger, approve, reject, roll back

pub mod approval;
pub mod apply;
pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod git;
pub mod loader;
pub mod observability;
pub mod plan;
pub mod server;
pub mod state;

pub use config::policy::{DeploymentPolicy, RiskLevel};
pub use config::ControllerConfig;
pub use error::ReconcileError;
pub use loader::document::ConfigurationDocument;
pub use plan::{DeploymentPlan, ResourceKind, ResourceRef};
pub use state::{DeploymentRecord, DeploymentState, EnvironmentState, HealthStatus, SyncStatus};
