//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default HTTP server port for metrics, probes, and the admin API
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default repository polling interval
pub const DEFAULT_POLL_INTERVAL: &str = "30s";

/// Default timeout for a single git subprocess operation
pub const DEFAULT_GIT_TIMEOUT: &str = "30s";

/// Default timeout for a single target-system adapter call
pub const DEFAULT_ADAPTER_TIMEOUT: &str = "30s";

/// Default approval timeout when a policy requires human sign-off
pub const DEFAULT_APPROVAL_TIMEOUT: &str = "1h";

/// Minimum repository polling interval (seconds)
/// Shorter intervals hammer the remote for no benefit
pub const MIN_POLL_INTERVAL_SECS: u64 = 5;

/// Maximum number of deployment records retained per environment.
/// Oldest entries are evicted first.
pub const MAX_DEPLOYMENT_HISTORY: usize = 50;

/// Number of modified resources above which a plan is classified Medium risk
pub const DEFAULT_MODIFIED_RISK_THRESHOLD: usize = 5;

/// Consecutive apply failures after which an environment is reported Unhealthy
pub const UNHEALTHY_APPLY_FAILURE_THRESHOLD: u32 = 2;

/// Fibonacci backoff bounds for a failing watcher loop (minutes)
pub const BACKOFF_MIN_MINUTES: u64 = 1;
pub const BACKOFF_MAX_MINUTES: u64 = 10;

/// Default directory for durable per-environment state documents
pub const DEFAULT_STATE_DIR: &str = "state";

/// Default directory watched for approval decision files
pub const DEFAULT_DECISION_DIR: &str = "decisions";

/// Default directory holding per-environment repository working copies
pub const DEFAULT_MIRROR_DIR: &str = "mirrors";
