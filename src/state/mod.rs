//! # Deployment State Model
//!
//! Durable record of what the controller has done to each environment:
//! the current deployment, the last successful one, a bounded history, and
//! the approval request in flight (if any).
//!
//! State transitions are checked at the type level: a record refuses an
//! illegal transition (`Completed → Applying` and friends) instead of
//! silently corrupting its history. Illegal transitions are programmer
//! errors and surface as plan-invariant failures.

pub mod store;

use crate::constants::MAX_DEPLOYMENT_HISTORY;
use crate::error::ReconcileError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one deployment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentState {
    Pending,
    Applying,
    AwaitingApproval,
    Completed,
    Failed,
    RolledBack,
}

impl DeploymentState {
    /// Legal transitions of the deployment state machine.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use DeploymentState::{
            Applying, AwaitingApproval, Completed, Failed, Pending, RolledBack,
        };
        matches!(
            (self, next),
            (Pending, Applying | AwaitingApproval | Failed)
                | (Applying, AwaitingApproval | Completed | Failed)
                | (AwaitingApproval, Applying | Failed)
                | (Failed, RolledBack)
        )
    }

    /// Terminal states never transition again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Applying => write!(f, "Applying"),
            Self::AwaitingApproval => write!(f, "AwaitingApproval"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::RolledBack => write!(f, "RolledBack"),
        }
    }
}

/// User-visible environment health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Whether the running system matches the repository head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    Unknown,
}

/// One (state, timestamp) step in a deployment's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub state: DeploymentState,
    pub timestamp: DateTime<Utc>,
}

/// Record of one deployment attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: String,
    pub environment: String,
    pub commit: String,
    pub branch: String,
    pub state: DeploymentState,
    pub health: HealthStatus,
    pub sync_status: SyncStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub initiated_by: String,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Stable machine-readable kind of the recorded error
    #[serde(default)]
    pub error_kind: Option<String>,
    pub state_history: Vec<StateTransition>,
}

impl DeploymentRecord {
    #[must_use]
    pub fn new(environment: &str, commit: &str, branch: &str, initiated_by: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            environment: environment.to_string(),
            commit: commit.to_string(),
            branch: branch.to_string(),
            state: DeploymentState::Pending,
            health: HealthStatus::Healthy,
            sync_status: SyncStatus::Unknown,
            started_at: now,
            completed_at: None,
            initiated_by: initiated_by.to_string(),
            error_message: None,
            error_kind: None,
            state_history: vec![StateTransition {
                state: DeploymentState::Pending,
                timestamp: now,
            }],
        }
    }

    /// Move to `next`, appending to the state history. Rejects transitions
    /// the machine does not allow.
    pub fn transition(&mut self, next: DeploymentState) -> Result<(), ReconcileError> {
        if !self.state.can_transition_to(next) {
            return Err(ReconcileError::Plan(format!(
                "illegal deployment state transition {} -> {} for {}",
                self.state, next, self.id
            )));
        }
        self.state = next;
        let now = Utc::now();
        self.state_history.push(StateTransition {
            state: next,
            timestamp: now,
        });
        if next.is_terminal() || next == DeploymentState::Failed {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Attach an error before a transition; nothing is swallowed.
    pub fn record_error(&mut self, error: &ReconcileError) {
        self.error_message = Some(error.to_string());
        self.error_kind = Some(error.kind().to_string());
    }
}

/// Human decision on an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// A pending (or resolved) request for human sign-off
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub deployment_id: String,
    pub environment: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ApprovalState,
    #[serde(default)]
    pub responder: Option<String>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Half the request lifetime has elapsed; used for the Degraded health
    /// signal.
    #[must_use]
    pub fn past_half_timeout(&self, now: DateTime<Utc>) -> bool {
        let half = (self.expires_at - self.requested_at) / 2;
        now >= self.requested_at + half
    }
}

/// Durable per-environment state. One JSON document per environment,
/// persisted across restarts; the single source of truth for what is
/// deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentState {
    pub environment: String,
    #[serde(default)]
    pub current_deployment: Option<DeploymentRecord>,
    #[serde(default)]
    pub last_successful_deployment: Option<DeploymentRecord>,
    /// Commit currently running on the target system. Advances only on
    /// success.
    #[serde(default)]
    pub deployed_commit: Option<String>,
    pub health: HealthStatus,
    pub sync_status: SyncStatus,
    pub last_updated: DateTime<Utc>,
    /// Bounded, ordered history; oldest evicted first
    #[serde(default)]
    pub history: Vec<DeploymentRecord>,
    /// Watcher cursor: last commit observed on the branch, regardless of
    /// deployment outcome. Distinct from `deployed_commit`.
    #[serde(default)]
    pub last_observed_commit: Option<String>,
    /// Approval request in flight, if any. At most one per environment.
    #[serde(default)]
    pub approval: Option<ApprovalRequest>,
    /// Consecutive apply failures, for the Unhealthy signal
    #[serde(default)]
    pub consecutive_apply_failures: u32,
}

impl EnvironmentState {
    #[must_use]
    pub fn new(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            current_deployment: None,
            last_successful_deployment: None,
            deployed_commit: None,
            health: HealthStatus::Healthy,
            sync_status: SyncStatus::Unknown,
            last_updated: Utc::now(),
            history: Vec::new(),
            last_observed_commit: None,
            approval: None,
            consecutive_apply_failures: 0,
        }
    }

    /// Archive a finished deployment into the bounded history.
    pub fn push_history(&mut self, record: DeploymentRecord) {
        self.history.push(record);
        while self.history.len() > MAX_DEPLOYMENT_HISTORY {
            self.history.remove(0);
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}
