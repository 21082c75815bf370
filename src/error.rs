//! # Error Taxonomy
//!
//! Typed errors for the reconciliation pipeline.
//!
//! Every failure mode of a reconciliation cycle maps onto exactly one
//! variant, and every variant has a stable `kind()` string that is recorded
//! on the deployment record and used as a metrics label. Nothing is
//! swallowed: the pipeline attaches the error to the record's
//! `error_message`/`state_history` before any state transition.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Network or authentication failure talking to the repository.
    /// Retried implicitly by the next tick; never fails a deployment on its
    /// own because no record has been created yet when fetch fails.
    #[error("transient git failure: {0}")]
    TransientGit(String),

    /// Malformed declarative configuration at the target commit. The whole
    /// load fails; the environment stays on its last good commit.
    #[error("configuration parse failure: {0}")]
    Parse(String),

    /// Internal diff invariant violated while building a plan. Fatal for
    /// this commit; nothing is applied.
    #[error("plan invariant violated: {0}")]
    Plan(String),

    /// Target-system adapter failure. Triggers rollback when the policy
    /// allows it, otherwise the deployment stays Failed for an operator.
    #[error("apply failure: {0}")]
    Apply(String),

    /// No decision arrived before the approval request expired.
    #[error("approval timed out for deployment {deployment_id}")]
    ApprovalTimeout { deployment_id: String },

    /// A responder explicitly rejected the deployment.
    #[error("approval rejected by {responder}")]
    ApprovalRejected { responder: String },

    /// I/O failure persisting the per-environment state document. The most
    /// severe failure: the in-flight reconciliation aborts rather than risk
    /// an unrecorded mutation, and the environment is reported Unhealthy.
    #[error("state store failure: {0}")]
    StateStore(String),
}

impl ReconcileError {
    /// Stable machine-readable discriminator, used as the `error_kind` on
    /// deployment records and as a metrics label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientGit(_) => "transient-git",
            Self::Parse(_) => "parse",
            Self::Plan(_) => "plan",
            Self::Apply(_) => "apply",
            Self::ApprovalTimeout { .. } => "approval-timeout",
            Self::ApprovalRejected { .. } => "approval-rejected",
            Self::StateStore(_) => "state-store",
        }
    }

    /// Whether the next tick may retry this cycle without operator action.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientGit(_))
    }
}
