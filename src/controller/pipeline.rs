//! # Reconciliation Pipeline
//!
//! One tick of the reconciliation loop for one environment:
//!
//! 1. Resume whatever deployment is already in flight (deferred window,
//!    pending approval, or an apply interrupted by a crash)
//! 2. Fetch and diff the repository against the private observation cursor
//! 3. On a relevant change, supersede any unresolved older deployment and
//!    run detection → load → plan → gate → apply → record
//!
//! The observation cursor advances on every fetch regardless of outcome, so
//! a permanently broken commit is never reprocessed forever — recovery
//! takes a new commit or a manual trigger. The deployed commit only
//! advances on success.
//!
//! Every state transition is persisted before the next side effect, so a
//! crash at any point replays into the same terminal state: plans are
//! deterministic and adapter operations idempotent.

use crate::approval::{ApprovalGate, GateDecision, PollOutcome};
use crate::apply::Applier;
use crate::config::policy::DeploymentPolicy;
use crate::config::EnvironmentConfig;
use crate::constants::UNHEALTHY_APPLY_FAILURE_THRESHOLD;
use crate::error::ReconcileError;
use crate::git::RepositoryMirror;
use crate::loader::document::ConfigurationDocument;
use crate::loader::ConfigurationLoader;
use crate::observability::metrics;
use crate::plan::{self, DeploymentPlan};
use crate::state::store::StateStore;
use crate::state::{
    ApprovalState, DeploymentRecord, DeploymentState, EnvironmentState, HealthStatus, SyncStatus,
};
use chrono::Utc;
use tracing::{error, info, warn};

/// What a tick ended up doing, for watcher logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing relevant changed
    Idle,
    /// A deployment ran to a resting state (Completed, Failed, RolledBack)
    Reconciled,
    /// A deployment is waiting (approval decision or scheduling window)
    Suspended,
}

/// Everything one environment's pipeline needs. Owned by exactly one
/// watcher task; nothing here is shared across environments except the
/// decision channel behind the gate.
pub struct EnvironmentRuntime {
    pub environment: EnvironmentConfig,
    pub branch: String,
    pub mirror: RepositoryMirror,
    pub loader: ConfigurationLoader,
    pub store: StateStore,
    pub gate: ApprovalGate,
    pub applier: Applier,
}

impl std::fmt::Debug for EnvironmentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentRuntime")
            .field("environment", &self.environment.name)
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

impl EnvironmentRuntime {
    fn name(&self) -> &str {
        &self.environment.name
    }

    fn policy(&self) -> &DeploymentPolicy {
        &self.environment.policy
    }

    /// One reconciliation cycle.
    pub async fn tick(&self) -> Result<TickOutcome, ReconcileError> {
        let mut state = self
            .store
            .load_environment(self.name())?
            .unwrap_or_else(|| EnvironmentState::new(self.name()));

        // Resume first: an in-flight deployment must resolve (or stay
        // suspended) before new commits are considered
        let resumed = self.resume_in_flight(&mut state).await?;

        let head = self.mirror.fetch(&self.branch).await?;

        let relevant = match state.last_observed_commit.as_deref() {
            None => true,
            Some(cursor) if cursor == head => false,
            Some(cursor) => {
                let changed = self.mirror.diff(cursor, &head).await?;
                let prefix = &self.environment.path;
                changed.iter().any(|p| p.starts_with(prefix.as_str()))
            }
        };

        let cursor_moved = state.last_observed_commit.as_deref() != Some(head.as_str());
        // The cursor advances on every observed fetch, even when the commit
        // later fails: reprocessing a broken commit forever helps nobody
        state.last_observed_commit = Some(head.clone());

        if !relevant {
            if cursor_moved || resumed != TickOutcome::Idle {
                self.persist(&mut state)?;
            }
            return Ok(resumed);
        }

        info!(
            "Relevant change for {} detected at {} on {}",
            self.name(),
            head,
            self.branch
        );
        metrics::increment_reconciliations();

        self.supersede_unresolved(&mut state, &head)?;

        // If the in-flight deployment already targets this commit, the
        // resume above did the work for this tick
        if let Some(current) = &state.current_deployment {
            if current.commit == head && !matches!(current.state, DeploymentState::Failed) {
                self.persist(&mut state)?;
                return Ok(resumed);
            }
        }

        let outcome = self.start_deployment(&mut state, &head).await?;
        self.persist(&mut state)?;
        Ok(outcome)
    }

    /// Handle whatever is already in flight: deferred windows, pending
    /// approvals, and applies interrupted by a crash.
    async fn resume_in_flight(
        &self,
        state: &mut EnvironmentState,
    ) -> Result<TickOutcome, ReconcileError> {
        let Some(current) = state.current_deployment.clone() else {
            return Ok(TickOutcome::Idle);
        };

        match current.state {
            DeploymentState::Pending => {
                // A gated deployment waiting for its scheduling window, or
                // a crash right after record creation; either way the gate
                // re-evaluates from scratch
                let commit = current.commit.clone();
                self.gate_and_apply(state, &commit).await
            }
            DeploymentState::Applying => {
                // Crash mid-apply; adapter calls are idempotent so replay
                warn!(
                    "Resuming interrupted apply of {} for {}",
                    current.commit,
                    self.name()
                );
                let commit = current.commit.clone();
                self.run_apply(state, &commit).await
            }
            DeploymentState::AwaitingApproval => self.poll_approval(state).await,
            DeploymentState::Completed
            | DeploymentState::Failed
            | DeploymentState::RolledBack => Ok(TickOutcome::Idle),
        }
    }

    /// A newer commit supersedes an unresolved older deployment: the
    /// approval request (if any) is expired, never silently dropped.
    fn supersede_unresolved(
        &self,
        state: &mut EnvironmentState,
        head: &str,
    ) -> Result<(), ReconcileError> {
        let Some(current) = state.current_deployment.as_mut() else {
            return Ok(());
        };
        if current.commit == head
            || current.state.is_terminal()
            || current.state == DeploymentState::Failed
        {
            return Ok(());
        }

        info!(
            "Deployment {} of {} superseded by newer commit {}",
            current.id, current.commit, head
        );
        if let Some(request) = state.approval.as_mut() {
            if request.deployment_id == current.id && request.state == ApprovalState::Pending {
                ApprovalGate::supersede(request, Utc::now());
                metrics::dec_pending_approvals();
            }
        }
        current.error_message = Some(format!("superseded by commit {head}"));
        current.error_kind = Some("superseded".to_string());
        current.transition(DeploymentState::Failed)?;
        metrics::increment_deployments("superseded");
        Ok(())
    }

    /// Create the record for a newly detected commit and run it as far as
    /// policy allows.
    async fn start_deployment(
        &self,
        state: &mut EnvironmentState,
        head: &str,
    ) -> Result<TickOutcome, ReconcileError> {
        let record = DeploymentRecord::new(self.name(), head, &self.branch, "git-watcher");
        info!(
            "Deployment {} created for {} at {}",
            record.id,
            self.name(),
            head
        );
        if let Some(previous) = state.current_deployment.take() {
            state.push_history(previous);
        }
        state.approval = None;
        state.current_deployment = Some(record);
        self.persist(state)?;

        self.gate_and_apply(state, head).await
    }

    /// Load both documents, build the plan, and run it through the gate.
    /// Entered both for fresh deployments and for deferred ones.
    async fn gate_and_apply(
        &self,
        state: &mut EnvironmentState,
        commit: &str,
    ) -> Result<TickOutcome, ReconcileError> {
        let new_doc = match self
            .loader
            .load(&self.mirror, commit, &self.environment.path)
            .await
        {
            Ok(doc) => doc,
            // A transient repository error leaves the record as it is; the
            // next tick retries. Only a malformed commit fails permanently.
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => return self.fail_current(state, e),
        };
        let old_doc = self.deployed_document(state).await?;
        let deployment_plan = match plan::build(&old_doc, &new_doc) {
            Ok(p) => p,
            Err(e) => return self.fail_current(state, e),
        };

        // Empty plan short-circuits straight to Completed; reprocessing the
        // same content is a no-op by construction
        if deployment_plan.is_empty() {
            info!(
                "Empty plan for {} at {}; nothing to apply",
                self.name(),
                commit
            );
            self.with_current(state, |record| {
                record.transition(DeploymentState::Applying)?;
                record.transition(DeploymentState::Completed)
            })?;
            self.mark_success(state, &new_doc)?;
            return Ok(TickOutcome::Reconciled);
        }

        info!(
            "Plan for {} at {}: +{} ~{} -{} risk={}",
            self.name(),
            commit,
            deployment_plan.added.len(),
            deployment_plan.modified.len(),
            deployment_plan.removed.len(),
            deployment_plan.risk_level
        );

        match self
            .gate
            .evaluate(&deployment_plan, self.policy(), Utc::now())
        {
            GateDecision::NotRequired => {
                self.execute_plan(state, &deployment_plan, &new_doc).await
            }
            GateDecision::Deferred => {
                // Outside the scheduling window: stay Pending, re-evaluate
                // next tick
                info!(
                    "Deployment for {} at {} deferred until the next allowed window",
                    self.name(),
                    commit
                );
                self.persist(state)?;
                Ok(TickOutcome::Suspended)
            }
            GateDecision::Required => {
                let current_state = self.current(state)?.state;
                if current_state != DeploymentState::AwaitingApproval {
                    let (environment, deployment_id) = {
                        let record = self.current(state)?;
                        (record.environment.clone(), record.id.clone())
                    };
                    let request = self.gate.open_request(
                        &environment,
                        &deployment_id,
                        self.policy(),
                        Utc::now(),
                    );
                    self.with_current(state, |record| {
                        record.transition(DeploymentState::AwaitingApproval)
                    })?;
                    state.approval = Some(request);
                    metrics::inc_pending_approvals();
                    self.persist(state)?;
                }
                Ok(TickOutcome::Suspended)
            }
        }
    }

    /// Poll the pending approval request: expiry first, then the decision
    /// channel. Non-blocking; cost is O(1) per tick.
    async fn poll_approval(
        &self,
        state: &mut EnvironmentState,
    ) -> Result<TickOutcome, ReconcileError> {
        let Some(mut request) = state.approval.clone() else {
            // No request on record for an AwaitingApproval deployment:
            // treat as expired rather than wait forever
            warn!(
                "Deployment awaiting approval in {} has no approval request; expiring",
                self.name()
            );
            let deployment_id = self.current(state)?.id.clone();
            return self.fail_current(state, ReconcileError::ApprovalTimeout { deployment_id });
        };

        let outcome = match self.gate.poll(&mut request, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // A broken decision channel is transient: keep waiting and
                // re-poll next tick rather than fail the deployment
                warn!("Approval channel error for {}: {:#}", self.name(), e);
                return Ok(TickOutcome::Suspended);
            }
        };
        state.approval = Some(request);

        match outcome {
            PollOutcome::StillPending => {
                let previous_health = state.health;
                self.recompute_health(state);
                if state.health != previous_health {
                    self.persist(state)?;
                }
                Ok(TickOutcome::Suspended)
            }
            PollOutcome::Approved { responder } => {
                info!(
                    "Deployment for {} approved by {}; resuming apply",
                    self.name(),
                    responder
                );
                metrics::dec_pending_approvals();
                let commit = self.current(state)?.commit.clone();
                self.with_current(state, |record| {
                    record.initiated_by = format!("approved-by:{responder}");
                    record.transition(DeploymentState::Applying)
                })?;
                self.persist(state)?;
                self.run_apply(state, &commit).await
            }
            PollOutcome::Rejected { responder } => {
                metrics::dec_pending_approvals();
                self.fail_current(state, ReconcileError::ApprovalRejected { responder })
            }
            PollOutcome::Expired => {
                metrics::dec_pending_approvals();
                let deployment_id = self.current(state)?.id.clone();
                self.fail_current(state, ReconcileError::ApprovalTimeout { deployment_id })
            }
        }
    }

    /// Transition to Applying (when not already there) and execute.
    async fn execute_plan(
        &self,
        state: &mut EnvironmentState,
        deployment_plan: &DeploymentPlan,
        new_doc: &ConfigurationDocument,
    ) -> Result<TickOutcome, ReconcileError> {
        if self.current(state)?.state != DeploymentState::Applying {
            self.with_current(state, |record| {
                record.transition(DeploymentState::Applying)
            })?;
            // Applying is durable before the first adapter call, so a crash
            // here replays the apply instead of forgetting it
            self.persist(state)?;
        }

        match self.applier.apply(deployment_plan, new_doc).await {
            Ok(_outcome) => {
                self.with_current(state, |record| {
                    record.transition(DeploymentState::Completed)
                })?;
                self.mark_success(state, new_doc)?;
                Ok(TickOutcome::Reconciled)
            }
            Err(apply_error) => self.handle_apply_failure(state, apply_error).await,
        }
    }

    /// Rebuild the plan for the in-flight commit and apply it. Used on
    /// approval resumption and crash recovery; determinism of the plan
    /// builder makes the rebuilt plan identical to the original.
    async fn run_apply(
        &self,
        state: &mut EnvironmentState,
        commit: &str,
    ) -> Result<TickOutcome, ReconcileError> {
        let new_doc = match self
            .loader
            .load(&self.mirror, commit, &self.environment.path)
            .await
        {
            Ok(doc) => doc,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => return self.fail_current(state, e),
        };
        let old_doc = self.deployed_document(state).await?;
        let deployment_plan = match plan::build(&old_doc, &new_doc) {
            Ok(p) => p,
            Err(e) => return self.fail_current(state, e),
        };
        self.execute_plan(state, &deployment_plan, &new_doc).await
    }

    /// Apply failed: record it, then roll back if the policy allows.
    async fn handle_apply_failure(
        &self,
        state: &mut EnvironmentState,
        apply_error: ReconcileError,
    ) -> Result<TickOutcome, ReconcileError> {
        error!("Apply failed for {}: {}", self.name(), apply_error);
        metrics::increment_reconciliation_errors(apply_error.kind());
        metrics::increment_deployments("failed");
        state.consecutive_apply_failures += 1;
        self.with_current(state, |record| {
            record.record_error(&apply_error);
            record.transition(DeploymentState::Failed)
        })?;
        state.sync_status = SyncStatus::OutOfSync;
        self.recompute_health(state);
        self.persist(state)?;

        if !self.policy().auto_rollback {
            return Ok(TickOutcome::Reconciled);
        }

        // Roll back from the persisted snapshot, never a fresh repository
        // read: rollback must work while the repository is unreachable
        let snapshot = match self.store.load_snapshot(self.name())? {
            Some(snapshot) => snapshot,
            None => {
                warn!(
                    "Auto-rollback enabled for {} but no successful deployment exists yet",
                    self.name()
                );
                return Ok(TickOutcome::Reconciled);
            }
        };

        info!(
            "Rolling {} back to {} after failed apply",
            self.name(),
            snapshot.commit
        );
        match self.applier.apply_full(&snapshot).await {
            Ok(()) => {
                metrics::increment_rollbacks();
                metrics::increment_deployments("rolled-back");
                self.with_current(state, |record| {
                    record.transition(DeploymentState::RolledBack)
                })?;
                // The running system is back on the old commit; the
                // repository head is still newer
                state.sync_status = SyncStatus::OutOfSync;
                self.recompute_health(state);
                self.persist(state)?;
                Ok(TickOutcome::Reconciled)
            }
            Err(rollback_error) => {
                // Operator required: stays Failed, both errors on the record
                error!(
                    "Rollback of {} also failed: {}",
                    self.name(),
                    rollback_error
                );
                metrics::increment_reconciliation_errors(rollback_error.kind());
                self.with_current(state, |record| {
                    if let Some(message) = record.error_message.as_mut() {
                        message.push_str(&format!("; rollback failed: {rollback_error}"));
                    }
                    Ok(())
                })?;
                state.health = HealthStatus::Unhealthy;
                self.persist(state)?;
                Ok(TickOutcome::Reconciled)
            }
        }
    }

    /// Forced rollback, triggered by an operator: unconditionally re-apply
    /// the last successful snapshot as a new deployment record.
    pub async fn force_rollback(&self) -> Result<TickOutcome, ReconcileError> {
        let mut state = self
            .store
            .load_environment(self.name())?
            .unwrap_or_else(|| EnvironmentState::new(self.name()));

        let Some(snapshot) = self.store.load_snapshot(self.name())? else {
            warn!(
                "Forced rollback requested for {} but no successful deployment exists",
                self.name()
            );
            return Ok(TickOutcome::Idle);
        };

        info!(
            "Forced rollback of {} to {} requested by operator",
            self.name(),
            snapshot.commit
        );
        let mut record =
            DeploymentRecord::new(self.name(), &snapshot.commit, &self.branch, "operator");
        record.transition(DeploymentState::Applying)?;
        if let Some(request) = state.approval.as_mut() {
            if request.state == ApprovalState::Pending {
                ApprovalGate::supersede(request, Utc::now());
                metrics::dec_pending_approvals();
            }
        }
        if let Some(previous) = state.current_deployment.take() {
            state.push_history(previous);
        }
        state.current_deployment = Some(record);
        self.persist(&mut state)?;

        match self.applier.apply_full(&snapshot).await {
            Ok(()) => {
                metrics::increment_rollbacks();
                self.with_current(&mut state, |record| {
                    record.transition(DeploymentState::Completed)
                })?;
                self.mark_success(&mut state, &snapshot)?;
                self.persist(&mut state)?;
                Ok(TickOutcome::Reconciled)
            }
            Err(e) => {
                let outcome = self.fail_current(&mut state, e);
                self.persist(&mut state)?;
                outcome
            }
        }
    }

    /// The document currently running on the target: the persisted snapshot
    /// when it matches the deployed commit, a repository read at the
    /// deployed commit otherwise, and the empty document before any deploy.
    async fn deployed_document(
        &self,
        state: &EnvironmentState,
    ) -> Result<ConfigurationDocument, ReconcileError> {
        let Some(deployed_commit) = state.deployed_commit.as_deref() else {
            return Ok(ConfigurationDocument::empty(&self.environment.path));
        };
        if let Some(snapshot) = self.store.load_snapshot(self.name())? {
            if snapshot.commit == deployed_commit {
                return Ok(snapshot);
            }
        }
        self.loader
            .load(&self.mirror, deployed_commit, &self.environment.path)
            .await
    }

    /// Success bookkeeping: deployed commit and snapshot advance together.
    fn mark_success(
        &self,
        state: &mut EnvironmentState,
        document: &ConfigurationDocument,
    ) -> Result<(), ReconcileError> {
        self.store.save_snapshot(self.name(), document)?;
        state.deployed_commit = Some(document.commit.clone());
        state.consecutive_apply_failures = 0;
        // Synced when the running commit matches the last observed head;
        // a forced rollback to an older commit reports OutOfSync
        state.sync_status = match state.last_observed_commit.as_deref() {
            Some(observed) if observed != document.commit => SyncStatus::OutOfSync,
            _ => SyncStatus::Synced,
        };
        state.last_successful_deployment = state.current_deployment.clone();
        self.recompute_health(state);
        metrics::increment_deployments("completed");
        info!(
            "Deployment of {} completed; deployed commit is now {}",
            self.name(),
            document.commit
        );
        Ok(())
    }

    /// Attach the error and move the current deployment to Failed.
    fn fail_current(
        &self,
        state: &mut EnvironmentState,
        error: ReconcileError,
    ) -> Result<TickOutcome, ReconcileError> {
        error!("Deployment for {} failed: {}", self.name(), error);
        metrics::increment_reconciliation_errors(error.kind());
        metrics::increment_deployments("failed");
        self.with_current(state, |record| {
            record.record_error(&error);
            record.transition(DeploymentState::Failed)
        })?;
        self.recompute_health(state);
        self.persist(state)?;
        Ok(TickOutcome::Reconciled)
    }

    /// Health per the error design: Unhealthy on repeated apply failures,
    /// Degraded when an approval has waited past half its timeout, Healthy
    /// otherwise. State-store failures set Unhealthy at the watcher level.
    fn recompute_health(&self, state: &mut EnvironmentState) {
        let mut health = HealthStatus::Healthy;
        if let Some(request) = &state.approval {
            if request.state == ApprovalState::Pending && request.past_half_timeout(Utc::now()) {
                health = HealthStatus::Degraded;
            }
        }
        if state.consecutive_apply_failures >= UNHEALTHY_APPLY_FAILURE_THRESHOLD {
            health = HealthStatus::Unhealthy;
        }
        state.health = health;
        if let Some(record) = state.current_deployment.as_mut() {
            record.health = health;
            record.sync_status = state.sync_status;
        }
    }

    fn current<'a>(
        &self,
        state: &'a EnvironmentState,
    ) -> Result<&'a DeploymentRecord, ReconcileError> {
        state.current_deployment.as_ref().ok_or_else(|| {
            ReconcileError::Plan(format!(
                "no current deployment for {} where one is required",
                self.name()
            ))
        })
    }

    fn with_current(
        &self,
        state: &mut EnvironmentState,
        f: impl FnOnce(&mut DeploymentRecord) -> Result<(), ReconcileError>,
    ) -> Result<(), ReconcileError> {
        let name = self.name().to_string();
        let record = state.current_deployment.as_mut().ok_or_else(|| {
            ReconcileError::Plan(format!(
                "no current deployment for {name} where one is required"
            ))
        })?;
        f(record)
    }

    /// Persist the state document. A failure here aborts the cycle: the
    /// state file is the source of truth and must never silently diverge.
    fn persist(&self, state: &mut EnvironmentState) -> Result<(), ReconcileError> {
        state.touch();
        self.store.save_environment(state).inspect_err(|_| {
            metrics::increment_state_write_failures();
        })
    }
}
