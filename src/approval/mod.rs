//! # Approval Gate
//!
//! Evaluates a deployment policy against a plan and the current time, and
//! manages the human-approval state machine.
//!
//! The gate never blocks: a pending approval is re-checked on every watcher
//! tick (decision posted? request expired?), keeping the per-pending-
//! approval cost O(1) regardless of how many environments wait. Scheduling
//! windows are checked before a request is opened — outside the window the
//! deployment simply stays Pending and is re-evaluated next tick.

pub mod channel;

use crate::config::policy::DeploymentPolicy;
use crate::plan::DeploymentPlan;
use crate::state::{ApprovalRequest, ApprovalState};
use channel::{ApprovalDecision, Decision, DecisionChannel};
use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of evaluating the gate for a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Policy does not gate this plan; apply immediately
    NotRequired,
    /// Approval is needed but the scheduling window is closed; stay Pending
    /// and re-evaluate next tick
    Deferred,
    /// Approval is needed and the window is open; open a request
    Required,
}

/// Resolution of a pending approval request after one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    StillPending,
    Approved { responder: String },
    Rejected { responder: String },
    Expired,
}

#[derive(Clone)]
pub struct ApprovalGate {
    channel: Arc<dyn DecisionChannel>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate").finish_non_exhaustive()
    }
}

impl ApprovalGate {
    #[must_use]
    pub fn new(channel: Arc<dyn DecisionChannel>) -> Self {
        Self { channel }
    }

    /// Decide whether `plan` needs human sign-off under `policy` at `now`.
    ///
    /// Pure: the same (plan, policy, now) always produces the same answer.
    #[must_use]
    pub fn evaluate(
        &self,
        plan: &DeploymentPlan,
        policy: &DeploymentPolicy,
        now: DateTime<Utc>,
    ) -> GateDecision {
        let needs_approval = policy.requires_approval
            || policy
                .minimum_risk_level_for_approval
                .is_some_and(|minimum| plan.risk_level >= minimum)
            || plan.has_breaking_changes
            || plan.has_migrations;

        if !needs_approval {
            return GateDecision::NotRequired;
        }

        if !Self::within_window(policy, now) {
            return GateDecision::Deferred;
        }

        GateDecision::Required
    }

    /// Scheduling window check: day first, then hours.
    fn within_window(policy: &DeploymentPolicy, now: DateTime<Utc>) -> bool {
        if !policy.allows_day(now.weekday().into()) {
            return false;
        }
        match &policy.allowed_hours {
            Some(hours) => hours.contains(now.time()),
            None => true,
        }
    }

    /// Open a new approval request for a deployment.
    #[must_use]
    pub fn open_request(
        &self,
        environment: &str,
        deployment_id: &str,
        policy: &DeploymentPolicy,
        now: DateTime<Utc>,
    ) -> ApprovalRequest {
        let timeout = chrono::Duration::from_std(policy.approval_timeout_duration())
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        info!(
            "Opening approval request for deployment {} in {} (expires {})",
            deployment_id,
            environment,
            now + timeout
        );
        ApprovalRequest {
            deployment_id: deployment_id.to_string(),
            environment: environment.to_string(),
            requested_at: now,
            expires_at: now + timeout,
            state: ApprovalState::Pending,
            responder: None,
            responded_at: None,
        }
    }

    /// One non-blocking poll of a pending request: expiry first, then the
    /// decision channel. Mutates the request in place so the caller can
    /// persist the resolved state.
    pub async fn poll(
        &self,
        request: &mut ApprovalRequest,
        now: DateTime<Utc>,
    ) -> anyhow::Result<PollOutcome> {
        if request.state != ApprovalState::Pending {
            // Already resolved; nothing to poll
            return Ok(match request.state {
                ApprovalState::Approved => PollOutcome::Approved {
                    responder: request.responder.clone().unwrap_or_default(),
                },
                ApprovalState::Rejected => PollOutcome::Rejected {
                    responder: request.responder.clone().unwrap_or_default(),
                },
                ApprovalState::Expired => PollOutcome::Expired,
                ApprovalState::Pending => unreachable!(),
            });
        }

        if request.is_expired(now) {
            request.state = ApprovalState::Expired;
            request.responded_at = Some(now);
            return Ok(PollOutcome::Expired);
        }

        match self.channel.take_decision(&request.deployment_id).await? {
            Some(ApprovalDecision {
                decision: Decision::Approve,
                responder,
                ..
            }) => {
                request.state = ApprovalState::Approved;
                request.responder = Some(responder.clone());
                request.responded_at = Some(now);
                Ok(PollOutcome::Approved { responder })
            }
            Some(ApprovalDecision {
                decision: Decision::Reject,
                responder,
                ..
            }) => {
                request.state = ApprovalState::Rejected;
                request.responder = Some(responder.clone());
                request.responded_at = Some(now);
                Ok(PollOutcome::Rejected { responder })
            }
            None => {
                debug!(
                    "Approval for deployment {} still pending",
                    request.deployment_id
                );
                Ok(PollOutcome::StillPending)
            }
        }
    }

    /// Mark a request superseded by a newer commit's deployment. Expired,
    /// not silently dropped, so the audit history stays intact.
    pub fn supersede(request: &mut ApprovalRequest, now: DateTime<Utc>) {
        info!(
            "Approval request for deployment {} superseded by a newer commit",
            request.deployment_id
        );
        request.state = ApprovalState::Expired;
        request.responded_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::policy::{AllowedHours, DayOfWeek, RiskLevel};
    use crate::plan::DeploymentPlan;
    use chrono::TimeZone;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// Scripted in-memory channel for gate tests
    #[derive(Default)]
    struct StaticChannel {
        decisions: Mutex<Vec<ApprovalDecision>>,
    }

    #[async_trait::async_trait]
    impl DecisionChannel for StaticChannel {
        async fn post_decision(&self, decision: &ApprovalDecision) -> anyhow::Result<()> {
            self.decisions.lock().unwrap().push(decision.clone());
            Ok(())
        }

        async fn take_decision(
            &self,
            deployment_id: &str,
        ) -> anyhow::Result<Option<ApprovalDecision>> {
            let mut decisions = self.decisions.lock().unwrap();
            let idx = decisions
                .iter()
                .position(|d| d.deployment_id == deployment_id);
            Ok(idx.map(|i| decisions.remove(i)))
        }
    }

    fn gate() -> (Arc<StaticChannel>, ApprovalGate) {
        let channel = Arc::new(StaticChannel::default());
        (Arc::clone(&channel), ApprovalGate::new(channel))
    }

    fn plan(risk: RiskLevel) -> DeploymentPlan {
        DeploymentPlan {
            source_commit: "a".to_string(),
            target_commit: "b".to_string(),
            added: BTreeSet::new(),
            modified: BTreeSet::new(),
            removed: BTreeSet::new(),
            has_migrations: false,
            has_breaking_changes: false,
            risk_level: risk,
        }
    }

    fn weekday_business_hours_policy() -> DeploymentPolicy {
        DeploymentPolicy {
            requires_approval: true,
            allowed_days: [
                DayOfWeek::Monday,
                DayOfWeek::Tuesday,
                DayOfWeek::Wednesday,
                DayOfWeek::Thursday,
                DayOfWeek::Friday,
            ]
            .into_iter()
            .collect(),
            allowed_hours: Some(AllowedHours {
                start: "09:00".to_string(),
                end: "17:00".to_string(),
            }),
            ..DeploymentPolicy::default()
        }
    }

    // 2026-03-07 is a Saturday; 2026-03-09 a Monday
    fn saturday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap()
    }

    fn monday_ten() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_low_risk_plan_needs_no_approval() {
        let (_c, gate) = gate();
        let policy = DeploymentPolicy::default();
        assert_eq!(
            gate.evaluate(&plan(RiskLevel::Low), &policy, monday_ten()),
            GateDecision::NotRequired
        );
    }

    #[test]
    fn test_risk_threshold_triggers_approval() {
        let (_c, gate) = gate();
        let policy = DeploymentPolicy {
            minimum_risk_level_for_approval: Some(RiskLevel::Medium),
            ..DeploymentPolicy::default()
        };
        assert_eq!(
            gate.evaluate(&plan(RiskLevel::High), &policy, monday_ten()),
            GateDecision::Required
        );
        assert_eq!(
            gate.evaluate(&plan(RiskLevel::Low), &policy, monday_ten()),
            GateDecision::NotRequired
        );
        // Unset threshold: even Critical risk alone does not gate
        assert_eq!(
            gate.evaluate(
                &plan(RiskLevel::Critical),
                &DeploymentPolicy::default(),
                monday_ten()
            ),
            GateDecision::NotRequired
        );
    }

    #[test]
    fn test_migrations_force_approval() {
        let (_c, gate) = gate();
        let mut p = plan(RiskLevel::Low);
        p.has_migrations = true;
        assert_eq!(
            gate.evaluate(&p, &DeploymentPolicy::default(), monday_ten()),
            GateDecision::Required
        );
    }

    #[test]
    fn test_breaking_changes_force_approval() {
        let (_c, gate) = gate();
        let mut p = plan(RiskLevel::Low);
        p.has_breaking_changes = true;
        assert_eq!(
            gate.evaluate(&p, &DeploymentPolicy::default(), monday_ten()),
            GateDecision::Required
        );
    }

    #[test]
    fn test_saturday_submission_is_deferred_not_failed() {
        let (_c, gate) = gate();
        let policy = weekday_business_hours_policy();
        assert_eq!(
            gate.evaluate(&plan(RiskLevel::High), &policy, saturday_noon()),
            GateDecision::Deferred
        );
        // Same plan inside the window goes through
        assert_eq!(
            gate.evaluate(&plan(RiskLevel::High), &policy, monday_ten()),
            GateDecision::Required
        );
    }

    #[test]
    fn test_outside_allowed_hours_is_deferred() {
        let (_c, gate) = gate();
        let policy = weekday_business_hours_policy();
        let monday_evening = Utc.with_ymd_and_hms(2026, 3, 9, 18, 0, 0).unwrap();
        assert_eq!(
            gate.evaluate(&plan(RiskLevel::High), &policy, monday_evening),
            GateDecision::Deferred
        );
    }

    #[test]
    fn test_ungated_plan_ignores_windows() {
        // Windows only apply once approval is needed
        let (_c, gate) = gate();
        let policy = DeploymentPolicy {
            allowed_days: [DayOfWeek::Monday].into_iter().collect(),
            ..DeploymentPolicy::default()
        };
        assert_eq!(
            gate.evaluate(&plan(RiskLevel::Low), &policy, saturday_noon()),
            GateDecision::NotRequired
        );
    }

    #[tokio::test]
    async fn test_poll_still_pending_without_decision() {
        let (_c, gate) = gate();
        let policy = DeploymentPolicy::default();
        let mut request = gate.open_request("prod", "d1", &policy, monday_ten());
        let outcome = gate
            .poll(&mut request, monday_ten() + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::StillPending);
        assert_eq!(request.state, ApprovalState::Pending);
    }

    #[tokio::test]
    async fn test_poll_observes_approval() {
        let (channel, gate) = gate();
        let policy = DeploymentPolicy::default();
        let mut request = gate.open_request("prod", "d1", &policy, monday_ten());
        channel
            .post_decision(&ApprovalDecision {
                deployment_id: "d1".to_string(),
                decision: Decision::Approve,
                responder: "ops@example.com".to_string(),
            })
            .await
            .unwrap();
        let outcome = gate
            .poll(&mut request, monday_ten() + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Approved {
                responder: "ops@example.com".to_string()
            }
        );
        assert_eq!(request.state, ApprovalState::Approved);
        assert!(request.responded_at.is_some());
    }

    #[tokio::test]
    async fn test_expiry_wins_over_late_decision() {
        let (channel, gate) = gate();
        let policy = DeploymentPolicy {
            approval_timeout: "1h".to_string(),
            ..DeploymentPolicy::default()
        };
        let mut request = gate.open_request("prod", "d1", &policy, monday_ten());
        channel
            .post_decision(&ApprovalDecision {
                deployment_id: "d1".to_string(),
                decision: Decision::Approve,
                responder: "late@example.com".to_string(),
            })
            .await
            .unwrap();
        let outcome = gate
            .poll(&mut request, monday_ten() + chrono::Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Expired);
        assert_eq!(request.state, ApprovalState::Expired);
    }

    #[tokio::test]
    async fn test_supersede_expires_request() {
        let (_c, gate) = gate();
        let policy = DeploymentPolicy::default();
        let mut request = gate.open_request("prod", "d1", &policy, monday_ten());
        ApprovalGate::supersede(&mut request, monday_ten() + chrono::Duration::minutes(1));
        assert_eq!(request.state, ApprovalState::Expired);
    }
}
