//! # Approval Decision Channel
//!
//! Transport abstraction for human approval decisions. The gate polls the
//! channel on every tick; the transport behind it (files, queue, RPC) can
//! change without touching the state machine.
//!
//! The shipped implementation is a directory of JSON decision files. The
//! daemon's admin API posts through the same channel, so an HTTP approval
//! and a hand-dropped file behave identically.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Verdict an external actor can post for a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decision {
    Approve,
    Reject,
}

/// One decision posted by an external actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub deployment_id: String,
    pub decision: Decision,
    pub responder: String,
}

/// Pluggable decision transport
#[async_trait]
pub trait DecisionChannel: Send + Sync {
    /// Publish a decision for the gate to observe on its next poll
    async fn post_decision(&self, decision: &ApprovalDecision) -> Result<()>;

    /// Consume the decision for `deployment_id`, if one has been posted.
    /// Consuming is destructive: a decision is observed exactly once.
    async fn take_decision(&self, deployment_id: &str) -> Result<Option<ApprovalDecision>>;
}

/// Directory-of-JSON-files channel. One file per deployment id.
#[derive(Debug, Clone)]
pub struct FileDecisionChannel {
    dir: PathBuf,
}

impl FileDecisionChannel {
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn decision_path(&self, deployment_id: &str) -> PathBuf {
        self.dir.join(format!("{deployment_id}.json"))
    }
}

#[async_trait]
impl DecisionChannel for FileDecisionChannel {
    async fn post_decision(&self, decision: &ApprovalDecision) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating decision directory {}", self.dir.display()))?;
        let path = self.decision_path(&decision.deployment_id);
        let bytes = serde_json::to_vec_pretty(decision)?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing decision file {}", path.display()))?;
        debug!("Posted {:?} decision for {}", decision.decision, decision.deployment_id);
        Ok(())
    }

    async fn take_decision(&self, deployment_id: &str) -> Result<Option<ApprovalDecision>> {
        let path = self.decision_path(deployment_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading decision file {}", path.display()));
            }
        };

        let decision: ApprovalDecision = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing decision file {}", path.display()))?;

        if decision.deployment_id != deployment_id {
            warn!(
                "Decision file {} names deployment {}, expected {}; ignoring",
                path.display(),
                decision.deployment_id,
                deployment_id
            );
            return Ok(None);
        }

        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("consuming decision file {}", path.display()))?;
        Ok(Some(decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(id: &str) -> ApprovalDecision {
        ApprovalDecision {
            deployment_id: id.to_string(),
            decision: Decision::Approve,
            responder: "ops@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_post_then_take_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileDecisionChannel::new(dir.path());
        channel.post_decision(&decision("d1")).await.unwrap();
        let taken = channel.take_decision("d1").await.unwrap().unwrap();
        assert_eq!(taken.responder, "ops@example.com");
        assert_eq!(taken.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn test_take_is_destructive() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileDecisionChannel::new(dir.path());
        channel.post_decision(&decision("d1")).await.unwrap();
        assert!(channel.take_decision("d1").await.unwrap().is_some());
        assert!(channel.take_decision("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_take_without_decision_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileDecisionChannel::new(dir.path());
        assert!(channel.take_decision("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mismatched_deployment_id_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FileDecisionChannel::new(dir.path());
        let mut wrong = decision("other");
        wrong.deployment_id = "other".to_string();
        let path = dir.path().join("d1.json");
        tokio::fs::write(&path, serde_json::to_vec(&wrong).unwrap())
            .await
            .unwrap();
        assert!(channel.take_decision("d1").await.unwrap().is_none());
    }
}
