//! # Deployment Policy
//!
//! Per-environment policy controlling when a plan needs human sign-off,
//! which scheduling windows deployments may run in, and whether a failed
//! apply rolls back automatically.

use crate::config::duration::parse_duration;
use crate::constants::DEFAULT_APPROVAL_TIMEOUT;
use anyhow::Result;
use chrono::{NaiveTime, Weekday};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Coarse classification of failure likelihood/impact for a change.
/// Variant order matters: derived `Ord` gives `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Day of week for scheduling windows.
///
/// Defined locally (rather than re-using `chrono::Weekday`) so the config
/// schema stays self-contained and serializes as lowercase day names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl From<Weekday> for DayOfWeek {
    fn from(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Monday,
            Weekday::Tue => Self::Tuesday,
            Weekday::Wed => Self::Wednesday,
            Weekday::Thu => Self::Thursday,
            Weekday::Fri => Self::Friday,
            Weekday::Sat => Self::Saturday,
            Weekday::Sun => Self::Sunday,
        }
    }
}

/// Daily time window in which gated deployments may start.
/// Times are "HH:MM" strings, interpreted in UTC, start inclusive / end exclusive.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AllowedHours {
    pub start: String,
    pub end: String,
}

impl AllowedHours {
    /// Parse both bounds, validating format and ordering.
    pub fn window(&self) -> Result<(NaiveTime, NaiveTime)> {
        let start = parse_hhmm(&self.start)?;
        let end = parse_hhmm(&self.end)?;
        if start >= end {
            return Err(anyhow::anyhow!(
                "allowedHours start '{}' must be before end '{}'",
                self.start,
                self.end
            ));
        }
        Ok((start, end))
    }

    /// Whether `time` falls inside the window. Malformed bounds are treated
    /// as closed; validation rejects them at startup.
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        match self.window() {
            Ok((start, end)) => time >= start && time < end,
            Err(_) => false,
        }
    }
}

fn parse_hhmm(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| anyhow::anyhow!("Invalid time '{}', expected HH:MM: {}", value, e))
}

/// Deployment policy for one environment.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeploymentPolicy {
    /// Force human approval for every plan, regardless of risk
    #[serde(default)]
    pub requires_approval: bool,
    /// How long an approval request stays open before expiring ("1h", "30m", ...)
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout: String,
    /// Days of week on which gated deployments may start.
    /// Empty set means any day.
    #[serde(default)]
    pub allowed_days: BTreeSet<DayOfWeek>,
    /// Optional daily time window for gated deployments (UTC)
    #[serde(default)]
    pub allowed_hours: Option<AllowedHours>,
    /// Re-apply the last successful configuration automatically when an
    /// apply fails
    #[serde(default)]
    pub auto_rollback: bool,
    /// Plans at or above this risk level require approval even when
    /// `requiresApproval` is false. Unset disables risk-based gating;
    /// breaking changes and migrations still force approval.
    #[serde(default)]
    pub minimum_risk_level_for_approval: Option<RiskLevel>,
}

fn default_approval_timeout() -> String {
    DEFAULT_APPROVAL_TIMEOUT.to_string()
}

impl Default for DeploymentPolicy {
    fn default() -> Self {
        Self {
            requires_approval: false,
            approval_timeout: default_approval_timeout(),
            allowed_days: BTreeSet::new(),
            allowed_hours: None,
            auto_rollback: false,
            minimum_risk_level_for_approval: None,
        }
    }
}

impl DeploymentPolicy {
    /// Parsed approval timeout. Validation guarantees this parses after
    /// startup; a malformed value here falls back to the default.
    #[must_use]
    pub fn approval_timeout_duration(&self) -> Duration {
        parse_duration(&self.approval_timeout)
            .unwrap_or_else(|_| Duration::from_secs(3600))
    }

    /// Whether `day` is inside the allowed days (empty set allows all days)
    #[must_use]
    pub fn allows_day(&self, day: DayOfWeek) -> bool {
        self.allowed_days.is_empty() || self.allowed_days.contains(&day)
    }

    pub fn validate(&self, environment: &str) -> Result<()> {
        parse_duration(&self.approval_timeout).map_err(|e| {
            anyhow::anyhow!("environment '{}': approvalTimeout: {}", environment, e)
        })?;
        if let Some(hours) = &self.allowed_hours {
            hours
                .window()
                .map_err(|e| anyhow::anyhow!("environment '{}': {}", environment, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn test_allowed_hours_window() {
        let hours = AllowedHours {
            start: "09:00".to_string(),
            end: "17:00".to_string(),
        };
        assert!(hours.contains(NaiveTime::from_hms_opt(9, 0, 0).unwrap()));
        assert!(hours.contains(NaiveTime::from_hms_opt(12, 30, 0).unwrap()));
        // End is exclusive
        assert!(!hours.contains(NaiveTime::from_hms_opt(17, 0, 0).unwrap()));
        assert!(!hours.contains(NaiveTime::from_hms_opt(8, 59, 0).unwrap()));
    }

    #[test]
    fn test_allowed_hours_rejects_inverted_window() {
        let hours = AllowedHours {
            start: "17:00".to_string(),
            end: "09:00".to_string(),
        };
        assert!(hours.window().is_err());
    }

    #[test]
    fn test_empty_allowed_days_allows_everything() {
        let policy = DeploymentPolicy::default();
        assert!(policy.allows_day(DayOfWeek::Saturday));
        assert!(policy.allows_day(DayOfWeek::Monday));
    }

    #[test]
    fn test_allowed_days_restricts() {
        let policy = DeploymentPolicy {
            allowed_days: [DayOfWeek::Monday, DayOfWeek::Friday].into_iter().collect(),
            ..DeploymentPolicy::default()
        };
        assert!(policy.allows_day(DayOfWeek::Monday));
        assert!(!policy.allows_day(DayOfWeek::Saturday));
    }

    #[test]
    fn test_policy_validation_catches_bad_timeout() {
        let policy = DeploymentPolicy {
            approval_timeout: "soon".to_string(),
            ..DeploymentPolicy::default()
        };
        assert!(policy.validate("dev").is_err());
    }
}
