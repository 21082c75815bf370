//! # Controller Configuration
//!
//! The declarative configuration of the controller itself: which repository
//! to watch, which environments to reconcile, where durable state lives,
//! and the deployment policy per environment.
//!
//! Loaded from a YAML file (default `controller.yaml`, overridable via the
//! `CONTROLLER_CONFIG` environment variable) and validated strictly at
//! startup — a misconfigured controller refuses to start rather than
//! reconcile with surprising behavior.
//!
//! ## Example
//!
//! ```yaml
//! repository:
//!   url: https://git.example.com/geo/config.git
//!   branch: main
//! target:
//!   baseUrl: http://localhost:9090
//! pollInterval: 30s
//! environments:
//!   - name: staging
//!     path: environments/staging
//!     policy:
//!       autoRollback: true
//!   - name: production
//!     path: environments/production
//!     policy:
//!       requiresApproval: true
//!       approvalTimeout: 1h
//!       allowedDays: [monday, tuesday, wednesday, thursday, friday]
//!       allowedHours: { start: "09:00", end: "17:00" }
//!       autoRollback: true
//! ```

pub mod duration;
pub mod policy;

use crate::constants::{
    DEFAULT_ADAPTER_TIMEOUT, DEFAULT_DECISION_DIR, DEFAULT_GIT_TIMEOUT, DEFAULT_MIRROR_DIR,
    DEFAULT_POLL_INTERVAL, DEFAULT_STATE_DIR, MIN_POLL_INTERVAL_SECS,
};
use anyhow::{Context, Result};
use duration::{parse_duration, validate_duration};
use policy::DeploymentPolicy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

static ENVIRONMENT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("environment name regex is valid")
});

/// Top-level controller configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ControllerConfig {
    /// Repository holding the declarative geospatial configuration
    pub repository: RepositoryConfig,
    /// Running geospatial server the controller pushes configuration into
    pub target: TargetConfig,
    /// Environments to reconcile, each with its own watcher loop
    pub environments: Vec<EnvironmentConfig>,
    /// Repository polling interval ("30s", "1m", ...)
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    /// Directory for durable per-environment state documents
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory watched for approval decision files
    #[serde(default = "default_decision_dir")]
    pub decision_dir: PathBuf,
    /// Directory holding per-environment repository working copies
    #[serde(default = "default_mirror_dir")]
    pub mirror_dir: PathBuf,
}

/// Repository access settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Clone URL (https, ssh, or a local path for tests)
    pub url: String,
    /// Branch to watch
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Timeout for a single git operation ("30s", ...)
    #[serde(default = "default_git_timeout")]
    pub operation_timeout: String,
}

/// Target geospatial server admin API settings
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TargetConfig {
    /// Base URL of the server's admin REST API
    pub base_url: String,
    /// Optional bearer token for the admin API
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Timeout for a single adapter call ("30s", ...)
    #[serde(default = "default_adapter_timeout")]
    pub request_timeout: String,
}

/// One watched environment
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Environment name, used in state file names and API paths
    pub name: String,
    /// Path prefix inside the repository that belongs to this environment
    pub path: String,
    /// Branch override; defaults to the repository branch
    #[serde(default)]
    pub branch: Option<String>,
    /// Deployment policy for this environment
    #[serde(default)]
    pub policy: DeploymentPolicy,
}

fn default_poll_interval() -> String {
    DEFAULT_POLL_INTERVAL.to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_git_timeout() -> String {
    DEFAULT_GIT_TIMEOUT.to_string()
}

fn default_adapter_timeout() -> String {
    DEFAULT_ADAPTER_TIMEOUT.to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_decision_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DECISION_DIR)
}

fn default_mirror_dir() -> PathBuf {
    PathBuf::from(DEFAULT_MIRROR_DIR)
}

impl ControllerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Strict startup validation. Rejects empty or duplicate environments,
    /// malformed durations, bad scheduling windows, and non-HTTP target URLs.
    pub fn validate(&self) -> Result<()> {
        if self.environments.is_empty() {
            return Err(anyhow::anyhow!("At least one environment must be configured"));
        }

        let mut seen = HashSet::new();
        for env in &self.environments {
            if !ENVIRONMENT_NAME_RE.is_match(&env.name) {
                return Err(anyhow::anyhow!(
                    "Invalid environment name '{}': must match [a-z0-9][a-z0-9-]*",
                    env.name
                ));
            }
            if !seen.insert(env.name.as_str()) {
                return Err(anyhow::anyhow!("Duplicate environment name '{}'", env.name));
            }
            if env.path.trim().is_empty() || env.path.starts_with('/') {
                return Err(anyhow::anyhow!(
                    "environment '{}': path must be a non-empty repository-relative prefix",
                    env.name
                ));
            }
            env.policy.validate(&env.name)?;
        }

        if self.repository.url.trim().is_empty() {
            return Err(anyhow::anyhow!("repository.url cannot be empty"));
        }

        if !self.target.base_url.starts_with("http://") && !self.target.base_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "target.baseUrl must be an http(s) URL, got '{}'",
                self.target.base_url
            ));
        }

        validate_duration(&self.poll_interval, "pollInterval", MIN_POLL_INTERVAL_SECS)?;
        validate_duration(&self.repository.operation_timeout, "repository.operationTimeout", 1)?;
        validate_duration(&self.target.request_timeout, "target.requestTimeout", 1)?;

        Ok(())
    }

    #[must_use]
    pub fn poll_interval_duration(&self) -> Duration {
        parse_duration(&self.poll_interval).unwrap_or_else(|_| Duration::from_secs(30))
    }

    /// Environment lookup by name
    #[must_use]
    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.iter().find(|e| e.name == name)
    }
}

impl RepositoryConfig {
    #[must_use]
    pub fn operation_timeout_duration(&self) -> Duration {
        parse_duration(&self.operation_timeout).unwrap_or_else(|_| Duration::from_secs(30))
    }
}

impl TargetConfig {
    #[must_use]
    pub fn request_timeout_duration(&self) -> Duration {
        parse_duration(&self.request_timeout).unwrap_or_else(|_| Duration::from_secs(30))
    }
}

impl EnvironmentConfig {
    /// Branch this environment tracks
    #[must_use]
    pub fn branch<'a>(&'a self, repository: &'a RepositoryConfig) -> &'a str {
        self.branch.as_deref().unwrap_or(&repository.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
repository:
  url: https://git.example.com/geo/config.git
target:
  baseUrl: http://localhost:9090
environments:
  - name: staging
    path: environments/staging
"#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: ControllerConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.poll_interval, "30s");
        assert_eq!(config.repository.branch, "main");
        assert_eq!(config.environments[0].branch(&config.repository), "main");
        assert!(!config.environments[0].policy.requires_approval);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = format!("{}\nsurprise: true\n", minimal_yaml());
        assert!(serde_yaml::from_str::<ControllerConfig>(&yaml).is_err());
    }

    #[test]
    fn test_duplicate_environments_rejected() {
        let yaml = r#"
repository:
  url: https://git.example.com/geo/config.git
target:
  baseUrl: http://localhost:9090
environments:
  - name: staging
    path: environments/staging
  - name: staging
    path: environments/staging2
"#;
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_environment_name_rejected() {
        let yaml = r#"
repository:
  url: https://git.example.com/geo/config.git
target:
  baseUrl: http://localhost:9090
environments:
  - name: "Staging!"
    path: environments/staging
"#;
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_absolute_path_rejected() {
        let yaml = r#"
repository:
  url: https://git.example.com/geo/config.git
target:
  baseUrl: http://localhost:9090
environments:
  - name: staging
    path: /environments/staging
"#;
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_http_target_rejected() {
        let yaml = r#"
repository:
  url: https://git.example.com/geo/config.git
target:
  baseUrl: ftp://localhost:9090
environments:
  - name: staging
    path: environments/staging
"#;
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_full_policy_parses() {
        let yaml = r#"
repository:
  url: https://git.example.com/geo/config.git
  branch: release
target:
  baseUrl: http://localhost:9090
pollInterval: 1m
environments:
  - name: production
    path: environments/production
    policy:
      requiresApproval: true
      approvalTimeout: 2h
      allowedDays: [monday, friday]
      allowedHours: { start: "09:00", end: "17:00" }
      autoRollback: true
      minimumRiskLevelForApproval: medium
"#;
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        let policy = &config.environments[0].policy;
        assert!(policy.requires_approval);
        assert!(policy.auto_rollback);
        assert_eq!(
            policy.minimum_risk_level_for_approval,
            Some(crate::config::policy::RiskLevel::Medium)
        );
    }
}
