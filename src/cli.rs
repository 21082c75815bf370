//! # GEOCTL CLI
//!
//! Command-line interface for the Geo Config Controller.
//!
//! Similar to `fluxctl`, this CLI tool allows operators to trigger
//! reconciliations, approve or reject gated deployments, and inspect
//! environment state through the controller's admin API.
//!
//! ## Usage
//!
//! ```bash
//! # List watched environments
//! geoctl list
//!
//! # Show the state of an environment
//! geoctl status production
//!
//! # Trigger reconciliation and wait for the outcome
//! geoctl reconcile production --wait
//!
//! # Approve or reject a pending deployment
//! geoctl approve 7c9e6679-7425-40de-944b-e07fc1f90ae7 --responder ops@example.com
//! geoctl reject 7c9e6679-7425-40de-944b-e07fc1f90ae7 --responder ops@example.com
//!
//! # Roll an environment back to its last successful commit
//! geoctl rollback production
//! ```
//!
//! ## Exit codes
//!
//! - 0: success
//! - 1: validation or communication error
//! - 2: approval timed out or was rejected
//! - 3: apply failed, automatic rollback succeeded
//! - 4: apply failed and rollback also failed (operator required)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geo_config_controller::state::{DeploymentState, EnvironmentState};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Geo Config Controller CLI
#[derive(Parser)]
#[command(name = "geoctl")]
#[command(
    about = "Geo Config Controller CLI",
    long_about = None,
    after_help = "\
Examples:
  geoctl list
  geoctl status production
  geoctl reconcile production --wait
  geoctl approve <deployment-id> --responder ops@example.com
"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Controller admin API base URL
    #[arg(
        short,
        long,
        global = true,
        env = "GEOCTL_SERVER",
        default_value = "http://localhost:8080"
    )]
    server: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List all watched environments
    List,
    /// Show the state of an environment
    Status {
        /// Environment name
        #[arg(value_name = "ENVIRONMENT")]
        environment: String,
    },
    /// Trigger reconciliation for an environment
    Reconcile {
        /// Environment name
        #[arg(value_name = "ENVIRONMENT")]
        environment: String,

        /// Wait for the triggered reconciliation to reach a resting state
        /// and map the outcome onto the exit code
        #[arg(long)]
        wait: bool,

        /// Maximum time to wait, in seconds
        #[arg(long, default_value_t = 600)]
        wait_timeout: u64,
    },
    /// Approve a deployment awaiting sign-off
    Approve {
        /// Deployment id (from `geoctl status`)
        #[arg(value_name = "DEPLOYMENT_ID")]
        deployment_id: String,

        /// Who is approving
        #[arg(long)]
        responder: String,
    },
    /// Reject a deployment awaiting sign-off
    Reject {
        /// Deployment id (from `geoctl status`)
        #[arg(value_name = "DEPLOYMENT_ID")]
        deployment_id: String,

        /// Who is rejecting
        #[arg(long)]
        responder: String,
    },
    /// Roll an environment back to its last successful commit
    Rollback {
        /// Environment name
        #[arg(value_name = "ENVIRONMENT")]
        environment: String,
    },
    /// Print client build information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let client = ApiClient::new(&cli.server)?;

    match cli.command {
        Commands::List => {
            let names = client.list_environments().await?;
            for name in names {
                println!("{name}");
            }
            Ok(0)
        }
        Commands::Status { environment } => {
            let state = client.environment_state(&environment).await?;
            print_status(&state);
            Ok(0)
        }
        Commands::Reconcile {
            environment,
            wait,
            wait_timeout,
        } => {
            let before = client.environment_state(&environment).await.ok();
            client.trigger_reconcile(&environment).await?;
            println!("Reconciliation triggered for {environment}");
            if !wait {
                return Ok(0);
            }
            let outcome = client
                .wait_for_outcome(
                    &environment,
                    before.as_ref(),
                    Duration::from_secs(wait_timeout),
                )
                .await?;
            print_status(&outcome);
            Ok(exit_code_for(&outcome))
        }
        Commands::Approve {
            deployment_id,
            responder,
        } => {
            client.post_decision(&deployment_id, "approve", &responder).await?;
            println!("Approval recorded for deployment {deployment_id}");
            Ok(0)
        }
        Commands::Reject {
            deployment_id,
            responder,
        } => {
            client.post_decision(&deployment_id, "reject", &responder).await?;
            println!("Rejection recorded for deployment {deployment_id}");
            Ok(0)
        }
        Commands::Rollback { environment } => {
            client.force_rollback(&environment).await?;
            println!("Rollback requested for {environment}");
            Ok(0)
        }
        Commands::Version => {
            println!(
                "geoctl {} (build {} at {})",
                env!("CARGO_PKG_VERSION"),
                env!("BUILD_GIT_HASH"),
                env!("BUILD_DATETIME")
            );
            Ok(0)
        }
    }
}

fn print_status(state: &EnvironmentState) {
    println!("environment:      {}", state.environment);
    println!(
        "deployed commit:  {}",
        state.deployed_commit.as_deref().unwrap_or("-")
    );
    println!("health:           {:?}", state.health);
    println!("sync:             {:?}", state.sync_status);
    match &state.current_deployment {
        Some(record) => {
            println!("deployment:       {} ({})", record.id, record.state);
            println!("  commit:         {}", record.commit);
            println!("  initiated by:   {}", record.initiated_by);
            if let Some(message) = &record.error_message {
                println!("  error:          {message}");
            }
        }
        None => println!("deployment:       none"),
    }
    if let Some(request) = &state.approval {
        println!(
            "approval:         {:?} (deployment {}, expires {})",
            request.state, request.deployment_id, request.expires_at
        );
    }
}

/// Map a resting deployment state onto the documented exit codes.
fn exit_code_for(state: &EnvironmentState) -> i32 {
    let Some(record) = &state.current_deployment else {
        return 0;
    };
    match record.state {
        DeploymentState::Completed => 0,
        DeploymentState::RolledBack => 3,
        DeploymentState::Failed => match record.error_kind.as_deref() {
            Some("approval-timeout" | "approval-rejected") => 2,
            Some("apply") => 4,
            _ => 1,
        },
        // Still in flight when the wait gave up
        _ => 1,
    }
}

struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("building HTTP client")?,
        })
    }

    async fn list_environments(&self) -> Result<Vec<String>> {
        let body: serde_json::Value = self
            .get("/environments")
            .await?
            .json()
            .await
            .context("parsing environment list")?;
        Ok(body["environments"]
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn environment_state(&self, environment: &str) -> Result<EnvironmentState> {
        self.get(&format!("/environments/{environment}"))
            .await?
            .json()
            .await
            .context("parsing environment state")
    }

    async fn trigger_reconcile(&self, environment: &str) -> Result<()> {
        self.post(&format!("/environments/{environment}/reconcile"), &json!({}))
            .await?;
        Ok(())
    }

    async fn force_rollback(&self, environment: &str) -> Result<()> {
        self.post(&format!("/environments/{environment}/rollback"), &json!({}))
            .await?;
        Ok(())
    }

    async fn post_decision(
        &self,
        deployment_id: &str,
        action: &str,
        responder: &str,
    ) -> Result<()> {
        self.post(
            &format!("/approvals/{deployment_id}/{action}"),
            &json!({ "responder": responder }),
        )
        .await?;
        Ok(())
    }

    /// Poll the environment until its current deployment reaches a resting
    /// state newer than `before`.
    async fn wait_for_outcome(
        &self,
        environment: &str,
        before: Option<&EnvironmentState>,
        timeout: Duration,
    ) -> Result<EnvironmentState> {
        let baseline_id = before
            .and_then(|s| s.current_deployment.as_ref())
            .map(|r| r.id.clone());
        let start = Instant::now();

        loop {
            let state = self.environment_state(environment).await?;
            if let Some(record) = &state.current_deployment {
                let is_new = baseline_id.as_deref() != Some(record.id.as_str());
                let resting = matches!(
                    record.state,
                    DeploymentState::Completed
                        | DeploymentState::Failed
                        | DeploymentState::RolledBack
                );
                if is_new && resting {
                    return Ok(state);
                }
            }
            if start.elapsed() >= timeout {
                return Ok(state);
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        Self::check(response, &url).await
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        Self::check(response, &url).await
    }

    async fn check(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(anyhow::anyhow!("{url} returned {status}: {}", body.trim()))
    }
}
