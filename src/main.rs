//! # Geo Config Controller Daemon
//!
//! Entry point of the controller: loads and validates the controller
//! configuration, starts the HTTP server for metrics/probes/admin, and
//! spawns one watcher task per environment. Watchers share nothing mutable;
//! each owns its repository working copy and its durable state document.

use anyhow::{Context, Result};
use geo_config_controller::approval::channel::{DecisionChannel, FileDecisionChannel};
use geo_config_controller::approval::ApprovalGate;
use geo_config_controller::apply::adapter::{HttpTargetAdapter, TargetSystemAdapter};
use geo_config_controller::apply::Applier;
use geo_config_controller::config::ControllerConfig;
use geo_config_controller::constants::DEFAULT_SERVER_PORT;
use geo_config_controller::controller::pipeline::EnvironmentRuntime;
use geo_config_controller::controller::watcher::{self, EnvironmentHandle};
use geo_config_controller::git::RepositoryMirror;
use geo_config_controller::loader::ConfigurationLoader;
use geo_config_controller::observability::metrics;
use geo_config_controller::server::{start_server, ServerState};
use geo_config_controller::state::store::StateStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "geo_config_controller=info".into()),
        )
        .init();

    info!(
        "Starting Geo Config Controller (build {} at {})",
        env!("BUILD_GIT_HASH"),
        env!("BUILD_DATETIME")
    );

    let config_path = std::env::var("CONTROLLER_CONFIG")
        .map_or_else(|_| PathBuf::from("controller.yaml"), PathBuf::from);
    let config = ControllerConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        "Loaded configuration: {} environment(s) watching {}",
        config.environments.len(),
        config.repository.url
    );

    metrics::register_metrics()?;

    let store = StateStore::new(&config.state_dir);
    store.ensure_layout().context("preparing state directory")?;

    let channel: Arc<dyn DecisionChannel> =
        Arc::new(FileDecisionChannel::new(&config.decision_dir));
    let adapter = Arc::new(HttpTargetAdapter::new(&config.target)?);

    let is_ready = Arc::new(AtomicBool::new(false));
    let unhealthy = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Per-environment handles shared with the admin API
    let mut handles = HashMap::new();
    for env in &config.environments {
        handles.insert(env.name.clone(), EnvironmentHandle::new(&env.name));
    }

    let server_state = Arc::new(ServerState {
        store: store.clone(),
        channel: Arc::clone(&channel),
        environments: handles.clone(),
        is_ready: Arc::clone(&is_ready),
        unhealthy: Arc::clone(&unhealthy),
    });

    let server_port = std::env::var("CONTROLLER_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_SERVER_PORT);

    tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state).await {
            error!("HTTP server error: {}", e);
        }
    });

    let poll_interval = config.poll_interval_duration();
    let mut watcher_tasks = Vec::new();
    for env in &config.environments {
        let branch = env.branch(&config.repository).to_string();
        let mirror = RepositoryMirror::new(
            &config.repository.url,
            &config.mirror_dir.join(&env.name),
            config.repository.operation_timeout_duration(),
        );
        let runtime = Arc::new(EnvironmentRuntime {
            environment: env.clone(),
            branch,
            mirror,
            loader: ConfigurationLoader::new(),
            store: store.clone(),
            gate: ApprovalGate::new(Arc::clone(&channel)),
            applier: Applier::new(Arc::clone(&adapter) as Arc<dyn TargetSystemAdapter>),
        });
        let handle = handles
            .get(&env.name)
            .expect("handle exists for every configured environment")
            .clone();
        watcher_tasks.push(tokio::spawn(watcher::run(
            runtime,
            handle,
            poll_interval,
            Arc::clone(&unhealthy),
            shutdown_rx.clone(),
        )));
    }

    is_ready.store(true, Ordering::Relaxed);
    info!("All watchers started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown_tx
        .send(true)
        .context("notifying watchers of shutdown")?;

    futures::future::join_all(watcher_tasks).await;
    info!("Controller stopped");

    Ok(())
}
