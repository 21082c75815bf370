//! # HTTP Server
//!
//! HTTP server for metrics, health probes, environment state, and the
//! administrative operations.
//!
//! Provides endpoints:
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /healthz` - Liveness probe (always returns 200)
//! - `GET /readyz` - Readiness probe (200 once watchers run and no critical failure)
//! - `GET /environments` - Names of all watched environments
//! - `GET /environments/{env}` - Environment state snapshot
//! - `POST /environments/{env}/reconcile` - Trigger a reconciliation now
//! - `POST /environments/{env}/rollback` - Force a rollback to the last good commit
//! - `POST /approvals/{deployment_id}/approve` - Approve a pending deployment
//! - `POST /approvals/{deployment_id}/reject` - Reject a pending deployment
//!
//! State reads go straight to the durable state documents, lock-free; they
//! may be a tick stale, which readers tolerate. Approval decisions are
//! posted through the same decision channel the gate polls, so an HTTP
//! approval and a hand-dropped decision file behave identically.

use crate::approval::channel::{ApprovalDecision, Decision, DecisionChannel};
use crate::controller::watcher::EnvironmentHandle;
use crate::state::store::StateStore;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub struct ServerState {
    pub store: StateStore,
    pub channel: Arc<dyn DecisionChannel>,
    pub environments: HashMap<String, EnvironmentHandle>,
    pub is_ready: Arc<AtomicBool>,
    pub unhealthy: Arc<AtomicBool>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("environments", &self.environments.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

pub async fn start_server(port: u16, state: Arc<ServerState>) -> Result<(), anyhow::Error> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/environments", get(list_environments_handler))
        .route("/environments/{env}", get(environment_state_handler))
        .route("/environments/{env}/reconcile", post(reconcile_handler))
        .route("/environments/{env}/rollback", post(rollback_handler))
        .route("/approvals/{deployment_id}/approve", post(approve_handler))
        .route("/approvals/{deployment_id}/reject", post(reject_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn gather() -> Vec<prometheus::proto::MetricFamily> {
    use crate::observability::metrics::REGISTRY;
    REGISTRY.gather()
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Failed to encode metrics: {}", e).into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.unhealthy.load(Ordering::Relaxed) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if state.is_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn list_environments_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let mut names: Vec<&String> = state.environments.keys().collect();
    names.sort();
    Json(json!({ "environments": names })).into_response()
}

async fn environment_state_handler(
    State(state): State<Arc<ServerState>>,
    Path(env): Path<String>,
) -> impl IntoResponse {
    if !state.environments.contains_key(&env) {
        return not_found(&env);
    }
    match state.store.load_environment(&env) {
        Ok(Some(environment_state)) => Json(environment_state).into_response(),
        // Not reconciled yet: an empty state document, not an error
        Ok(None) => Json(crate::state::EnvironmentState::new(&env)).into_response(),
        Err(e) => {
            error!("Failed to read state for {}: {}", env, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn reconcile_handler(
    State(state): State<Arc<ServerState>>,
    Path(env): Path<String>,
) -> impl IntoResponse {
    let Some(handle) = state.environments.get(&env) else {
        return not_found(&env);
    };
    handle.trigger_reconciliation();
    (
        StatusCode::ACCEPTED,
        Json(json!({ "environment": env, "triggered": true })),
    )
        .into_response()
}

async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(env): Path<String>,
) -> impl IntoResponse {
    let Some(handle) = state.environments.get(&env) else {
        return not_found(&env);
    };
    handle.request_force_rollback();
    (
        StatusCode::ACCEPTED,
        Json(json!({ "environment": env, "rollback": "requested" })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionBody {
    responder: String,
}

async fn approve_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> impl IntoResponse {
    post_decision(&state, &deployment_id, Decision::Approve, &body.responder).await
}

async fn reject_handler(
    State(state): State<Arc<ServerState>>,
    Path(deployment_id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> impl IntoResponse {
    post_decision(&state, &deployment_id, Decision::Reject, &body.responder).await
}

async fn post_decision(
    state: &ServerState,
    deployment_id: &str,
    decision: Decision,
    responder: &str,
) -> axum::response::Response {
    if responder.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "responder must not be empty" })),
        )
            .into_response();
    }

    let decision = ApprovalDecision {
        deployment_id: deployment_id.to_string(),
        decision,
        responder: responder.to_string(),
    };

    match state.channel.post_decision(&decision).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "deploymentId": deployment_id, "recorded": true })),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to record decision for {}: {:#}", deployment_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

fn not_found(env: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown environment '{env}'") })),
    )
        .into_response()
}
