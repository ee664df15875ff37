//! Read-only JSON view of pipeline runs and their steps.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use isla_core::{Run, RunStatus, Step, StepStatus};
use isla_storage::Store;
use isla_sync::{open_durable_store, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "isla-web";

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RunView {
    pub id: Uuid,
    pub dataset: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub metadata: JsonValue,
}

impl From<Run> for RunView {
    fn from(run: Run) -> Self {
        Self {
            duration_ms: run.duration_ms(),
            id: run.id,
            dataset: run.pipeline_name,
            status: run.status,
            started_at: run.started_at,
            ended_at: run.ended_at,
            metadata: run.metadata,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StepView {
    pub id: Uuid,
    pub name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

impl From<Step> for StepView {
    fn from(step: Step) -> Self {
        Self {
            duration_ms: step.duration_ms(),
            id: step.id,
            name: step.step_name,
            status: step.status,
            started_at: step.started_at,
            ended_at: step.ended_at,
            error: step.error_message,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/runs", get(runs_handler))
        .route("/runs/{id}", get(run_handler))
        .route("/runs/{id}/steps", get(steps_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &SyncConfig) -> anyhow::Result<()> {
    let store = open_durable_store(config, "serving the run ledger").await?;
    let listener = TcpListener::bind(config.web_addr.as_str()).await?;
    info!(addr = %config.web_addr, "serving run ledger");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&SyncConfig::from_env()).await
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

async fn runs_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    match state.store.list_runs(limit).await {
        Ok(runs) => Json(runs.into_iter().map(RunView::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn run_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    match state.store.get_run(id).await {
        Ok(Some(run)) => Json(RunView::from(run)).into_response(),
        Ok(None) => not_found(id),
        Err(err) => server_error(err.into()),
    }
}

async fn steps_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<Uuid>) -> Response {
    match state.store.get_run(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(id),
        Err(err) => return server_error(err.into()),
    }
    match state.store.list_steps(id).await {
        Ok(steps) => Json(steps.into_iter().map(StepView::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn not_found(id: Uuid) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": format!("run {id} not found") }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
