//! Task protocol handlers.
//!
//! The protocol server never performs orchestration itself: task creation
//! writes a store record and fires the orchestrator, everything else is a
//! side-effect-free read of store snapshots. Polling is cheap by design.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::orchestrator::Orchestrator;
use crate::store::TaskStore;
use crate::task::{FailureKind, IterationRecord, Task, TaskStatus};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: TaskStore,
    pub orchestrator: Arc<Orchestrator>,
    /// Iteration budget applied when the client does not supply one.
    pub default_max_iterations: u32,
    /// Directory artifacts are served from.
    pub output_dir: PathBuf,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payload types ────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub prompt: String,
    pub max_iterations: Option<u32>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskResponse {
    pub task_id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub iteration_count: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
}

impl From<&Task> for TaskStatusResponse {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.to_string(),
            status: task.status,
            iteration_count: task.iteration_count(),
            last_updated: task.updated_at,
            error: task.error.as_ref().map(|e| e.message.clone()),
            error_kind: task.error.as_ref().map(|e| e.kind),
        }
    }
}

/// Download references for a completed task.
#[derive(Serialize, Deserialize)]
pub struct ArtifactResponse {
    pub step: String,
    pub stl: String,
    pub image: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::Terminal(_) => ApiError::Conflict(err.to_string()),
            StoreError::InvalidTransition { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/v1/tasks", post(create_task))
        .route("/v1/tasks/{id}", get(get_task_status))
        .route("/v1/tasks/{id}/artifacts", get(get_artifacts))
        .route("/v1/tasks/{id}/history", get(get_history))
        .route("/v1/tasks/{id}/cancel", post(cancel_task))
        .route("/download/{filename}", get(download_artifact))
        .route("/v1/card", get(agent_card))
        .route("/.well-known/agent-card.json", get(agent_card))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn parse_task_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::BadRequest(format!("invalid task id: {}", id)))
}

/// Artifact filenames come from the execution capability; only serve plain
/// names inside the output directory, never paths.
fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Turn a stored artifact path into a download reference.
fn download_uri(path: &str) -> Result<String, ApiError> {
    std::path::Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| format!("/download/{}", name))
        .ok_or_else(|| ApiError::Internal(format!("artifact path has no file name: {}", path)))
}

fn content_type_for(filename: &str) -> &'static str {
    match std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
    {
        Some("stl") => "model/stl",
        Some("step") => "model/step",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn create_task(
    State(state): State<SharedState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".to_string()));
    }
    if request.max_iterations == Some(0) {
        return Err(ApiError::BadRequest(
            "maxIterations must be at least 1".to_string(),
        ));
    }

    let max_iterations = request
        .max_iterations
        .unwrap_or(state.default_max_iterations);
    let task = state.store.create(request.prompt.trim(), max_iterations).await;
    state.orchestrator.spawn(task.id);
    tracing::info!(task = %task.id, "task created");

    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            task_id: task.id.to_string(),
        }),
    ))
}

async fn get_task_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let id = parse_task_id(&id)?;
    let task = state.store.get(id).await?;
    Ok(Json(TaskStatusResponse::from(&task)))
}

async fn get_artifacts(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ArtifactResponse>, ApiError> {
    let id = parse_task_id(&id)?;
    let task = state.store.get(id).await?;
    if task.status != TaskStatus::Approved {
        return Err(ApiError::Conflict("not yet complete".to_string()));
    }
    let artifacts = task
        .artifacts
        .as_ref()
        .ok_or_else(|| ApiError::Internal("approved task has no artifacts".to_string()))?;
    Ok(Json(ArtifactResponse {
        step: download_uri(&artifacts.step_path)?,
        stl: download_uri(&artifacts.stl_path)?,
        image: download_uri(&artifacts.image_path)?,
    }))
}

async fn get_history(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<IterationRecord>>, ApiError> {
    let id = parse_task_id(&id)?;
    let task = state.store.get(id).await?;
    Ok(Json(task.iterations))
}

async fn cancel_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_task_id(&id)?;
    state.orchestrator.cancel(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "cancelling"})),
    ))
}

async fn download_artifact(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !is_safe_filename(&filename) {
        return Err(ApiError::BadRequest("invalid filename".to_string()));
    }
    let path = state.output_dir.join(&filename);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound(format!("no artifact named {}", filename)))?;
    Ok((
        [(header::CONTENT_TYPE, content_type_for(&filename))],
        bytes,
    )
        .into_response())
}

/// Agent capability card for discovery.
async fn agent_card(headers: HeaderMap) -> Json<serde_json::Value> {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    Json(serde_json::json!({
        "type": "agent-card",
        "version": "1.0",
        "identity": {
            "name": "forma",
            "description": "Generates verified 3D models (STL/STEP) from natural language descriptions",
        },
        "capabilities": {
            "inputTypes": ["text/plain"],
            "outputTypes": ["model/stl", "model/step", "image/png"],
        },
        "supportedInterfaces": [
            {
                "transport": "http",
                "url": format!("http://{}/v1/tasks", host),
            }
        ],
    }))
}

async fn health_check() -> &'static str {
    "OK"
}
