use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};

use super::controller::JobController;
use super::models::ArtifactKind;
use super::ws::EventBus;
use crate::errors::JobError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub controller: Arc<JobController>,
    pub events: EventBus,
    pub artifact_dir: PathBuf,
    /// Push the current status to observers as they connect.
    pub replay_state_on_connect: bool,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::InvalidConfig(_) => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/job", get(get_job))
        .route("/download/{kind}", get(download_artifact))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_job(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.controller.snapshot()?;
    Ok(Json(snapshot))
}

async fn download_artifact(
    State(state): State<SharedState>,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let kind: ArtifactKind = kind
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid file type".into()))?;

    let path = state.artifact_dir.join(kind.file_name());
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound("File not found".into()));
        }
        Err(e) => {
            tracing::warn!(kind = kind.as_str(), error = %e, "Failed to read artifact");
            return Err(ApiError::Internal(format!("Failed to read artifact: {}", e)));
        }
    };

    tracing::debug!(kind = kind.as_str(), bytes = bytes.len(), "Serving artifact");
    let disposition = format!("attachment; filename=\"{}\"", kind.file_name());
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, kind.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────
