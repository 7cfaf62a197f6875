use crate::config::ApiConfig;
use crate::error::PublishError;
use crate::intake::{self, IntakeStore, ReceiveError};
use crate::pipeline::{Orchestrator, PipelineFailure, PipelineStage};
use crate::remote::RemoteBackend;
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub intake: IntakeStore,
    pub backend: Arc<dyn RemoteBackend>,
    pub file_field: String,
}

/// Successful publish response
///
/// A request succeeded if and only if it returns 201 with `success: true`.
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub success: bool,
    /// Public URL of the published file
    ///
    /// Serialized as `fileUrl`, the key existing mobile clients read.
    #[serde(rename = "fileUrl")]
    pub file_url: String,
    /// Remote object identifier
    pub object_id: String,
    /// Display name the file was published under
    pub name: String,
    pub published_at: DateTime<Utc>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    /// Stage the pipeline failed to reach, when the pipeline ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<PipelineStage>,
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(code: &str, error: impl Into<String>) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, code, error)
}

fn error_response(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            success: false,
            stage: None,
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// Multipart and body-stream errors, including an exceeded body limit
fn multipart_error(error: MultipartError) -> ApiError {
    let status = error.status();
    let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "PAYLOAD_TOO_LARGE"
    } else {
        "INVALID_MULTIPART"
    };
    error_response(status, code, error.body_text())
}

fn status_for(error: &PublishError) -> StatusCode {
    match error {
        PublishError::MalformedInput(_) => StatusCode::BAD_REQUEST,
        PublishError::LocalIo { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        PublishError::RemotePublish { cause, .. } if cause.is_timeout() => {
            StatusCode::GATEWAY_TIMEOUT
        }
        PublishError::RemotePublish { .. } => StatusCode::BAD_GATEWAY,
    }
}

fn failure_response(failure: &PipelineFailure) -> ApiError {
    (
        status_for(&failure.cause),
        Json(ErrorResponse {
            success: false,
            stage: Some(failure.stage),
            error: failure.cause.to_string(),
            code: failure.cause.code().to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/files", post(upload_file))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "publisher-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let result = match tokio::time::timeout(READINESS_TIMEOUT, state.backend.health_check()).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err("backend health check timed out".to_string()),
    };

    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "backend": "reachable"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "backend": "unreachable",
                "error": e
            })),
        ),
    }
}

/// Receive one file and publish it
#[instrument(skip(state, multipart))]
async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let record = loop {
        let field = multipart
            .next_field()
            .await
            .map_err(multipart_error)?;

        let Some(field) = field else {
            return Err(bad_request(
                "MISSING_FILE",
                format!("multipart field '{}' is required", state.file_field),
            ));
        };

        if field.name() != Some(state.file_field.as_str()) {
            continue;
        }

        let original_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| bad_request("MALFORMED_INPUT", "file part has no filename"))?;
        // Reject unusable names before any bytes reach the intake directory
        intake::validate_original_name(&original_name)
            .map_err(|e| failure_response(&PipelineFailure::new(PipelineStage::Renamed, e)))?;
        let content_type = field.content_type().unwrap_or_default().to_string();

        let record = state
            .intake
            .receive(&original_name, &content_type, field)
            .await
            .map_err(|e| match e {
                ReceiveError::Body(e) => {
                    warn!(error = %e, "Upload body could not be read");
                    multipart_error(e)
                }
                ReceiveError::Local(e) => {
                    warn!(error = %e, "Failed to receive upload");
                    failure_response(&PipelineFailure::new(PipelineStage::Received, e))
                }
            })?;

        break record;
    };

    let outcome = state
        .orchestrator
        .ingest(record)
        .await
        .map_err(|failure| failure_response(&failure))?;

    Ok((
        StatusCode::CREATED,
        Json(PublishResponse {
            success: true,
            file_url: outcome.reference.url,
            object_id: outcome.object_id,
            name: outcome.display_name,
            published_at: Utc::now(),
        }),
    ))
}

/// Start the upload API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
