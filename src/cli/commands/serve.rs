//! HTTP API server for controlling batches from other systems.
//!
//! Exposes the orchestrator's control surface: start a batch, poll its
//! status, and cancel, pause or resume it.

use crate::batch::{BatchOrchestrator, BatchRequest, BatchStatus};
use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::error::SamleError;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared application state.
struct AppState {
    orchestrator: BatchOrchestrator,
    settings: Settings,
}

/// Run the HTTP API server.
pub async fn run_serve(host: &str, port: u16, settings: Settings) -> anyhow::Result<()> {
    // Every accepted batch needs the same tools as `samle run`.
    if let Err(e) = preflight::check(Operation::Batch) {
        Output::error(&format!("{}", e));
        Output::info("Install the missing dependency and try again.");
        return Err(e.into());
    }

    let orchestrator = BatchOrchestrator::from_settings(&settings)?;

    let state = Arc::new(AppState {
        orchestrator,
        settings,
    });

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    Output::header("Samle API Server");
    println!();
    Output::success(&format!("Listening on http://{}", addr));
    println!();
    println!("Endpoints:");
    Output::kv("Health", "GET  /health");
    Output::kv("Start batch", "POST /batch");
    Output::kv("Batch status", "GET  /batch");
    Output::kv("Cancel", "POST /batch/cancel");
    Output::kv("Pause", "POST /batch/pause");
    Output::kv("Resume", "POST /batch/resume");
    println!();
    Output::info("Press Ctrl+C to stop the server.");

    axum::serve(listener, router(state)).await?;

    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/batch", post(start_batch).get(batch_status))
        .route("/batch/cancel", post(cancel_batch))
        .route("/batch/pause", post(pause_batch))
        .route("/batch/resume", post(resume_batch))
        .layer(cors)
        .with_state(state)
}

// === Request/Response Types ===

#[derive(Deserialize)]
struct StartBatchRequest {
    /// Media URLs to process
    urls: Vec<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    target_language: Option<String>,
    #[serde(default)]
    output_dir: Option<PathBuf>,
    #[serde(default)]
    formats: Vec<String>,
    #[serde(default)]
    concurrency: Option<usize>,
}

#[derive(Serialize)]
struct ControlResponse {
    accepted: bool,
    status: BatchStatus,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// === Handlers ===

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn start_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartBatchRequest>,
) -> impl IntoResponse {
    let current = state.orchestrator.get_status().status;
    if matches!(current, BatchStatus::Running | BatchStatus::Paused) {
        return (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: format!("A batch is already {}. Cancel it or wait for it to finish.", current),
            }),
        )
            .into_response();
    }

    let request = BatchRequest {
        identifiers: req.urls,
        model: req.model.unwrap_or_else(|| state.settings.batch.model.clone()),
        target_language: req.target_language,
        output_dir: req.output_dir,
        formats: req.formats,
        concurrency: req.concurrency,
    };

    match state.orchestrator.process_batch(request) {
        Ok(started) => {
            info!("Batch {} started via API", started.batch_id);
            (StatusCode::ACCEPTED, Json(started)).into_response()
        }
        Err(e @ SamleError::Validation(_)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response(),
    }
}

async fn batch_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.get_status())
}

fn control(state: &AppState, accepted: bool) -> Json<ControlResponse> {
    Json(ControlResponse {
        accepted,
        status: state.orchestrator.get_status().status,
    })
}

async fn cancel_batch(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let accepted = state.orchestrator.cancel();
    control(&state, accepted)
}

async fn pause_batch(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let accepted = state.orchestrator.pause();
    control(&state, accepted)
}

async fn resume_batch(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let accepted = state.orchestrator.resume();
    control(&state, accepted)
}
