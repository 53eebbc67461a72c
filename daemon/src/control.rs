use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use platewatch_common::config::{FilterConfig, RecorderConfig, SourceConfig};
use platewatch_pipeline::{Named, Orchestrator, PipelineError};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PluginInfo {
    name: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    running: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(err: PipelineError) -> Response {
    let status = match &err {
        PipelineError::Config(_) => StatusCode::BAD_REQUEST,
        PipelineError::Duplicate { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "control request failed");
    }
    (status, Json(ErrorBody { error: err.to_string() })).into_response()
}

fn removed(found: bool) -> StatusCode {
    if found {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /sources
async fn list_sources(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let sources: Vec<PluginInfo> = orchestrator
        .sources()
        .snapshot()
        .iter()
        .map(|s| PluginInfo {
            name: s.name().to_string(),
            kind: s.kind(),
            running: Some(s.is_running()),
        })
        .collect();
    Json(sources)
}

/// POST /sources. The body is a source config such as
/// `{"type": "mjpeg", "name": "gate", "url": "http://cam/stream"}`
async fn add_source(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(config): Json<SourceConfig>,
) -> Response {
    match orchestrator.add_source_config(&config) {
        Ok(source) => {
            info!(source = source.name(), kind = source.kind(), "source added over control API");
            (
                StatusCode::CREATED,
                Json(PluginInfo {
                    name: source.name().to_string(),
                    kind: source.kind(),
                    running: None,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// DELETE /sources/:name
async fn remove_source(State(orchestrator): State<Arc<Orchestrator>>, Path(name): Path<String>) -> StatusCode {
    removed(orchestrator.remove_source(&name))
}

/// GET /filters
async fn list_filters(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let filters: Vec<PluginInfo> = orchestrator
        .filters()
        .snapshot()
        .iter()
        .map(|f| PluginInfo {
            name: f.name().to_string(),
            kind: f.kind(),
            running: None,
        })
        .collect();
    Json(filters)
}

/// POST /filters. The new filter runs after the existing ones. The body is a
/// filter config such as `{"type": "mask", "shapes": ["0,0,100,0,100,50"]}`
async fn add_filter(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(config): Json<FilterConfig>,
) -> Response {
    match orchestrator.add_filter_config(&config) {
        Ok(filter) => {
            info!(filter = filter.name(), kind = filter.kind(), "filter added over control API");
            (
                StatusCode::CREATED,
                Json(PluginInfo {
                    name: filter.name().to_string(),
                    kind: filter.kind(),
                    running: None,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// DELETE /filters/:name
async fn remove_filter(State(orchestrator): State<Arc<Orchestrator>>, Path(name): Path<String>) -> StatusCode {
    removed(orchestrator.remove_filter(&name))
}

/// GET /recorders
async fn list_recorders(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let recorders: Vec<PluginInfo> = orchestrator
        .recorders()
        .snapshot()
        .iter()
        .map(|r| PluginInfo {
            name: r.name().to_string(),
            kind: r.kind(),
            running: Some(r.is_running()),
        })
        .collect();
    Json(recorders)
}

/// POST /recorders. The body is a recorder config such as
/// `{"type": "sqlite", "name": "db"}`
async fn add_recorder(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(config): Json<RecorderConfig>,
) -> Response {
    match orchestrator.add_recorder_config(&config).await {
        Ok(recorder) => {
            info!(recorder = recorder.name(), kind = recorder.kind(), "recorder added over control API");
            (
                StatusCode::CREATED,
                Json(PluginInfo {
                    name: recorder.name().to_string(),
                    kind: recorder.kind(),
                    running: Some(recorder.is_running()),
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// DELETE /recorders/:name
async fn remove_recorder(State(orchestrator): State<Arc<Orchestrator>>, Path(name): Path<String>) -> StatusCode {
    removed(orchestrator.remove_recorder(&name))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sources", get(list_sources).post(add_source))
        .route("/sources/:name", delete(remove_source))
        .route("/filters", get(list_filters).post(add_filter))
        .route("/filters/:name", delete(remove_filter))
        .route("/recorders", get(list_recorders).post(add_recorder))
        .route("/recorders/:name", delete(remove_recorder))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}
