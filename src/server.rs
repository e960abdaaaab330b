use crate::checksum::digest;
use crate::config::Config;
use crate::constants::TRIGGER_TOKEN_HEADER;
use crate::orchestrator::Orchestrator;
use crate::storage::Storage;
use axum::{
    extract::Query,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use hyper::Server;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared state behind every route
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub orchestrator: Orchestrator,
}

#[derive(Debug, Default, Deserialize)]
struct TriggerParams {
    /// Comma-separated source ids; all enabled sources when absent
    sources: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunsParams {
    limit: Option<usize>,
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "sanctions_watch",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics_text() -> Response {
    match crate::metrics::render() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed"),
    }
}

/// Run one ingestion invocation across the selected sources
async fn trigger_ingest(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<TriggerParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authorize(&state.config, &headers) {
        return rejection;
    }

    let sources = match params.sources.as_deref() {
        Some(list) => {
            let ids: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            state.config.select_sources(&ids)
        }
        None => state.config.enabled_sources().cloned().collect(),
    };
    if sources.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "no matching sources configured");
    }

    match state.orchestrator.run_all(&sources).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => {
            error!(error = %e, "ingestion invocation could not run");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

async fn recent_runs(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<RunsParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authorize(&state.config, &headers) {
        return rejection;
    }
    match state.storage.recent_runs(params.limit.unwrap_or(20)).await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn authorize(config: &Config, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = config.trigger_token.as_deref().filter(|t| !t.is_empty()) else {
        warn!("trigger request rejected: no trigger token configured");
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "trigger token not configured",
        ));
    };
    match presented_token(headers) {
        Some(provided) if token_matches(expected, provided) => Ok(()),
        _ => {
            warn!("trigger request rejected: bad or missing token");
            Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized"))
        }
    }
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(TRIGGER_TOKEN_HEADER) {
        return value.to_str().ok();
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Compares digests so neither the content nor the length of the secret leaks through timing
fn token_matches(expected: &str, provided: &str) -> bool {
    constant_time_eq(
        digest(expected.as_bytes()).as_bytes(),
        digest(provided.as_bytes()).as_bytes(),
    )
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Create the HTTP server with all routes
pub fn create_server(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/admin/ingest", post(trigger_ingest))
        .route("/admin/runs", get(recent_runs))
        .layer(Extension(state))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
}

/// Start the HTTP server on the specified port and serve until ctrl-c
pub async fn start_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let app = create_server(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("HTTP server running on http://localhost:{port}");
    info!("Trigger endpoint: POST http://localhost:{port}/admin/ingest");

    Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
