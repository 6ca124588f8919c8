//! HTTP surface: health endpoints, bucket-notification webhook, metrics.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::http_layers::log_requests;
use super::metrics;
use super::state::ServerState;
use crate::ingest::{decode_envelope, DecodeError};

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub version: String,
    pub tracks: usize,
    pub is_leader: bool,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tracks: state.catalog_store.get_tracks_count(),
        is_leader: state.election.is_leader(),
    };
    Json(stats)
}

async fn liveness() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "up" }))
}

/// Readiness reflects the aggregated dependency health: 200 with the
/// per-component breakdown when everything is up, 502 with the same
/// breakdown otherwise.
async fn readiness(State(state): State<ServerState>) -> Response {
    let components = state.health.snapshot();
    let healthy = !components.is_empty() && components.iter().all(|c| c.healthy);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(components)).into_response()
}

/// Bucket-notification webhook: the push path into the reconciliation
/// pipeline, bypassing the broker. Processing is asynchronous; ingestion
/// failures are not surfaced to the notifier.
async fn storage_events(State(state): State<ServerState>, body: Bytes) -> Response {
    let events = match decode_envelope(&body) {
        Ok(events) => events,
        Err(DecodeError::UnsupportedEvent(name)) => {
            debug!("Event '{}' not processed", name);
            return StatusCode::NO_CONTENT.into_response();
        }
        Err(e) => {
            warn!("Invalid bucket notification: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    for event in events {
        if state.notifications_tx.send(event).await.is_err() {
            error!("Notification listener is not running, dropping event");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

/// Build the application router.
pub fn make_app(state: ServerState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/health/liveness", get(liveness))
        .route("/health/readiness", get(readiness))
        .route("/events/storage", post(storage_events))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .with_state(state)
}

/// Serve HTTP until the token is cancelled.
pub async fn run_server(state: ServerState, token: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", listener.local_addr()?);

    let app = make_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("HTTP server failed")
}
