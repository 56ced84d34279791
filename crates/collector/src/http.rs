//! HTTP ingestion endpoints
//!
//! - `POST /v1/events`: submit one event
//! - `POST /v1/events/batch`: submit an array of events
//! - `GET /health`: liveness and uptime
//! - `GET /stats`: collector statistics

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::collector::{Collector, SubmitOutcome};
use crate::error::Result;

/// Health status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Per-item outcomes of a batch submit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<SubmitOutcome>,
}

/// Build the ingestion router
pub fn router(collector: Arc<Collector>) -> Router {
    Router::new()
        .route("/v1/events", post(submit_event))
        .route("/v1/events/batch", post(submit_batch))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(collector)
}

/// Serve the ingestion API until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, collector: Arc<Collector>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("Ingestion API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(collector))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn status_for(outcome: &SubmitOutcome) -> StatusCode {
    match outcome {
        SubmitOutcome::Accepted { .. } => StatusCode::ACCEPTED,
        SubmitOutcome::Rejected { .. } => StatusCode::BAD_REQUEST,
        SubmitOutcome::Throttled => StatusCode::TOO_MANY_REQUESTS,
        SubmitOutcome::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn submit_event(
    State(collector): State<Arc<Collector>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let outcome = collector.submit(payload).await;
    (status_for(&outcome), Json(outcome)).into_response()
}

async fn submit_batch(
    State(collector): State<Arc<Collector>>,
    Json(payloads): Json<Vec<serde_json::Value>>,
) -> Response {
    let results = collector.submit_batch(payloads).await;
    (StatusCode::OK, Json(BatchResponse { results })).into_response()
}

async fn health(State(collector): State<Arc<Collector>>) -> Response {
    let running = collector.is_running();
    let body = HealthStatus {
        status: if running { "healthy" } else { "shutting_down" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: collector.uptime().as_secs(),
    };
    let code = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

async fn stats(State(collector): State<Arc<Collector>>) -> Response {
    Json(collector.stats()).into_response()
}
