//! Exposition API.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::exporter::Exporter;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// State for the exposition API handler.
#[derive(Clone)]
pub struct ExporterState {
    exporter: Arc<Mutex<Exporter>>,
}

/// An API handler for scraping endpoints on demand.
///
/// This handler exposes two routes: `/metrics`, which runs a scrape round and returns the resulting gauges in the
/// Prometheus text exposition format, and `/health`, which always responds with 200 OK.
///
/// Rounds never overlap: a request to `/metrics` that arrives while a round is in progress waits for it to finish, and
/// then runs its own.
pub struct ExporterAPIHandler {
    state: ExporterState,
}

impl ExporterAPIHandler {
    /// Creates a new `ExporterAPIHandler`.
    pub fn new(exporter: Exporter) -> Self {
        Self {
            state: ExporterState {
                exporter: Arc::new(Mutex::new(exporter)),
            },
        }
    }

    async fn metrics_handler(State(state): State<ExporterState>) -> impl IntoResponse {
        let mut exporter = state.exporter.lock().await;
        let (summary, payload) = exporter.scrape().await;
        debug!(?summary, bytes = payload.len(), "Served scrape request.");

        ([(CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], payload)
    }

    async fn health_handler() -> impl IntoResponse {
        (StatusCode::OK, "ok")
    }

    /// Builds the router for this handler.
    pub fn into_router(self) -> Router {
        Router::new()
            .route("/metrics", get(Self::metrics_handler))
            .route("/health", get(Self::health_handler))
            .with_state(self.state)
    }
}
