//! Stats HTTP Server
//!
//! Read-only endpoints for sampling the relay counters.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::{RelayStats, StatsReport, StatsReporter};
use crate::Result;

/// Shared state for the stats handlers
#[derive(Clone)]
pub struct StatsState {
    pub stats: Arc<RelayStats>,
    pub reporter: StatsReporter,
}

/// HTTP server exposing `/health`, `/stats` and `/metrics`
pub struct StatsServer {
    bind_addr: SocketAddr,
    state: StatsState,
}

impl StatsServer {
    pub fn new(bind_addr: SocketAddr, stats: Arc<RelayStats>) -> Self {
        let reporter = StatsReporter::new(Arc::clone(&stats));
        Self {
            bind_addr,
            state: StatsState { stats, reporter },
        }
    }

    /// Build the router; also used directly by tests
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/stats", get(get_stats))
            .route("/metrics", get(get_metrics))
            .with_state(self.state.clone())
    }

    /// Start the stats server
    pub async fn start(self) -> Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind stats server to {}", self.bind_addr))?;

        info!("Stats server listening on {}", self.bind_addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("Stats server error: {}", e);
            return Err(e.into());
        }

        Ok(())
    }
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn get_stats(State(state): State<StatsState>) -> Json<StatsReport> {
    Json(state.reporter.report())
}

async fn get_metrics(State(state): State<StatsState>) -> impl IntoResponse {
    match state.stats.export_prometheus() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to export metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to export metrics").into_response()
        }
    }
}
