//! Feed Health Checks - /live and /ready
//!
//! Liveness only says the process answers. Readiness follows the feed
//! connection: an idle or reconnecting feed is still ready, a feed that
//! exhausted its error budget is not.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument};

use crate::adapters::feeds::connection::ConnectionState;

/// Connection state as seen by the health endpoints.
#[derive(Debug, Clone)]
pub struct HealthState {
    connection: watch::Receiver<ConnectionState>,
}

impl HealthState {
    pub fn new(connection: watch::Receiver<ConnectionState>) -> Self {
        Self { connection }
    }

    /// Latest connection state.
    pub fn connection(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Ready unless the connection stopped permanently.
    pub fn is_ready(&self) -> bool {
        self.connection() != ConnectionState::Failed
    }
}

/// HTTP server for the two health endpoints.
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Health routes bound to the shared state.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/live", get(live))
            .route("/ready", get(ready))
            .with_state(Arc::clone(&self.state))
    }

    /// Serve on `0.0.0.0:<port>` until the shutdown broadcast fires.
    #[instrument(skip(self, shutdown_rx), fields(port = self.port))]
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!(address = %listener.local_addr()?, "Health endpoints listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;
        Ok(())
    }
}

async fn live() -> &'static str {
    "alive"
}

async fn ready(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Value>) {
    let connection = state.connection();
    let status = if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({ "ready": state.is_ready(), "connection": connection.as_str() })),
    )
}
