//! Prometheus Metrics Registry - Streaming Observability
//!
//! Registers and exposes Prometheus metrics on :9090. Covers feed
//! connectivity, reconnects, message throughput per event kind,
//! subscription set size and reconciliation drift.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

/// Prometheus metrics for the streaming engine.
///
/// All metrics follow the naming convention `stream_*`.
pub struct StreamMetrics {
    /// Prometheus registry.
    registry: Registry,
    /// Feed connection status (1 = connected, 0 = disconnected).
    pub feed_connected: IntGauge,
    /// Reconnect attempts after a drop or failed connect.
    pub reconnects: IntCounter,
    /// Routed messages by event kind.
    pub messages: IntCounterVec,
    /// Frames that were not valid JSON.
    pub malformed_frames: IntCounter,
    /// Current size of the subscription set.
    pub subscribed_tokens: IntGauge,
    /// Token ids removed by reconciliation.
    pub reconciliation_removed: IntCounter,
    /// Source flag writes that needed the fallback path.
    pub source_fallback_writes: IntCounter,
}

impl StreamMetrics {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let feed_connected = IntGauge::new(
            "stream_feed_connected",
            "Feed connection status (1=connected, 0=disconnected)",
        )?;

        let reconnects = IntCounter::new(
            "stream_reconnects_total",
            "Reconnect attempts after a drop or failed connect",
        )?;

        let messages = IntCounterVec::new(
            Opts::new("stream_messages_total", "Feed messages routed by event kind"),
            &["kind"],
        )?;

        let malformed_frames = IntCounter::new(
            "stream_malformed_frames_total",
            "Inbound frames that failed to parse",
        )?;

        let subscribed_tokens = IntGauge::new(
            "stream_subscribed_tokens",
            "Token ids in the subscription set",
        )?;

        let reconciliation_removed = IntCounter::new(
            "stream_reconciliation_removed_total",
            "Token ids unsubscribed by reconciliation",
        )?;

        let source_fallback_writes = IntCounter::new(
            "stream_source_fallback_writes_total",
            "Source flag writes served by the direct-write fallback",
        )?;

        registry.register(Box::new(feed_connected.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(malformed_frames.clone()))?;
        registry.register(Box::new(subscribed_tokens.clone()))?;
        registry.register(Box::new(reconciliation_removed.clone()))?;
        registry.register(Box::new(source_fallback_writes.clone()))?;

        Ok(Self {
            registry,
            feed_connected,
            reconnects,
            messages,
            malformed_frames,
            subscribed_tokens,
            reconciliation_removed,
            source_fallback_writes,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Serve Prometheus metrics on the configured bind address.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let metrics_self = Arc::clone(&self);

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics_self);
                async move { metrics.render() }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}
