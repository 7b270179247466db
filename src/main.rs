//! Polymarket Position Stream — Entry Point
//!
//! Runs the streaming engine standalone against JSON market and
//! position snapshots. Runs until SIGINT or until the feed exhausts
//! its error budget.
//!
//! Wiring sequence:
//! 1. Load config.toml + validate
//! 2. Init tracing (JSON or pretty)
//! 3. Open JsonStore, PriceCache, StreamMetrics → StreamContext
//! 4. Spawn metrics server and health server (/live + /ready)
//! 5. Start StreamingService
//! 6. Spawn positions reload loop
//! 7. Wait for SIGINT or a failed feed → stop → exit

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use polymarket_position_stream::adapters::feeds::ConnectionState;
use polymarket_position_stream::adapters::metrics::{HealthServer, HealthState, StreamMetrics};
use polymarket_position_stream::adapters::persistence::JsonStore;
use polymarket_position_stream::adapters::sink::PriceCache;
use polymarket_position_stream::config::{self, LogFormat};
use polymarket_position_stream::ports::StreamContext;
use polymarket_position_stream::usecases::StreamingService;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load configuration ───────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("STREAM_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config =
        config::loader::load_config(&config_path).context("Failed to load configuration")?;

    // ── 2. Initialize structured logging ────────────────────
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.bot.log_level));
    match config.bot.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).pretty().init(),
    }

    info!(
        name = %config.bot.name,
        version = env!("CARGO_PKG_VERSION"),
        streaming = config.streaming.enabled,
        "Starting Polymarket position stream"
    );

    // ── 3. Collaborators ────────────────────────────────────
    let store = Arc::new(
        JsonStore::open(&config.persistence.data_dir, config.streaming.dust_threshold)
            .await
            .context("Failed to open JSON store")?,
    );
    let cache = Arc::new(PriceCache::new());
    let metrics = Arc::new(StreamMetrics::new().context("Failed to register metrics")?);
    let ctx = StreamContext::new(store.clone(), store.clone(), cache.clone());

    let service = StreamingService::new(config.streaming.clone(), ctx, Arc::clone(&metrics));

    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(1);

    // ── 4. Metrics + health servers ─────────────────────────
    let metrics_handle = if config.metrics.enabled {
        let metrics_shutdown = shutdown_tx.subscribe();
        let bind_address = config.metrics.bind_address.clone();
        let metrics_ref = Arc::clone(&metrics);
        Some(tokio::spawn(async move {
            if let Err(e) = metrics_ref.serve(bind_address, metrics_shutdown).await {
                error!(error = %e, "Metrics server failed");
            }
        }))
    } else {
        None
    };

    let health = HealthServer::new(
        Arc::new(HealthState::new(service.watch_connection())),
        config.metrics.health_port,
    );
    let health_shutdown = shutdown_tx.subscribe();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health.run(health_shutdown).await {
            error!(error = %e, "Health server failed");
        }
    });

    // ── 5. Start streaming ──────────────────────────────────
    service.start().await.context("Failed to start streaming")?;

    // ── 6. Positions reload loop ────────────────────────────
    let reload_shutdown = shutdown_tx.subscribe();
    let reload_store = Arc::clone(&store);
    let reload_period = Duration::from_secs(config.persistence.positions_reload_secs);
    let reload_handle = tokio::spawn(reload_positions(reload_store, reload_period, reload_shutdown));

    info!("All tasks spawned — stream is running");

    // ── 7. Wait for SIGINT or a failed feed ─────────────────
    let mut connection = service.watch_connection();
    let failed = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("SIGINT received, initiating graceful shutdown");
            false
        }
        () = wait_for_failure(&mut connection) => {
            error!("Feed connection failed permanently, shutting down");
            true
        }
    };

    // ── Graceful shutdown ───────────────────────────────────
    service.stop().await;
    let _ = shutdown_tx.send(());

    let _ = tokio::time::timeout(Duration::from_secs(5), reload_handle).await;
    if let Some(handle) = metrics_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), health_handle).await;

    info!(quotes = cache.len().await, "Shutdown complete");

    if failed {
        anyhow::bail!("feed connection exhausted its error budget");
    }
    Ok(())
}

/// Resolve once the connection reports `Failed`.
async fn wait_for_failure(connection: &mut watch::Receiver<ConnectionState>) {
    if connection
        .wait_for(|state| *state == ConnectionState::Failed)
        .await
        .is_err()
    {
        // Sender gone: the service is shutting down anyway.
        std::future::pending::<()>().await;
    }
}

/// Re-read positions.json on a fixed period so external writers are seen.
async fn reload_positions(
    store: Arc<JsonStore>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => match store.reload_positions().await {
                Ok(count) => debug!(count, "Positions reloaded"),
                Err(e) => warn!(error = %e, "Failed to reload positions"),
            },
        }
    }
}
