//! Streaming Service Use Case - Feed Orchestrator
//!
//! Wires the connection manager and the subscription manager to the
//! injected collaborators and decides whether a connection should
//! exist at all. With no live positions at startup nothing connects;
//! the first executed trade starts the connection lazily.
//!
//! Shutdown order is the reverse of the dependency order:
//! connection, then subscriptions, then the update sink. Streamed
//! markets are handed back to `poll` before the sink stops, and the
//! same happens as soon as the connection fails permanently.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::adapters::feeds::connection::{ConnectionManager, ConnectionState};
use crate::adapters::feeds::handlers::{SinkHandler, SinkRoute};
use crate::adapters::metrics::StreamMetrics;
use crate::config::StreamingConfig;
use crate::domain::event::HandlerKind;
use crate::domain::market::{MarketId, TokenId, UserId};
use crate::ports::StreamContext;
use crate::usecases::subscription_manager::SubscriptionManager;

/// Orchestrator of the streaming subsystem.
pub struct StreamingService {
  config: StreamingConfig,
  ctx: StreamContext,
  connection: Arc<ConnectionManager>,
  subscriptions: Arc<SubscriptionManager>,
  started: AtomicBool,
  /// Releases streamed markets once the connection fails.
  failure_watch: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingService {
  /// Build the connection and subscription managers from config.
  pub fn new(config: StreamingConfig, ctx: StreamContext, metrics: Arc<StreamMetrics>) -> Self {
    let connection = Arc::new(ConnectionManager::new(config.feed_config(), metrics));
    let subscriptions = Arc::new(SubscriptionManager::new(
      ctx.clone(),
      Arc::clone(&connection),
      config.cleanup_interval(),
    ));

    Self {
      config,
      ctx,
      connection,
      subscriptions,
      started: AtomicBool::new(false),
      failure_watch: Mutex::new(None),
    }
  }

  /// Start the subsystem.
  ///
  /// # Errors
  /// Fails only if the update sink refuses to start.
  #[instrument(skip(self))]
  pub async fn start(&self) -> Result<()> {
    if !self.config.enabled {
      info!("Streaming disabled by configuration");
      return Ok(());
    }
    if self.started.swap(true, Ordering::AcqRel) {
      return Ok(());
    }

    self.register_handlers().await;

    if let Err(e) = self.ctx.sink.start().await {
      self.started.store(false, Ordering::Release);
      return Err(e).context("Failed to start update sink");
    }

    self.subscriptions.start().await;
    *self.failure_watch.lock().await = Some(self.spawn_failure_watch());

    match self.ctx.positions.list_active_position_markets().await {
      Ok(markets) if !markets.is_empty() => {
        let tokens = self.subscriptions.subscribe_active_positions().await;
        self.connection.start().await;
        info!(markets = markets.len(), tokens, "Streaming started for active positions");
      }
      Ok(_) => info!("No active positions, connection deferred until first trade"),
      Err(e) => warn!(error = %e, "Failed to list active positions, staying idle"),
    }

    Ok(())
  }

  /// Stop children in reverse dependency order. No-op if not started.
  #[instrument(skip(self))]
  pub async fn stop(&self) {
    if !self.started.swap(false, Ordering::AcqRel) {
      return;
    }

    if let Some(watch) = self.failure_watch.lock().await.take() {
      watch.abort();
    }
    self.connection.stop().await;
    self.subscriptions.stop().await;
    self.subscriptions.release_streamed_markets().await;
    if let Err(e) = self.ctx.sink.stop().await {
      warn!(error = %e, "Update sink failed to stop cleanly");
    }
    info!("Streaming service stopped");
  }

  /// Trade hook: subscribe the market and connect if needed.
  pub async fn on_trade_executed(&self, user: &UserId, market: &MarketId) {
    if !self.is_active() {
      return;
    }
    if self.connection.state() == ConnectionState::Failed {
      warn!(%user, %market, "Feed connection failed permanently, not streaming market");
      return;
    }
    self.subscriptions.on_trade_executed(user, market).await;
    self.connection.start().await;
  }

  /// Close hook: release the market once nobody holds it.
  pub async fn on_position_closed(&self, user: &UserId, market: &MarketId) {
    if !self.is_active() {
      return;
    }
    self.subscriptions.on_position_closed(user, market).await;
  }

  pub fn is_active(&self) -> bool {
    self.config.enabled && self.started.load(Ordering::Acquire)
  }

  pub fn connection_state(&self) -> ConnectionState {
    self.connection.state()
  }

  /// Observe connection state changes (e.g. to react to `Failed`).
  pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
    self.connection.watch_state()
  }

  pub async fn subscribed_tokens(&self) -> BTreeSet<TokenId> {
    self.connection.subscribed().await
  }

  /// Subscription manager, for manual reconciliation.
  pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
    &self.subscriptions
  }

  /// Wait for the connection to fail, then stop reconciling and hand
  /// every streamed market back to polling.
  fn spawn_failure_watch(&self) -> JoinHandle<()> {
    let mut state = self.connection.watch_state();
    let subscriptions = Arc::clone(&self.subscriptions);

    tokio::spawn(async move {
      let failed = state
        .wait_for(|s| *s == ConnectionState::Failed)
        .await
        .is_ok();
      if !failed {
        return;
      }

      error!("Feed connection failed permanently, releasing streamed markets");
      subscriptions.stop().await;
      let released = subscriptions.release_streamed_markets().await;
      info!(released, "Markets returned to polling after feed failure");
    })
  }

  async fn register_handlers(&self) {
    let sink = &self.ctx.sink;
    let routes = [
      (HandlerKind::Book, SinkRoute::OrderBook),
      (HandlerKind::Price, SinkRoute::Price),
      (HandlerKind::PriceChange, SinkRoute::Price),
      (HandlerKind::TickSizeChange, SinkRoute::Price),
      (HandlerKind::Trade, SinkRoute::Trade),
    ];

    for (kind, route) in routes {
      self
        .connection
        .register_handler(kind, SinkHandler::new(Arc::clone(sink), route))
        .await;
    }
  }
}
