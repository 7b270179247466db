//! Subscription Manager Use Case - Position-Scoped Feed Subscriptions
//!
//! Decides which token ids the feed should carry, based on the live
//! positions reported by the position store, and keeps each market's
//! source flag consistent with that decision.
//!
//! Subscription flow:
//! 1. A trade executes: subscribe the market's tokens, flag it `ws`
//! 2. A position closes: if none remain, unsubscribe and flag it `poll`
//! 3. Every cleanup interval: reconcile the set against live positions
//! 4. Shutdown or a failed feed: hand every streamed market back to `poll`
//!
//! Collaborator failures are logged and swallowed. Trading is never
//! blocked by streaming bookkeeping; reconciliation repairs any drift.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::feeds::connection::{ConnectionManager, ConnectionState};
use crate::domain::market::{MarketId, PriceSource, TokenId, UserId};
use crate::ports::StreamContext;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  /// Token ids unsubscribed because no live position holds them.
  pub removed: usize,
  /// Token ids subscribed because a live position was missed.
  pub added: usize,
  /// Markets whose source flag went back to `poll`.
  pub flipped_to_poll: usize,
}

impl ReconcileReport {
  /// True when the pass changed nothing.
  pub const fn is_empty(&self) -> bool {
    self.removed == 0 && self.added == 0 && self.flipped_to_poll == 0
  }
}

/// Running cleanup task and its cancellation handle.
struct CleanupTask {
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

/// Maps live positions onto the connection's subscription set.
pub struct SubscriptionManager {
  ctx: StreamContext,
  connection: Arc<ConnectionManager>,
  /// Period between reconciliation passes.
  cleanup_interval: Duration,
  cleanup: Mutex<Option<CleanupTask>>,
}

impl SubscriptionManager {
  /// Create a new subscription manager.
  pub fn new(
    ctx: StreamContext,
    connection: Arc<ConnectionManager>,
    cleanup_interval: Duration,
  ) -> Self {
    Self {
      ctx,
      connection,
      cleanup_interval,
      cleanup: Mutex::new(None),
    }
  }

  /// Spawn the periodic reconciliation task. Idempotent.
  pub async fn start(self: &Arc<Self>) {
    let mut cleanup = self.cleanup.lock().await;
    if cleanup.is_some() {
      return;
    }

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let this = Arc::clone(self);

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(this.cleanup_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      // First tick fires immediately; startup already bootstrapped.
      ticker.tick().await;

      loop {
        tokio::select! {
          biased;
          () = token.cancelled() => break,
          _ = ticker.tick() => {
            this.reconcile().await;
          }
        }
      }
    });

    *cleanup = Some(CleanupTask { cancel, handle });
    info!(
      interval_secs = self.cleanup_interval.as_secs(),
      "Subscription reconciliation started"
    );
  }

  /// Cancel the reconciliation task and wait for it.
  pub async fn stop(&self) {
    let Some(CleanupTask { cancel, handle }) = self.cleanup.lock().await.take() else {
      return;
    };
    cancel.cancel();
    if let Err(e) = handle.await {
      error!(error = %e, "Reconciliation task panicked");
    }
    info!("Subscription reconciliation stopped");
  }

  /// A trade executed: stream the market and make the feed its price source.
  #[instrument(skip(self))]
  pub async fn on_trade_executed(&self, user: &UserId, market: &MarketId) {
    if self.connection.state() == ConnectionState::Failed {
      warn!(%user, %market, "Feed connection failed, market stays on poll");
      return;
    }

    let tokens = match self.ctx.markets.get_token_ids(market).await {
      Ok(tokens) if !tokens.is_empty() => tokens,
      Ok(_) => {
        warn!(%user, %market, "Market has no tokens, not streaming it");
        return;
      }
      Err(e) => {
        warn!(%user, %market, error = %e, "Token lookup failed, not streaming market");
        return;
      }
    };

    let added = self.connection.subscribe(tokens).await;

    if let Err(e) = self.ctx.markets.set_source(market, PriceSource::Ws).await {
      warn!(%user, %market, error = %e, "Failed to flag market as streamed");
    }

    info!(%user, %market, added, "Market subscribed after trade");
  }

  /// A position closed: drop the market if no live position remains.
  #[instrument(skip(self))]
  pub async fn on_position_closed(&self, user: &UserId, market: &MarketId) {
    let remaining = match self.ctx.positions.count_active_positions(market).await {
      Ok(n) => n,
      Err(e) => {
        warn!(%user, %market, error = %e, "Position count failed, keeping subscription");
        return;
      }
    };

    if remaining > 0 {
      debug!(%user, %market, remaining, "Market still held, keeping subscription");
      return;
    }

    let tokens = match self.ctx.markets.get_token_ids(market).await {
      Ok(tokens) => tokens,
      Err(e) => {
        warn!(%user, %market, error = %e, "Token lookup failed, reconciliation will unsubscribe");
        BTreeSet::new()
      }
    };
    let removed = self.connection.unsubscribe(tokens.iter().cloned()).await;

    self.release_market(market, &tokens).await;
    info!(%user, %market, removed, "Market unsubscribed after last position closed");
  }

  /// Bootstrap: subscribe every market held by a live position.
  ///
  /// Returns the number of token ids in the bulk subscribe.
  #[instrument(skip(self))]
  pub async fn subscribe_active_positions(&self) -> usize {
    let markets = match self.ctx.positions.list_active_position_markets().await {
      Ok(markets) => markets,
      Err(e) => {
        warn!(error = %e, "Failed to list active positions");
        return 0;
      }
    };

    let (tokens, resolved, _) = self.resolve_tokens(&markets).await;
    let total = tokens.len();
    if total > 0 {
      self.connection.subscribe(tokens).await;
    }

    for market in &resolved {
      if let Err(e) = self.ctx.markets.set_source(market, PriceSource::Ws).await {
        warn!(%market, error = %e, "Failed to flag market as streamed");
      }
    }

    info!(
      markets = resolved.len(),
      tokens = total,
      "Subscribed tokens of active positions"
    );
    total
  }

  /// One reconciliation pass: converge the set on live positions.
  ///
  /// Held markets are only flagged `ws` while the connection can run;
  /// once it has failed or stopped, every streamed market goes back
  /// to `poll` and no tokens are added.
  #[instrument(skip(self))]
  pub async fn reconcile(&self) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    let markets = match self.ctx.positions.list_active_position_markets().await {
      Ok(markets) => markets,
      Err(e) => {
        warn!(error = %e, "Reconciliation skipped, position listing failed");
        return report;
      }
    };

    let (desired, resolved, lookup_failed) = self.resolve_tokens(&markets).await;
    let subscribed = self.connection.subscribed().await;

    if lookup_failed {
      // An unresolved market's tokens would look stale; keep them.
      warn!("Token lookup failed for some markets, skipping removals this pass");
    } else {
      let stale: Vec<TokenId> = subscribed.difference(&desired).cloned().collect();
      if !stale.is_empty() {
        report.removed = self.connection.unsubscribe(stale).await;
        self
          .connection
          .metrics()
          .reconciliation_removed
          .inc_by(report.removed as u64);
      }
    }

    let streaming = !markets.is_empty() && self.connection.ensure_started().await;
    if streaming {
      let missing: Vec<TokenId> = desired.difference(&subscribed).cloned().collect();
      if !missing.is_empty() {
        report.added = self.connection.subscribe(missing).await;
      }
    } else if !markets.is_empty() {
      warn!(
        state = self.connection.state().as_str(),
        "Feed connection not running, held markets left on poll"
      );
    }

    match self.ctx.markets.list_markets_by_source(PriceSource::Ws).await {
      Ok(ws_markets) => {
        let ws_markets: BTreeSet<MarketId> = ws_markets.into_iter().collect();

        if streaming {
          for market in resolved.iter().filter(|m| !ws_markets.contains(*m)) {
            if let Err(e) = self.ctx.markets.set_source(market, PriceSource::Ws).await {
              warn!(%market, error = %e, "Failed to flag market as streamed");
            }
          }
        }

        for market in ws_markets
          .iter()
          .filter(|m| !streaming || !markets.contains(*m))
        {
          let tokens = self.market_tokens(market).await;
          self.release_market(market, &tokens).await;
          report.flipped_to_poll += 1;
        }
      }
      Err(e) => warn!(error = %e, "Failed to list streamed markets"),
    }

    if report.is_empty() {
      debug!("Reconciliation found no drift");
    } else {
      info!(
        removed = report.removed,
        added = report.added,
        flipped_to_poll = report.flipped_to_poll,
        "Reconciliation corrected drift"
      );
    }
    report
  }

  /// Hand every market flagged `ws` back to polling.
  ///
  /// Used on shutdown and after the feed fails for good. Returns the
  /// number of markets released.
  #[instrument(skip(self))]
  pub async fn release_streamed_markets(&self) -> usize {
    let markets = match self.ctx.markets.list_markets_by_source(PriceSource::Ws).await {
      Ok(markets) => markets,
      Err(e) => {
        error!(error = %e, "Failed to list streamed markets, flags left on ws");
        return 0;
      }
    };

    for market in &markets {
      let tokens = self.market_tokens(market).await;
      self.release_market(market, &tokens).await;
    }

    if !markets.is_empty() {
      info!(markets = markets.len(), "Streamed markets handed back to polling");
    }
    markets.len()
  }

  /// Token ids of one market; empty when the lookup fails.
  async fn market_tokens(&self, market: &MarketId) -> BTreeSet<TokenId> {
    self
      .ctx
      .markets
      .get_token_ids(market)
      .await
      .unwrap_or_else(|e| {
        debug!(%market, error = %e, "Token lookup failed, purging by market only");
        BTreeSet::new()
      })
  }

  /// Purge the sink's state for a market and flag it `poll`.
  async fn release_market(&self, market: &MarketId, tokens: &BTreeSet<TokenId>) {
    if let Err(e) = self.ctx.sink.on_market_unsubscribed(market, tokens).await {
      warn!(%market, error = %e, "Failed to purge buffered prices");
    }
    self.release_market_source(market).await;
  }

  /// Union of the markets' token ids, the markets that resolved, and
  /// whether any lookup failed.
  async fn resolve_tokens(
    &self,
    markets: &BTreeSet<MarketId>,
  ) -> (BTreeSet<TokenId>, Vec<MarketId>, bool) {
    let mut tokens = BTreeSet::new();
    let mut resolved = Vec::with_capacity(markets.len());
    let mut failed = false;

    for market in markets {
      match self.ctx.markets.get_token_ids(market).await {
        Ok(ids) => {
          tokens.extend(ids);
          resolved.push(market.clone());
        }
        Err(e) => {
          warn!(%market, error = %e, "Token lookup failed");
          failed = true;
        }
      }
    }

    (tokens, resolved, failed)
  }

  /// Hand a market back to the polling subsystem.
  ///
  /// Falls back to the direct write when the primary update fails so
  /// the flag never stays on `ws`.
  async fn release_market_source(&self, market: &MarketId) {
    let Err(primary) = self.ctx.markets.set_source(market, PriceSource::Poll).await else {
      return;
    };

    warn!(%market, error = %primary, "Source update failed, using direct write");
    self.connection.metrics().source_fallback_writes.inc();

    if let Err(e) = self
      .ctx
      .markets
      .write_source_direct(market, PriceSource::Poll)
      .await
    {
      error!(%market, error = %e, "Direct source write failed, flag left on ws until next pass");
    }
  }
}
