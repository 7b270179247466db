//! Update Sink Port - Downstream Consumer of Feed Messages
//!
//! The sink buffers or forwards price, order book and trade updates
//! to the rest of the bot. The connection layer routes messages to
//! sink methods through registered `MessageHandler`s.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::event::FeedMessage;
use crate::domain::market::{MarketId, TokenId};

/// Trait for consumers of streamed market data.
#[async_trait]
pub trait UpdateSink: Send + Sync + 'static {
  /// Begin accepting updates.
  async fn start(&self) -> anyhow::Result<()>;

  /// Stop accepting updates.
  async fn stop(&self) -> anyhow::Result<()>;

  /// Price-level update (price, price_change, tick size, generic market).
  async fn handle_price_update(&self, msg: &FeedMessage) -> anyhow::Result<()>;

  /// Order book snapshot.
  async fn handle_orderbook_update(&self, msg: &FeedMessage) -> anyhow::Result<()>;

  /// Trade print.
  async fn handle_trade_update(&self, msg: &FeedMessage) -> anyhow::Result<()>;

  /// Purge any buffered state for a market that left streaming scope.
  ///
  /// `tokens` are the market's token ids when they could be resolved;
  /// updates that carried no market id are only reachable through them.
  async fn on_market_unsubscribed(
    &self,
    market: &MarketId,
    tokens: &BTreeSet<TokenId>,
  ) -> anyhow::Result<()>;
}

/// Callback invoked for one message category.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
  async fn handle(&self, msg: &FeedMessage) -> anyhow::Result<()>;
}
