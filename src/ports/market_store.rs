//! Market Store Port - Market Metadata and Price Authority
//!
//! Resolves a market to its outcome tokens and records which
//! subsystem (polling or streaming) owns the market's price.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::market::{MarketId, PriceSource, TokenId};

/// Trait for market metadata providers.
///
/// Implemented by the persistence layer. The streaming engine only
/// reads token ids and writes the `source` flag.
#[async_trait]
pub trait MarketStore: Send + Sync + 'static {
  /// Resolve the outcome token ids of a market.
  async fn get_token_ids(&self, market: &MarketId) -> anyhow::Result<BTreeSet<TokenId>>;

  /// Set the price authority of a market (primary write path).
  async fn set_source(&self, market: &MarketId, source: PriceSource) -> anyhow::Result<()>;

  /// Fallback write of the price authority.
  ///
  /// Used when `set_source` fails so the flag never stays on `ws`
  /// after the market is unsubscribed.
  async fn write_source_direct(
    &self,
    market: &MarketId,
    source: PriceSource,
  ) -> anyhow::Result<()>;

  /// List markets currently flagged with the given source.
  async fn list_markets_by_source(&self, source: PriceSource) -> anyhow::Result<Vec<MarketId>>;
}
