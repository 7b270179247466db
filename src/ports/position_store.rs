//! Position Store Port - Read-only Position Queries
//!
//! Positions are owned by the persistence layer. The streaming
//! engine only asks which markets are still held.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::market::MarketId;

/// Trait for position data providers.
///
/// Counts exclude closed and dust positions.
#[async_trait]
pub trait PositionStore: Send + Sync + 'static {
  /// Count live positions in a market across all users.
  async fn count_active_positions(&self, market: &MarketId) -> anyhow::Result<u64>;

  /// Every market referenced by at least one live position.
  async fn list_active_position_markets(&self) -> anyhow::Result<BTreeSet<MarketId>>;
}
