//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) the streaming usecases require
//! from the outside world. Adapters implement these traits.
//!
//! Port categories:
//! - `MarketStore`: market tokens and the poll/ws source flag
//! - `PositionStore`: read-only live position queries
//! - `UpdateSink`: downstream consumer of streamed updates

pub mod market_store;
pub mod position_store;
pub mod update_sink;

use std::sync::Arc;

pub use market_store::MarketStore;
pub use position_store::PositionStore;
pub use update_sink::{MessageHandler, UpdateSink};

/// Collaborators injected into the streaming usecases.
///
/// Built once at startup and cloned into every dependent, so tests
/// can substitute any collaborator with a double.
#[derive(Clone)]
pub struct StreamContext {
  /// Market metadata and source flag.
  pub markets: Arc<dyn MarketStore>,
  /// Live position queries.
  pub positions: Arc<dyn PositionStore>,
  /// Consumer of streamed updates.
  pub sink: Arc<dyn UpdateSink>,
}

impl StreamContext {
  /// Bundle the three collaborators.
  pub fn new(
    markets: Arc<dyn MarketStore>,
    positions: Arc<dyn PositionStore>,
    sink: Arc<dyn UpdateSink>,
  ) -> Self {
    Self {
      markets,
      positions,
      sink,
    }
  }
}
