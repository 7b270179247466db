//! Domain layer - Core streaming types and pure logic.
//!
//! No I/O here: market/position models, the reconnect backoff
//! schedule, and feed frame classification. Everything is testable
//! in isolation.

pub mod backoff;
pub mod event;
pub mod market;

// Re-export core types for convenience
pub use backoff::ReconnectBackoff;
pub use event::{
    EventKind, FeedCommand, FeedMessage, HandlerKind, InboundFrame, UnroutedPolicy, parse_frame,
};
pub use market::{Market, MarketId, Position, PositionStatus, PriceSource, TokenId, UserId};
