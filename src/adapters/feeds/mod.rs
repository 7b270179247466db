//! Market Data Feed Adapters - Real-time Price Streaming
//!
//! Provides the Polymarket CLOB market channel connection:
//! - Connection: single persistent WebSocket with resync and backoff
//! - Handlers: routing of feed event kinds to update sink callbacks

pub mod connection;
pub mod handlers;

pub use connection::{ConnectionManager, ConnectionState, FeedConfig, StreamError};
pub use handlers::{HandlerRegistry, SinkHandler, SinkRoute};
