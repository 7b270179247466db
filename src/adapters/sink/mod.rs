//! Update Sink Adapters
//!
//! Consumers of streamed market data that implement `UpdateSink`.

pub mod price_cache;

pub use price_cache::{PriceCache, QuoteUpdate, TokenQuote};
