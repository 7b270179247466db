//! Persistence Adapters - JSON File Storage
//!
//! Implements the `MarketStore` and `PositionStore` ports on top of
//! JSON snapshots in the data directory. No database dependency.

pub mod json_store;

pub use json_store::JsonStore;
