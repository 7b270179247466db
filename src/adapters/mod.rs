//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (WebSockets, file I/O, HTTP). Each sub-module
//! groups adapters by infrastructure concern.
//!
//! Adapter categories:
//! - `feeds`: Polymarket market channel connection and message routing
//! - `metrics`: Prometheus metrics export and health checks
//! - `persistence`: JSON market/position snapshots
//! - `sink`: Latest-quote cache fed by the stream

pub mod feeds;
pub mod metrics;
pub mod persistence;
pub mod sink;
