//! Use Cases Layer - Application Business Logic
//!
//! Orchestrates domain logic with port interfaces to implement
//! the streaming workflows.
//!
//! Use cases:
//! - `SubscriptionManager`: Position-driven subscribe/unsubscribe and reconciliation
//! - `StreamingService`: Lifecycle orchestration and trade/close hooks

pub mod streaming_service;
pub mod subscription_manager;

pub use streaming_service::StreamingService;
pub use subscription_manager::{ReconcileReport, SubscriptionManager};
