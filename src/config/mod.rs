//! Configuration Module - TOML-based Streaming Configuration
//!
//! Loads and validates configuration from `config.toml`.
//! Feed endpoints, timings and thresholds are externalized here -
//! nothing is hardcoded in the usecases layer.

pub mod loader;

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::adapters::feeds::connection::FeedConfig;
use crate::domain::event::UnroutedPolicy;

/// Top-level configuration.
///
/// Loaded from `config.toml` at startup. All fields are validated
/// before any task is spawned.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Process identity and logging.
  pub bot: BotConfig,
  /// Streaming subsystem settings.
  #[serde(default)]
  pub streaming: StreamingConfig,
  /// Local market/position snapshot files.
  #[serde(default)]
  pub persistence: PersistenceConfig,
  /// Metrics and monitoring.
  #[serde(default)]
  pub metrics: MetricsConfig,
}

/// Process identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
  /// Human-readable name used in logs.
  pub name: String,
  /// Log level (trace, debug, info, warn, error).
  #[serde(default = "default_log_level")]
  pub log_level: String,
  /// Log output format.
  #[serde(default)]
  pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
  /// JSON lines for log aggregation.
  #[default]
  Json,
  /// Human-readable.
  Pretty,
}

/// Streaming subsystem configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
  /// Gate for the whole subsystem.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Market channel WebSocket URL.
  #[serde(default = "default_ws_url")]
  pub ws_url: String,
  /// Keep-alive period (seconds).
  #[serde(default = "default_heartbeat_interval")]
  pub heartbeat_interval_secs: u64,
  /// How often an idle manager re-checks for subscriptions (seconds).
  #[serde(default = "default_idle_poll")]
  pub idle_poll_secs: u64,
  /// First reconnect delay (milliseconds).
  #[serde(default = "default_reconnect_base")]
  pub reconnect_base_ms: u64,
  /// Reconnect delay ceiling (milliseconds).
  #[serde(default = "default_reconnect_max")]
  pub reconnect_max_ms: u64,
  /// Consecutive failures tolerated before stopping for good.
  #[serde(default = "default_max_consecutive_errors")]
  pub max_consecutive_errors: u32,
  /// Reconciliation period (seconds).
  #[serde(default = "default_cleanup_interval")]
  pub cleanup_interval_secs: u64,
  /// Pause after sending a command frame (milliseconds).
  #[serde(default = "default_command_settle")]
  pub command_settle_ms: u64,
  /// Handshake timeout (seconds).
  #[serde(default = "default_connect_timeout")]
  pub connect_timeout_secs: u64,
  /// Positions at or below this absolute amount are dust.
  #[serde(default = "default_dust_threshold")]
  pub dust_threshold: Decimal,
  /// What to do with messages whose category has no handler.
  #[serde(default)]
  pub unrouted_policy: UnroutedPolicy,
}

impl Default for StreamingConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      ws_url: default_ws_url(),
      heartbeat_interval_secs: default_heartbeat_interval(),
      idle_poll_secs: default_idle_poll(),
      reconnect_base_ms: default_reconnect_base(),
      reconnect_max_ms: default_reconnect_max(),
      max_consecutive_errors: default_max_consecutive_errors(),
      cleanup_interval_secs: default_cleanup_interval(),
      command_settle_ms: default_command_settle(),
      connect_timeout_secs: default_connect_timeout(),
      dust_threshold: default_dust_threshold(),
      unrouted_policy: UnroutedPolicy::default(),
    }
  }
}

impl StreamingConfig {
  /// Connection manager settings derived from this section.
  pub fn feed_config(&self) -> FeedConfig {
    FeedConfig {
      url: self.ws_url.clone(),
      heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
      idle_poll_interval: Duration::from_secs(self.idle_poll_secs),
      reconnect_base_delay: Duration::from_millis(self.reconnect_base_ms),
      reconnect_max_delay: Duration::from_millis(self.reconnect_max_ms),
      max_consecutive_errors: self.max_consecutive_errors,
      command_settle: Duration::from_millis(self.command_settle_ms),
      connect_timeout: Duration::from_secs(self.connect_timeout_secs),
      unrouted_policy: self.unrouted_policy,
    }
  }

  /// Reconciliation period.
  pub const fn cleanup_interval(&self) -> Duration {
    Duration::from_secs(self.cleanup_interval_secs)
  }
}

/// Local snapshot persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
  /// Directory holding `markets.json` and `positions.json`.
  #[serde(default = "default_data_dir")]
  pub data_dir: String,
  /// How often positions are re-read from disk (seconds).
  #[serde(default = "default_positions_reload")]
  pub positions_reload_secs: u64,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      data_dir: default_data_dir(),
      positions_reload_secs: default_positions_reload(),
    }
  }
}

/// Metrics and monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
  /// Enable Prometheus metrics export.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Metrics server bind address.
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
  /// Health check endpoint port.
  #[serde(default = "default_health_port")]
  pub health_port: u16,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: default_metrics_addr(),
      health_port: default_health_port(),
    }
  }
}

// Default value functions for serde

fn default_log_level() -> String {
  "info".to_string()
}

const fn default_true() -> bool {
  true
}

fn default_ws_url() -> String {
  "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
}

const fn default_heartbeat_interval() -> u64 {
  10
}

const fn default_idle_poll() -> u64 {
  10
}

const fn default_reconnect_base() -> u64 {
  1_000
}

const fn default_reconnect_max() -> u64 {
  60_000
}

const fn default_max_consecutive_errors() -> u32 {
  10
}

const fn default_cleanup_interval() -> u64 {
  300
}

const fn default_command_settle() -> u64 {
  100
}

const fn default_connect_timeout() -> u64 {
  10
}

fn default_dust_threshold() -> Decimal {
  dec!(0.01)
}

fn default_data_dir() -> String {
  "data".to_string()
}

const fn default_positions_reload() -> u64 {
  30
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}

const fn default_health_port() -> u16 {
  8080
}
