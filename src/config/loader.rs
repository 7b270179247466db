//! Configuration Loader - TOML Parsing and Bounds Checks
//!
//! Reads the stream configuration file and rejects feed settings the
//! connection manager cannot run with (bad URL scheme, inverted
//! backoff bounds, zero error budget).

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::info;

use super::AppConfig;

/// Read, parse and validate the configuration at `path`.
///
/// # Errors
/// Fails on an unreadable file, invalid TOML, or any bound check.
pub fn load_config(path: &str) -> Result<AppConfig> {
  let path = Path::new(path);

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let config = parse_config(&content)?;

  info!(
    name = %config.bot.name,
    streaming = config.streaming.enabled,
    ws_url = %config.streaming.ws_url,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
  let config: AppConfig =
    toml::from_str(content).with_context(|| "Failed to parse config.toml")?;

  validate_config(&config)?;
  Ok(config)
}

/// Validate all configuration parameters.
///
/// Checks for:
/// - A usable WebSocket URL
/// - Positive timings
/// - Base reconnect delay not above the ceiling
/// - A non-zero error budget
fn validate_config(config: &AppConfig) -> Result<()> {
  let s = &config.streaming;

  anyhow::ensure!(!config.bot.name.is_empty(), "bot.name must not be empty");

  anyhow::ensure!(
    s.ws_url.starts_with("ws://") || s.ws_url.starts_with("wss://"),
    "streaming.ws_url must be a ws:// or wss:// URL, got {:?}",
    s.ws_url
  );
  anyhow::ensure!(
    s.heartbeat_interval_secs > 0,
    "streaming.heartbeat_interval_secs must be positive"
  );
  anyhow::ensure!(s.idle_poll_secs > 0, "streaming.idle_poll_secs must be positive");
  anyhow::ensure!(
    s.reconnect_base_ms > 0,
    "streaming.reconnect_base_ms must be positive"
  );
  anyhow::ensure!(
    s.reconnect_base_ms <= s.reconnect_max_ms,
    "streaming.reconnect_base_ms ({}) must not exceed reconnect_max_ms ({})",
    s.reconnect_base_ms,
    s.reconnect_max_ms
  );
  anyhow::ensure!(
    s.max_consecutive_errors >= 1,
    "streaming.max_consecutive_errors must be at least 1"
  );
  anyhow::ensure!(
    s.cleanup_interval_secs > 0,
    "streaming.cleanup_interval_secs must be positive"
  );
  anyhow::ensure!(
    s.connect_timeout_secs > 0,
    "streaming.connect_timeout_secs must be positive"
  );
  anyhow::ensure!(
    s.dust_threshold >= Decimal::ZERO,
    "streaming.dust_threshold must be non-negative, got {}",
    s.dust_threshold
  );

  anyhow::ensure!(
    !config.persistence.data_dir.is_empty(),
    "persistence.data_dir must not be empty"
  );
  anyhow::ensure!(
    config.persistence.positions_reload_secs > 0,
    "persistence.positions_reload_secs must be positive"
  );

  Ok(())
}
