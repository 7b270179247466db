//! JSON Store - File-backed Market and Position Snapshots
//!
//! Loads `markets.json` and `positions.json` from the data directory
//! and serves them through the `MarketStore` and `PositionStore` ports.
//! Source flag changes are persisted with atomic writes (write to tmp
//! file, then rename); the fallback path writes the file in place.
//! Positions are owned by an external writer and only re-read.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::domain::market::{Market, MarketId, Position, PriceSource, TokenId};
use crate::ports::market_store::MarketStore;
use crate::ports::position_store::PositionStore;

const MARKETS_FILE: &str = "markets.json";
const POSITIONS_FILE: &str = "positions.json";

/// In-memory market and position store persisted as JSON files.
pub struct JsonStore {
    /// Path to markets.json.
    markets_path: PathBuf,
    /// Temporary path for atomic writes.
    tmp_path: PathBuf,
    /// Path to positions.json.
    positions_path: PathBuf,
    /// Markets keyed by id.
    markets: RwLock<BTreeMap<MarketId, Market>>,
    /// Last loaded positions.
    positions: RwLock<Vec<Position>>,
    /// Positions at or below this absolute amount are ignored.
    dust_threshold: Decimal,
}

impl JsonStore {
    /// Open the store in the given data directory.
    ///
    /// Creates the directory if it doesn't exist. Missing files mean an
    /// empty store. Markets with fewer than two distinct tokens are
    /// skipped with a warning.
    pub async fn open(data_dir: &str, dust_threshold: Decimal) -> Result<Self> {
        let dir = Path::new(data_dir);
        fs::create_dir_all(dir)
            .await
            .context("Failed to create data directory")?;

        let markets_path = dir.join(MARKETS_FILE);
        let positions_path = dir.join(POSITIONS_FILE);

        let markets = load_markets(&markets_path).await?;
        let positions = load_json::<Vec<Position>>(&positions_path)
            .await?
            .unwrap_or_default();

        info!(
            dir = %dir.display(),
            markets = markets.len(),
            positions = positions.len(),
            "JSON store loaded"
        );

        Ok(Self {
            tmp_path: dir.join(format!("{MARKETS_FILE}.tmp")),
            markets_path,
            positions_path,
            markets: RwLock::new(markets),
            positions: RwLock::new(positions),
            dust_threshold,
        })
    }

    /// Re-read positions.json; returns the number of positions loaded.
    #[instrument(skip(self))]
    pub async fn reload_positions(&self) -> Result<usize> {
        let positions = load_json::<Vec<Position>>(&self.positions_path)
            .await?
            .unwrap_or_default();
        let count = positions.len();
        *self.positions.write().await = positions;
        debug!(count, "Positions reloaded");
        Ok(count)
    }

    /// Current copy of a market.
    pub async fn market(&self, id: &MarketId) -> Option<Market> {
        self.markets.read().await.get(id).cloned()
    }

    async fn update_source(
        &self,
        market: &MarketId,
        source: PriceSource,
        atomic: bool,
    ) -> Result<()> {
        let mut markets = self.markets.write().await;
        let entry = markets
            .get_mut(market)
            .with_context(|| format!("Unknown market {market}"))?;
        entry.source = source;

        let snapshot: Vec<&Market> = markets.values().collect();
        let json =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize markets")?;

        if atomic {
            fs::write(&self.tmp_path, &json)
                .await
                .context("Failed to write tmp markets file")?;
            fs::rename(&self.tmp_path, &self.markets_path)
                .await
                .context("Failed to rename markets file")?;
        } else {
            fs::write(&self.markets_path, &json)
                .await
                .context("Failed to write markets file")?;
        }

        debug!(%market, %source, atomic, "Market source persisted");
        Ok(())
    }
}

#[async_trait]
impl MarketStore for JsonStore {
    async fn get_token_ids(&self, market: &MarketId) -> Result<BTreeSet<TokenId>> {
        self.markets
            .read()
            .await
            .get(market)
            .map(Market::token_set)
            .with_context(|| format!("Unknown market {market}"))
    }

    async fn set_source(&self, market: &MarketId, source: PriceSource) -> Result<()> {
        self.update_source(market, source, true).await
    }

    async fn write_source_direct(&self, market: &MarketId, source: PriceSource) -> Result<()> {
        self.update_source(market, source, false).await
    }

    async fn list_markets_by_source(&self, source: PriceSource) -> Result<Vec<MarketId>> {
        Ok(self
            .markets
            .read()
            .await
            .values()
            .filter(|m| m.source == source)
            .map(|m| m.id.clone())
            .collect())
    }
}

#[async_trait]
impl PositionStore for JsonStore {
    async fn count_active_positions(&self, market: &MarketId) -> Result<u64> {
        let count = self
            .positions
            .read()
            .await
            .iter()
            .filter(|p| &p.market_id == market && p.is_live(self.dust_threshold))
            .count();
        Ok(count as u64)
    }

    async fn list_active_position_markets(&self) -> Result<BTreeSet<MarketId>> {
        Ok(self
            .positions
            .read()
            .await
            .iter()
            .filter(|p| p.is_live(self.dust_threshold))
            .map(|p| p.market_id.clone())
            .collect())
    }
}

async fn load_markets(path: &Path) -> Result<BTreeMap<MarketId, Market>> {
    let markets = load_json::<Vec<Market>>(path).await?.unwrap_or_default();

    let mut by_id = BTreeMap::new();
    for market in markets {
        if !market.is_well_formed() {
            warn!(market = %market.id, tokens = market.token_ids.len(), "Skipping malformed market");
            continue;
        }
        by_id.insert(market.id.clone(), market);
    }
    Ok(by_id)
}

/// Read and parse a JSON file; `None` if it doesn't exist.
async fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        info!(path = %path.display(), "No file found, starting empty");
        return Ok(None);
    }

    let json = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MARKETS: &str = r#"[
        {"id":"m1","token_ids":["a1","a2"]},
        {"id":"m2","token_ids":["b1","b2"],"source":"ws"},
        {"id":"bad","token_ids":["only"]}
    ]"#;

    const POSITIONS: &str = r#"[
        {"user_id":"u1","market_id":"m1","status":"active","amount":"10"},
        {"user_id":"u2","market_id":"m1","status":"active","amount":"0.001"},
        {"user_id":"u3","market_id":"m2","status":"closed","amount":"4"}
    ]"#;

    async fn store(dir: &tempfile::TempDir) -> JsonStore {
        std::fs::write(dir.path().join(MARKETS_FILE), MARKETS).unwrap();
        std::fs::write(dir.path().join(POSITIONS_FILE), POSITIONS).unwrap();
        JsonStore::open(dir.path().to_str().unwrap(), dec!(0.01))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_files_mean_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().to_str().unwrap(), dec!(0.01))
            .await
            .unwrap();
        assert!(store.list_active_position_markets().await.unwrap().is_empty());
        assert!(store.get_token_ids(&"m1".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_market_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        assert!(store.market(&"bad".to_string()).await.is_none());
        let tokens = store.get_token_ids(&"m1".to_string()).await.unwrap();
        assert_eq!(tokens, BTreeSet::from(["a1".to_string(), "a2".to_string()]));
    }

    #[tokio::test]
    async fn test_dust_and_closed_positions_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        assert_eq!(store.count_active_positions(&"m1".to_string()).await.unwrap(), 1);
        assert_eq!(store.count_active_positions(&"m2".to_string()).await.unwrap(), 0);
        assert_eq!(
            store.list_active_position_markets().await.unwrap(),
            BTreeSet::from(["m1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_set_source_persists_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.set_source(&"m1".to_string(), PriceSource::Ws).await.unwrap();

        assert!(!dir.path().join("markets.json.tmp").exists());
        let reopened = JsonStore::open(dir.path().to_str().unwrap(), dec!(0.01))
            .await
            .unwrap();
        let ws = reopened.list_markets_by_source(PriceSource::Ws).await.unwrap();
        assert_eq!(ws, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[tokio::test]
    async fn test_write_source_direct_and_unknown_market() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store
            .write_source_direct(&"m2".to_string(), PriceSource::Poll)
            .await
            .unwrap();
        assert_eq!(
            store.market(&"m2".to_string()).await.unwrap().source,
            PriceSource::Poll
        );
        assert!(store
            .set_source(&"nope".to_string(), PriceSource::Ws)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reload_positions_picks_up_external_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        std::fs::write(
            dir.path().join(POSITIONS_FILE),
            r#"[{"user_id":"u1","market_id":"m2","status":"active","amount":"3"}]"#,
        )
        .unwrap();

        assert_eq!(store.reload_positions().await.unwrap(), 1);
        assert_eq!(
            store.list_active_position_markets().await.unwrap(),
            BTreeSet::from(["m2".to_string()])
        );
    }
}
