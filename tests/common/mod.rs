//! Shared test doubles: in-memory stores and a recording update sink.

#![allow(dead_code)]

pub mod mock_feed;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use polymarket_position_stream::adapters::feeds::ConnectionState;
use polymarket_position_stream::config::StreamingConfig;
use polymarket_position_stream::domain::event::FeedMessage;
use polymarket_position_stream::domain::market::{MarketId, PriceSource, TokenId};
use polymarket_position_stream::ports::{MarketStore, PositionStore, StreamContext, UpdateSink};

/// Poll `check` every 10ms until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Streaming config tuned for fast tests against a local feed.
pub fn fast_config(ws_url: &str) -> StreamingConfig {
    StreamingConfig {
        ws_url: ws_url.to_string(),
        heartbeat_interval_secs: 60,
        idle_poll_secs: 1,
        reconnect_base_ms: 20,
        reconnect_max_ms: 100,
        max_consecutive_errors: 5,
        cleanup_interval_secs: 3600,
        command_settle_ms: 10,
        connect_timeout_secs: 2,
        ..StreamingConfig::default()
    }
}

/// Markets with token ids and a source flag.
#[derive(Default)]
pub struct FakeMarkets {
    markets: Mutex<HashMap<MarketId, (BTreeSet<TokenId>, PriceSource)>>,
    pub fail_set_source: AtomicBool,
    pub direct_writes: AtomicUsize,
}

impl FakeMarkets {
    pub fn with(markets: &[(&str, &[&str])]) -> Arc<Self> {
        let store = Self::default();
        {
            let mut map = store.markets.lock().unwrap();
            for (id, tokens) in markets {
                let tokens = tokens.iter().map(|t| (*t).to_string()).collect();
                map.insert((*id).to_string(), (tokens, PriceSource::Poll));
            }
        }
        Arc::new(store)
    }

    pub fn source(&self, market: &str) -> PriceSource {
        self.markets.lock().unwrap()[market].1
    }

    pub fn force_source(&self, market: &str, source: PriceSource) {
        if let Some(entry) = self.markets.lock().unwrap().get_mut(market) {
            entry.1 = source;
        }
    }

    pub fn tokens(&self, market: &str) -> BTreeSet<TokenId> {
        self.markets.lock().unwrap()[market].0.clone()
    }
}

#[async_trait]
impl MarketStore for FakeMarkets {
    async fn get_token_ids(&self, market: &MarketId) -> anyhow::Result<BTreeSet<TokenId>> {
        self.markets
            .lock()
            .unwrap()
            .get(market)
            .map(|(tokens, _)| tokens.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown market {market}"))
    }

    async fn set_source(&self, market: &MarketId, source: PriceSource) -> anyhow::Result<()> {
        if self.fail_set_source.load(Ordering::SeqCst) {
            anyhow::bail!("primary write unavailable");
        }
        self.force_source(market, source);
        Ok(())
    }

    async fn write_source_direct(
        &self,
        market: &MarketId,
        source: PriceSource,
    ) -> anyhow::Result<()> {
        self.direct_writes.fetch_add(1, Ordering::SeqCst);
        self.force_source(market, source);
        Ok(())
    }

    async fn list_markets_by_source(&self, source: PriceSource) -> anyhow::Result<Vec<MarketId>> {
        let mut ids: Vec<MarketId> = self
            .markets
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (_, s))| *s == source)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Live position counts per market.
#[derive(Default)]
pub struct FakePositions {
    counts: Mutex<HashMap<MarketId, u64>>,
}

impl FakePositions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, market: &str, count: u64) {
        self.counts.lock().unwrap().insert(market.to_string(), count);
    }
}

#[async_trait]
impl PositionStore for FakePositions {
    async fn count_active_positions(&self, market: &MarketId) -> anyhow::Result<u64> {
        Ok(self.counts.lock().unwrap().get(market).copied().unwrap_or(0))
    }

    async fn list_active_position_markets(&self) -> anyhow::Result<BTreeSet<MarketId>> {
        Ok(self
            .counts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

/// Sink that counts calls per method.
#[derive(Default)]
pub struct RecordingSink {
    pub started: AtomicBool,
    pub price: AtomicUsize,
    pub book: AtomicUsize,
    pub trade: AtomicUsize,
    pub purged: Mutex<Vec<MarketId>>,
    /// Token ids handed over with every purge.
    pub purged_tokens: Mutex<BTreeSet<TokenId>>,
    /// Connection state seen when `stop()` ran.
    pub state_at_stop: Mutex<Option<ConnectionState>>,
    observed: Mutex<Option<watch::Receiver<ConnectionState>>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn observe(&self, connection: watch::Receiver<ConnectionState>) {
        *self.observed.lock().unwrap() = Some(connection);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateSink for RecordingSink {
    async fn start(&self) -> anyhow::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.started.store(false, Ordering::SeqCst);
        let state = self.observed.lock().unwrap().as_ref().map(|rx| *rx.borrow());
        *self.state_at_stop.lock().unwrap() = state;
        Ok(())
    }

    async fn handle_price_update(&self, _msg: &FeedMessage) -> anyhow::Result<()> {
        self.price.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_orderbook_update(&self, _msg: &FeedMessage) -> anyhow::Result<()> {
        self.book.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_trade_update(&self, _msg: &FeedMessage) -> anyhow::Result<()> {
        self.trade.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_market_unsubscribed(
        &self,
        market: &MarketId,
        tokens: &BTreeSet<TokenId>,
    ) -> anyhow::Result<()> {
        self.purged.lock().unwrap().push(market.clone());
        self.purged_tokens.lock().unwrap().extend(tokens.iter().cloned());
        Ok(())
    }
}

/// Fakes bundled with the context built from them.
pub struct Harness {
    pub markets: Arc<FakeMarkets>,
    pub positions: Arc<FakePositions>,
    pub sink: Arc<RecordingSink>,
    pub ctx: StreamContext,
}

impl Harness {
    pub fn new(markets: &[(&str, &[&str])]) -> Self {
        let markets = FakeMarkets::with(markets);
        let positions = FakePositions::new();
        let sink = RecordingSink::new();
        let ctx = StreamContext::new(markets.clone(), positions.clone(), sink.clone());
        Self {
            markets,
            positions,
            sink,
            ctx,
        }
    }
}
