//! Price Cache — Latest Quote per Token with Broadcast Fan-out
//!
//! Implements the `UpdateSink` port. Keeps the most recent best bid,
//! best ask and trade price per token and emits a `QuoteUpdate` on a
//! broadcast channel (4096 buffer) for every change, so the rest of
//! the bot reads streamed prices without touching the feed.
//!
//! Book levels arrive either as `{"price","size"}` objects or as
//! `[price, size]` pairs; decimal strings are parsed with
//! `rust_decimal`. Values that don't parse are skipped.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::domain::event::FeedMessage;
use crate::domain::market::{MarketId, TokenId};
use crate::ports::update_sink::UpdateSink;

/// Broadcast buffer for quote updates.
const CHANNEL_CAPACITY: usize = 4096;

/// Latest known prices of one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenQuote {
    /// Market the token belongs to, when the feed said so.
    pub market: Option<MarketId>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub last_trade_price: Option<Decimal>,
    /// Most recent price of any kind.
    pub last_price: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl TokenQuote {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            market: None,
            best_bid: None,
            best_ask: None,
            last_trade_price: None,
            last_price: None,
            updated_at: now,
        }
    }

    /// Mid price when both sides are known.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
            _ => None,
        }
    }
}

/// Event emitted whenever a token's quote changes.
#[derive(Debug, Clone)]
pub struct QuoteUpdate {
    pub token_id: TokenId,
    pub quote: TokenQuote,
}

/// Fields carried by one inbound update.
#[derive(Debug, Default)]
struct QuotePatch {
    best_bid: Option<Decimal>,
    best_ask: Option<Decimal>,
    trade_price: Option<Decimal>,
    price: Option<Decimal>,
}

impl QuotePatch {
    fn is_empty(&self) -> bool {
        self.best_bid.is_none()
            && self.best_ask.is_none()
            && self.trade_price.is_none()
            && self.price.is_none()
    }
}

/// In-memory quote cache implementing `UpdateSink`.
pub struct PriceCache {
    quotes: RwLock<HashMap<TokenId, TokenQuote>>,
    tx: broadcast::Sender<QuoteUpdate>,
    running: AtomicBool,
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceCache {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            quotes: RwLock::new(HashMap::new()),
            tx,
            running: AtomicBool::new(false),
        }
    }

    /// Receive every quote change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QuoteUpdate> {
        self.tx.subscribe()
    }

    pub async fn quote(&self, token: &TokenId) -> Option<TokenQuote> {
        self.quotes.read().await.get(token).cloned()
    }

    pub async fn len(&self) -> usize {
        self.quotes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.quotes.read().await.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Merge a patch into a token's quote and broadcast the result.
    async fn apply(&self, token: &str, market: Option<&str>, patch: QuotePatch) {
        if patch.is_empty() {
            return;
        }

        let now = Utc::now();
        let quote = {
            let mut quotes = self.quotes.write().await;
            let quote = quotes
                .entry(token.to_string())
                .or_insert_with(|| TokenQuote::empty(now));

            if let Some(market) = market {
                quote.market = Some(market.to_string());
            }
            if patch.best_bid.is_some() {
                quote.best_bid = patch.best_bid;
            }
            if patch.best_ask.is_some() {
                quote.best_ask = patch.best_ask;
            }
            if let Some(price) = patch.trade_price {
                quote.last_trade_price = Some(price);
                quote.last_price = Some(price);
            }
            if let Some(price) = patch.price {
                quote.last_price = Some(price);
            }
            quote.updated_at = now;
            quote.clone()
        };

        // No receivers is fine.
        let _ = self.tx.send(QuoteUpdate {
            token_id: token.to_string(),
            quote,
        });
    }

    fn accepting(&self, msg: &FeedMessage) -> bool {
        let running = self.is_running();
        if !running {
            debug!(kind = %msg.kind, "Price cache stopped, update dropped");
        }
        running
    }
}

#[async_trait]
impl UpdateSink for PriceCache {
    async fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::Release);
        info!("Price cache started");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::Release);
        info!("Price cache stopped");
        Ok(())
    }

    async fn handle_price_update(&self, msg: &FeedMessage) -> anyhow::Result<()> {
        if !self.accepting(msg) {
            return Ok(());
        }

        // price_change carries one entry per affected token.
        if let Some(changes) = msg.payload.get("price_changes").and_then(Value::as_array) {
            for change in changes {
                let Some(token) = change
                    .get("asset_id")
                    .and_then(Value::as_str)
                    .or(msg.asset_id.as_deref())
                else {
                    continue;
                };
                self.apply(token, msg.market.as_deref(), top_level_patch(change))
                    .await;
            }
            return Ok(());
        }

        if let Some(token) = msg.asset_id.as_deref() {
            self.apply(token, msg.market.as_deref(), top_level_patch(&msg.payload))
                .await;
        }
        Ok(())
    }

    async fn handle_orderbook_update(&self, msg: &FeedMessage) -> anyhow::Result<()> {
        if !self.accepting(msg) {
            return Ok(());
        }
        let Some(token) = msg.asset_id.as_deref() else {
            return Ok(());
        };

        let patch = QuotePatch {
            best_bid: best_level(msg.payload.get("bids"), Side::Bid),
            best_ask: best_level(msg.payload.get("asks"), Side::Ask),
            ..QuotePatch::default()
        };
        self.apply(token, msg.market.as_deref(), patch).await;
        Ok(())
    }

    async fn handle_trade_update(&self, msg: &FeedMessage) -> anyhow::Result<()> {
        if !self.accepting(msg) {
            return Ok(());
        }
        let Some(token) = msg.asset_id.as_deref() else {
            return Ok(());
        };

        let patch = QuotePatch {
            trade_price: msg.payload.get("price").and_then(parse_decimal),
            ..QuotePatch::default()
        };
        self.apply(token, msg.market.as_deref(), patch).await;
        Ok(())
    }

    async fn on_market_unsubscribed(
        &self,
        market: &MarketId,
        tokens: &BTreeSet<TokenId>,
    ) -> anyhow::Result<()> {
        let mut quotes = self.quotes.write().await;
        let before = quotes.len();
        quotes.retain(|token, q| {
            !tokens.contains(token) && q.market.as_deref() != Some(market.as_str())
        });
        debug!(%market, purged = before - quotes.len(), "Quotes purged");
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Side {
    Bid,
    Ask,
}

fn top_level_patch(value: &Value) -> QuotePatch {
    QuotePatch {
        best_bid: value.get("best_bid").and_then(parse_decimal),
        best_ask: value.get("best_ask").and_then(parse_decimal),
        price: value.get("price").and_then(parse_decimal),
        ..QuotePatch::default()
    }
}

/// Highest bid or lowest ask among the given levels.
fn best_level(levels: Option<&Value>, side: Side) -> Option<Decimal> {
    let prices = levels?.as_array()?.iter().filter_map(level_price);
    match side {
        Side::Bid => prices.max(),
        Side::Ask => prices.min(),
    }
}

fn level_price(level: &Value) -> Option<Decimal> {
    match level {
        Value::Object(_) => level.get("price").and_then(parse_decimal),
        Value::Array(pair) => pair.first().and_then(parse_decimal),
        _ => None,
    }
}

fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}
