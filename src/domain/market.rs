//! Market and position domain types.
//!
//! A market aggregates two or more outcome tokens and carries the
//! `source` flag that says which subsystem owns its price: the polling
//! fallback or the streaming feed. Positions are owned by the external
//! persistence layer and are read-only here.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────
// Identifiers used at the ports boundary
// ────────────────────────────────────────────

/// Opaque identifier of one tradable outcome; the subscription unit.
pub type TokenId = String;

/// Market / condition identifier.
pub type MarketId = String;

/// Identifier of the bot user owning a position.
pub type UserId = String;

/// Which subsystem currently supplies a market's price.
///
/// A market holds exactly one value, so the polling subsystem and the
/// streaming feed can never both be authoritative for the same market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    /// Periodic REST polling (default authority).
    #[default]
    Poll,
    /// Live push feed.
    Ws,
}

impl std::fmt::Display for PriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Poll => write!(f, "poll"),
            Self::Ws => write!(f, "ws"),
        }
    }
}

/// A prediction market with two or more outcome tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    /// Condition ID.
    pub id: MarketId,
    /// Human-readable question, if known.
    #[serde(default)]
    pub question: String,
    /// Outcome token ids (YES/NO for binary markets).
    pub token_ids: Vec<TokenId>,
    /// Current price authority.
    #[serde(default)]
    pub source: PriceSource,
}

impl Market {
    /// Create a market that is priced by polling.
    pub fn new(id: impl Into<MarketId>, token_ids: Vec<TokenId>) -> Self {
        Self {
            id: id.into(),
            question: String::new(),
            token_ids,
            source: PriceSource::Poll,
        }
    }

    /// Token ids as an ordered set.
    pub fn token_set(&self) -> BTreeSet<TokenId> {
        self.token_ids.iter().cloned().collect()
    }

    /// Markets need at least two distinct outcomes to be tradable.
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty() && self.token_set().len() >= 2
    }
}

/// Lifecycle status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Active,
    Closed,
}

/// A user's position in a market (read-only view).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Owning user.
    pub user_id: UserId,
    /// Market the position is held in.
    pub market_id: MarketId,
    /// Active or closed.
    pub status: PositionStatus,
    /// Number of shares held.
    pub amount: Decimal,
    /// Last time the position changed.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Whether this position keeps its market in streaming scope.
    ///
    /// Closed positions and dust (|amount| <= threshold) do not count.
    pub fn is_live(&self, dust_threshold: Decimal) -> bool {
        self.status == PositionStatus::Active && self.amount.abs() > dust_threshold
    }
}
