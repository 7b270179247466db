//! Feed wire types: inbound frame classification and outbound commands.
//!
//! Inbound text frames are classified before any handler sees them:
//! keep-alive literals, empty payloads, malformed JSON and non-object
//! payloads never reach a handler. Structured messages carry an
//! explicit `EventKind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::market::TokenId;

/// Keep-alive literal sent to the feed.
pub const PING: &str = "PING";

/// Keep-alive literal expected back from the feed.
pub const PONG: &str = "PONG";

/// Event category carried by a structured feed message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Order book snapshot (`event_type: book`).
    Book,
    /// Incremental level change (`event_type: price_change`).
    PriceChange,
    /// Plain price update (`event_type: price`).
    Price,
    /// Last trade (`event_type: trade` / `last_trade_price`).
    Trade,
    /// Tick size change (`event_type: tick_size_change`).
    TickSizeChange,
    /// Generic market update (`type: market`, no `event_type`).
    MarketUpdate,
    /// Anything else, with the raw `event_type` (empty if absent).
    Unknown(String),
}

impl EventKind {
    /// Map a raw `event_type` value.
    pub fn from_event_type(raw: &str) -> Self {
        match raw {
            "book" => Self::Book,
            "price_change" => Self::PriceChange,
            "price" => Self::Price,
            "trade" | "last_trade_price" => Self::Trade,
            "tick_size_change" => Self::TickSizeChange,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Stable label for logs and metrics.
    pub fn label(&self) -> &str {
        match self {
            Self::Book => "book",
            Self::PriceChange => "price_change",
            Self::Price => "price",
            Self::Trade => "trade",
            Self::TickSizeChange => "tick_size_change",
            Self::MarketUpdate => "market",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Handler category a kind is routed to directly, if any.
    ///
    /// Generic market updates go straight to the price handler.
    pub fn direct_route(&self) -> Option<HandlerKind> {
        match self {
            Self::Book => Some(HandlerKind::Book),
            Self::PriceChange => Some(HandlerKind::PriceChange),
            Self::Price | Self::MarketUpdate => Some(HandlerKind::Price),
            Self::Trade => Some(HandlerKind::Trade),
            Self::TickSizeChange => Some(HandlerKind::TickSizeChange),
            Self::Unknown(_) => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "unknown({raw})"),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Handler categories a callback can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Book,
    PriceChange,
    Price,
    Trade,
    TickSizeChange,
}

/// What to do with a message whose category has no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnroutedPolicy {
    /// Hand it to the price handler (best effort, keeps prices fresh).
    #[default]
    FallbackToPrice,
    /// Log at debug level and drop it.
    Drop,
}

/// A structured message received from the feed.
#[derive(Debug, Clone)]
pub struct FeedMessage {
    /// Event category.
    pub kind: EventKind,
    /// Token the message refers to, when present at the top level.
    pub asset_id: Option<TokenId>,
    /// Market / condition id, when present.
    pub market: Option<String>,
    /// Raw JSON object.
    pub payload: Value,
    /// Local arrival time.
    pub received_at: DateTime<Utc>,
}

impl FeedMessage {
    /// Build a message from a JSON object.
    pub fn from_value(payload: Value) -> Self {
        let kind = match payload.get("event_type").and_then(Value::as_str) {
            Some(raw) => EventKind::from_event_type(raw),
            None if payload.get("type").and_then(Value::as_str) == Some("market") => {
                EventKind::MarketUpdate
            }
            None => EventKind::Unknown(String::new()),
        };

        let asset_id = payload
            .get("asset_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let market = payload
            .get("market")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            kind,
            asset_id,
            market,
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Classification of one inbound text frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Bare keep-alive literal.
    KeepAlive,
    /// Empty or whitespace-only payload.
    Empty,
    /// Not JSON.
    Malformed(String),
    /// Valid JSON that is not an object (arrays, scalars).
    Ignored,
    /// Structured message to route.
    Message(FeedMessage),
}

/// Classify an inbound text frame.
pub fn parse_frame(text: &str) -> InboundFrame {
    let trimmed = text.trim();

    if trimmed.eq_ignore_ascii_case(PONG) || trimmed.eq_ignore_ascii_case(PING) {
        return InboundFrame::KeepAlive;
    }
    if trimmed.is_empty() {
        return InboundFrame::Empty;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value @ Value::Object(_)) => InboundFrame::Message(FeedMessage::from_value(value)),
        Ok(_) => InboundFrame::Ignored,
        Err(e) => InboundFrame::Malformed(e.to_string()),
    }
}

/// Subscribe / unsubscribe command sent over the market channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedCommand {
    /// Token ids the command applies to.
    pub assets_ids: Vec<TokenId>,
    /// Channel type, always `market`.
    #[serde(rename = "type")]
    pub channel: &'static str,
    /// `unsubscribe` for removals; omitted for subscribe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<&'static str>,
}

impl FeedCommand {
    /// Subscribe to the given tokens.
    pub fn subscribe<I: IntoIterator<Item = TokenId>>(ids: I) -> Self {
        Self {
            assets_ids: ids.into_iter().collect(),
            channel: "market",
            action: None,
        }
    }

    /// Unsubscribe from the given tokens.
    pub fn unsubscribe<I: IntoIterator<Item = TokenId>>(ids: I) -> Self {
        Self {
            assets_ids: ids.into_iter().collect(),
            channel: "market",
            action: Some("unsubscribe"),
        }
    }

    /// Serialize to the JSON text frame.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_recognized_before_json() {
        assert!(matches!(parse_frame("PONG"), InboundFrame::KeepAlive));
        assert!(matches!(parse_frame(" pong\n"), InboundFrame::KeepAlive));
        assert!(matches!(parse_frame("PING"), InboundFrame::KeepAlive));
    }

    #[test]
    fn test_empty_and_malformed_frames() {
        assert!(matches!(parse_frame(""), InboundFrame::Empty));
        assert!(matches!(parse_frame("   "), InboundFrame::Empty));
        assert!(matches!(parse_frame("{not json"), InboundFrame::Malformed(_)));
    }

    #[test]
    fn test_non_object_payloads_ignored() {
        assert!(matches!(parse_frame("[]"), InboundFrame::Ignored));
        assert!(matches!(parse_frame(r#"[{"event_type":"book"}]"#), InboundFrame::Ignored));
        assert!(matches!(parse_frame("42"), InboundFrame::Ignored));
    }

    #[test]
    fn test_event_kinds_parsed() {
        let cases = [
            (r#"{"event_type":"book","asset_id":"a1","market":"m1"}"#, EventKind::Book),
            (r#"{"event_type":"price_change"}"#, EventKind::PriceChange),
            (r#"{"event_type":"price"}"#, EventKind::Price),
            (r#"{"event_type":"trade"}"#, EventKind::Trade),
            (r#"{"event_type":"last_trade_price"}"#, EventKind::Trade),
            (r#"{"event_type":"tick_size_change"}"#, EventKind::TickSizeChange),
            (r#"{"type":"market","asset_id":"a1"}"#, EventKind::MarketUpdate),
            (r#"{"event_type":"new_thing"}"#, EventKind::Unknown("new_thing".into())),
            (r#"{"foo":1}"#, EventKind::Unknown(String::new())),
        ];

        for (raw, expected) in cases {
            let InboundFrame::Message(msg) = parse_frame(raw) else {
                panic!("expected message for {raw}");
            };
            assert_eq!(msg.kind, expected, "{raw}");
        }
    }

    #[test]
    fn test_message_extracts_ids() {
        let InboundFrame::Message(msg) =
            parse_frame(r#"{"event_type":"book","asset_id":"a1","market":"0xabc"}"#)
        else {
            panic!("expected message");
        };
        assert_eq!(msg.asset_id.as_deref(), Some("a1"));
        assert_eq!(msg.market.as_deref(), Some("0xabc"));
    }

    #[test]
    fn test_direct_routes() {
        assert_eq!(EventKind::MarketUpdate.direct_route(), Some(HandlerKind::Price));
        assert_eq!(EventKind::Book.direct_route(), Some(HandlerKind::Book));
        assert_eq!(EventKind::Unknown("x".into()).direct_route(), None);
    }

    #[test]
    fn test_subscribe_command_wire_format() {
        let frame = FeedCommand::subscribe(vec!["A".to_string(), "B".to_string()])
            .to_frame()
            .unwrap();
        assert_eq!(frame, r#"{"assets_ids":["A","B"],"type":"market"}"#);
    }

    #[test]
    fn test_unsubscribe_command_wire_format() {
        let frame = FeedCommand::unsubscribe(vec!["A".to_string()])
            .to_frame()
            .unwrap();
        assert_eq!(
            frame,
            r#"{"assets_ids":["A"],"type":"market","action":"unsubscribe"}"#
        );
    }
}
