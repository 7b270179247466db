//! Message routing from feed event kinds to registered handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::event::{EventKind, FeedMessage, HandlerKind, UnroutedPolicy};
use crate::ports::update_sink::{MessageHandler, UpdateSink};

/// Handlers keyed by category, plus the policy for unrouted kinds.
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKind, Arc<dyn MessageHandler>>,
    policy: UnroutedPolicy,
}

impl HandlerRegistry {
    pub fn new(policy: UnroutedPolicy) -> Self {
        Self {
            handlers: HashMap::new(),
            policy,
        }
    }

    /// Register (or replace) the handler for a category.
    pub fn register(&mut self, kind: HandlerKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Pick the handler for an event kind.
    ///
    /// Kinds without a direct route, or whose category has no handler,
    /// go through the unrouted policy. `None` means drop.
    pub fn resolve(&self, kind: &EventKind) -> Option<Arc<dyn MessageHandler>> {
        if let Some(handler) = kind.direct_route().and_then(|k| self.handlers.get(&k)) {
            return Some(Arc::clone(handler));
        }

        match self.policy {
            UnroutedPolicy::FallbackToPrice => self.handlers.get(&HandlerKind::Price).cloned(),
            UnroutedPolicy::Drop => None,
        }
    }
}

/// Which sink method a `SinkHandler` forwards to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkRoute {
    Price,
    OrderBook,
    Trade,
}

/// Adapts one `UpdateSink` method to the `MessageHandler` callback.
pub struct SinkHandler {
    sink: Arc<dyn UpdateSink>,
    route: SinkRoute,
}

impl SinkHandler {
    pub fn new(sink: Arc<dyn UpdateSink>, route: SinkRoute) -> Arc<Self> {
        Arc::new(Self { sink, route })
    }
}

#[async_trait]
impl MessageHandler for SinkHandler {
    async fn handle(&self, msg: &FeedMessage) -> anyhow::Result<()> {
        match self.route {
            SinkRoute::Price => self.sink.handle_price_update(msg).await,
            SinkRoute::OrderBook => self.sink.handle_orderbook_update(msg).await,
            SinkRoute::Trade => self.sink.handle_trade_update(msg).await,
        }
    }
}
