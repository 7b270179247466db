//! Polymarket Market Channel Connection — Single Persistent Feed Session
//!
//! Owns one WebSocket connection to the CLOB market channel and the
//! set of token ids subscribed on it. The lifecycle task never opens
//! a socket while the set is empty, replays the whole set as one bulk
//! subscribe after every successful connect, and reconnects with
//! jittered exponential backoff until the consecutive-error budget is
//! exhausted.
//!
//! Features:
//! - Outbound frames (commands, keep-alive) share one mpsc channel
//! - Event-driven via tokio::select! (NEVER polling while connected)
//! - Cooperative cancellation via `CancellationToken` per session

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::handlers::HandlerRegistry;
use crate::adapters::metrics::StreamMetrics;
use crate::domain::backoff::ReconnectBackoff;
use crate::domain::event::{
    parse_frame, FeedCommand, HandlerKind, InboundFrame, UnroutedPolicy, PING,
};
use crate::domain::market::TokenId;
use crate::ports::update_sink::MessageHandler;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the stream ends without a Close frame.
const ABNORMAL_CLOSE: u16 = 1006;

/// Connection manager settings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Market channel WebSocket URL.
    pub url: String,
    /// Keep-alive period.
    pub heartbeat_interval: Duration,
    /// Re-check period while the subscription set is empty.
    pub idle_poll_interval: Duration,
    /// First reconnect delay.
    pub reconnect_base_delay: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_max_delay: Duration,
    /// Consecutive failures tolerated before stopping permanently.
    pub max_consecutive_errors: u32,
    /// Pause after a command frame to observe an immediate drop.
    pub command_settle: Duration,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// What to do with messages whose category has no handler.
    pub unrouted_policy: UnroutedPolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            idle_poll_interval: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_millis(1_000),
            reconnect_max_delay: Duration::from_millis(60_000),
            max_consecutive_errors: 10,
            command_settle: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            unrouted_policy: UnroutedPolicy::FallbackToPrice,
        }
    }
}

/// Lifecycle state of the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing subscribed; no socket held.
    Idle,
    Connecting,
    Connected,
    /// Waiting before the next connect attempt.
    Backoff,
    /// Stopped on request.
    Stopped,
    /// Error budget exhausted; needs an external restart.
    Failed,
}

impl ConnectionState {
    /// Stable lowercase name for logs and health checks.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Connection layer errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed: code={code}, reason={reason}")]
    Closed { code: u16, reason: String },

    #[error("Failed to serialize command: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Error budget exhausted after {consecutive} consecutive failures")]
    ErrorBudgetExhausted { consecutive: u32 },
}

/// Subscription set plus the outbound channel of the live session.
///
/// Both live under one lock so a resync snapshot and a concurrent
/// subscribe can never miss each other.
#[derive(Default)]
struct SubscriptionSet {
    tokens: BTreeSet<TokenId>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Ends the live session once the set is emptied.
    session: Option<CancellationToken>,
}

/// Running lifecycle task and its cancellation handle.
struct Lifecycle {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), StreamError>>,
}

/// Manager of the single market channel connection.
pub struct ConnectionManager {
    config: FeedConfig,
    metrics: Arc<StreamMetrics>,
    subscriptions: RwLock<SubscriptionSet>,
    handlers: RwLock<HandlerRegistry>,
    state: watch::Sender<ConnectionState>,
    /// Wakes an idle lifecycle loop when the set gains tokens.
    wake: Notify,
    running: AtomicBool,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl ConnectionManager {
    /// Create an idle manager; nothing runs until `start()`.
    pub fn new(config: FeedConfig, metrics: Arc<StreamMetrics>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let handlers = HandlerRegistry::new(config.unrouted_policy);
        Self {
            config,
            metrics,
            subscriptions: RwLock::new(SubscriptionSet::default()),
            handlers: RwLock::new(handlers),
            state,
            wake: Notify::new(),
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(None),
        }
    }

    /// Spawn the lifecycle task. No-op when already running.
    pub async fn start(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.running.load(Ordering::Acquire) {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = Arc::clone(self);

        self.running.store(true, Ordering::Release);
        self.set_state(ConnectionState::Idle);
        let task = tokio::spawn(async move {
            let result = this.run(token).await;
            this.running.store(false, Ordering::Release);
            result
        });

        *lifecycle = Some(Lifecycle { cancel, task });
        info!(url = %self.config.url, "Feed connection manager started");
    }

    /// Start unless the manager was stopped or failed for good.
    ///
    /// Returns whether the lifecycle task is running afterwards.
    pub async fn ensure_started(self: &Arc<Self>) -> bool {
        match self.state() {
            ConnectionState::Failed => {
                warn!("Feed connection failed permanently, not restarting");
                false
            }
            ConnectionState::Stopped => false,
            _ => {
                self.start().await;
                true
            }
        }
    }

    /// Cancel the lifecycle task, wait for it, and clear the set.
    pub async fn stop(&self) {
        let lifecycle = self.lifecycle.lock().await.take();

        if let Some(Lifecycle { cancel, task }) = lifecycle {
            cancel.cancel();
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Feed lifecycle had already stopped"),
                Err(e) => error!(error = %e, "Feed lifecycle task panicked"),
            }
        }

        {
            let mut subs = self.subscriptions.write().await;
            subs.tokens.clear();
            subs.outbound = None;
            subs.session = None;
        }
        self.metrics.subscribed_tokens.set(0);
        self.metrics.feed_connected.set(0);
        self.running.store(false, Ordering::Release);
        self.set_state(ConnectionState::Stopped);
        info!("Feed connection manager stopped");
    }

    /// Whether the lifecycle task is alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.metrics
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Snapshot of the subscription set.
    pub async fn subscribed(&self) -> BTreeSet<TokenId> {
        self.subscriptions.read().await.tokens.clone()
    }

    /// Register the callback for one message category.
    pub async fn register_handler(&self, kind: HandlerKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.register(kind, handler);
    }

    /// Add token ids to the set; returns how many were new.
    ///
    /// When connected, the new ids go out as one subscribe frame; when
    /// idle, the lifecycle loop is woken to connect. Nothing is sent
    /// when every id was already subscribed.
    pub async fn subscribe<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = TokenId>,
    {
        let (added, sent) = {
            let mut subs = self.subscriptions.write().await;
            let added: Vec<TokenId> = ids
                .into_iter()
                .filter(|id| subs.tokens.insert(id.clone()))
                .collect();
            self.record_set_size(subs.tokens.len());

            if added.is_empty() {
                return 0;
            }
            let sent = self.send_command(&subs, FeedCommand::subscribe(added.iter().cloned()));
            (added.len(), sent)
        };

        if !sent {
            self.wake.notify_one();
        }
        debug!(added, sent, "Subscribed tokens");
        if sent {
            self.settle().await;
        }
        added
    }

    /// Remove token ids from the set; returns how many were present.
    ///
    /// While disconnected only the local set changes; the next
    /// resync sends the set as it stands then. Emptying the set ends
    /// the live session after the unsubscribe frame is flushed.
    pub async fn unsubscribe<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = TokenId>,
    {
        let (removed, sent, closing) = {
            let mut subs = self.subscriptions.write().await;
            let removed: Vec<TokenId> = ids
                .into_iter()
                .filter(|id| subs.tokens.remove(id))
                .collect();
            self.record_set_size(subs.tokens.len());

            if removed.is_empty() {
                return 0;
            }
            let sent = self.send_command(&subs, FeedCommand::unsubscribe(removed.iter().cloned()));
            let closing = match subs.session.as_ref() {
                Some(session) if subs.tokens.is_empty() => {
                    session.cancel();
                    true
                }
                _ => false,
            };
            (removed.len(), sent, closing)
        };

        debug!(removed, sent, closing, "Unsubscribed tokens");
        if closing {
            info!("Subscription set emptied, closing feed session");
        } else if sent {
            self.settle().await;
        }
        removed
    }

    /// Queue a command on the live session, if any.
    fn send_command(&self, subs: &SubscriptionSet, command: FeedCommand) -> bool {
        let Some(outbound) = subs.outbound.as_ref() else {
            return false;
        };
        match command.to_frame() {
            Ok(frame) => outbound.send(frame).is_ok(),
            Err(e) => {
                warn!(error = %e, "Failed to serialize feed command");
                false
            }
        }
    }

    /// Give the feed a moment to reject the command by dropping us.
    async fn settle(&self) {
        tokio::time::sleep(self.config.command_settle).await;
        if self.state() != ConnectionState::Connected {
            warn!("Connection dropped right after a command; next resync corrects it");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn record_set_size(&self, len: usize) {
        self.metrics
            .subscribed_tokens
            .set(i64::try_from(len).unwrap_or(i64::MAX));
    }

    /// Lifecycle loop: idle → connecting → connected → backoff → ...
    #[instrument(skip(self, cancel), fields(url = %self.config.url))]
    async fn run(&self, cancel: CancellationToken) -> Result<(), StreamError> {
        let mut backoff =
            ReconnectBackoff::new(self.config.reconnect_base_delay, self.config.reconnect_max_delay);
        let mut consecutive_errors: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if self.subscriptions.read().await.tokens.is_empty() {
                self.set_state(ConnectionState::Idle);
                debug!("No subscriptions, not connecting");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Ok(()),
                    () = self.wake.notified() => continue,
                    () = tokio::time::sleep(self.config.idle_poll_interval) => continue,
                }
            }

            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                result = self.connect() => result,
            };

            let outcome = match connected {
                Ok(stream) => {
                    backoff.reset();
                    consecutive_errors = 0;
                    self.run_session(stream, &cancel).await
                }
                Err(e) => Err(e),
            };

            if cancel.is_cancelled() {
                return Ok(());
            }

            match &outcome {
                // Only an emptied set ends a session cleanly.
                Ok(()) => {
                    info!("Feed session closed");
                    continue;
                }
                Err(e) => warn!(error = %e, "Feed connection lost"),
            }

            if self.subscriptions.read().await.tokens.is_empty() {
                info!("Disconnected with nothing subscribed, going idle");
                continue;
            }

            consecutive_errors = consecutive_errors.saturating_add(1);
            if consecutive_errors > self.config.max_consecutive_errors {
                error!(
                    consecutive_errors,
                    max = self.config.max_consecutive_errors,
                    "Feed error budget exhausted, stopping permanently"
                );
                self.set_state(ConnectionState::Failed);
                return Err(StreamError::ErrorBudgetExhausted {
                    consecutive: consecutive_errors,
                });
            }

            let delay = backoff.next_delay();
            self.metrics.reconnects.inc();
            self.set_state(ConnectionState::Backoff);
            warn!(
                attempt = backoff.attempt(),
                consecutive_errors,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to feed"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Open the socket, bounded by the connect timeout.
    async fn connect(&self) -> Result<WsStream, StreamError> {
        info!(url = %self.config.url, "Connecting to market feed");

        match tokio::time::timeout(self.config.connect_timeout, connect_async(self.config.url.as_str()))
            .await
        {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => Err(StreamError::Connect(e.to_string())),
            Err(_) => Err(StreamError::ConnectTimeout(self.config.connect_timeout)),
        }
    }

    /// One connected session: resync, heartbeat, then pump frames until
    /// the socket drops or the manager is cancelled.
    async fn run_session(
        &self,
        stream: WsStream,
        cancel: &CancellationToken,
    ) -> Result<(), StreamError> {
        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let session = cancel.child_token();
        let session_id = Uuid::new_v4();

        let resynced = {
            let mut subs = self.subscriptions.write().await;
            let count = subs.tokens.len();
            if count > 0 {
                let frame = FeedCommand::subscribe(subs.tokens.iter().cloned()).to_frame()?;
                // Receiver is owned by this session.
                let _ = outbound_tx.send(frame);
            }
            subs.outbound = Some(outbound_tx.clone());
            subs.session = Some(session.clone());
            self.set_state(ConnectionState::Connected);
            count
        };

        self.metrics.feed_connected.set(1);
        info!(%session_id, tokens = resynced, "Feed connected, subscription set replayed");

        let heartbeat = tokio::spawn(heartbeat_loop(
            outbound_tx,
            self.config.heartbeat_interval,
            session.clone(),
        ));

        let result = loop {
            tokio::select! {
                biased;
                () = session.cancelled() => {
                    // Flush queued commands, e.g. the unsubscribe that emptied the set.
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if write.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(error = %e, "Close frame failed, dropping connection");
                    }
                    break Ok(());
                }
                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        break Err(e.into());
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1000, "Normal close".to_string()));
                        break Err(StreamError::Closed { code, reason });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                    None => {
                        break Err(StreamError::Closed {
                            code: ABNORMAL_CLOSE,
                            reason: "stream ended".to_string(),
                        })
                    }
                },
            }
        };

        session.cancel();
        if let Err(e) = heartbeat.await {
            debug!(error = %e, "Heartbeat task ended abnormally");
        }

        {
            let mut subs = self.subscriptions.write().await;
            subs.outbound = None;
            subs.session = None;
        }
        self.metrics.feed_connected.set(0);
        debug!(%session_id, "Feed session ended");
        result
    }

    /// Classify one text frame and route it.
    async fn handle_text(&self, text: &str) {
        match parse_frame(text) {
            InboundFrame::KeepAlive => debug!("Keep-alive received"),
            InboundFrame::Empty => debug!("Empty frame skipped"),
            InboundFrame::Ignored => debug!("Non-object frame ignored"),
            InboundFrame::Malformed(reason) => {
                self.metrics.malformed_frames.inc();
                debug!(%reason, "Malformed frame skipped");
            }
            InboundFrame::Message(msg) => {
                self.metrics
                    .messages
                    .with_label_values(&[msg.kind.label()])
                    .inc();

                let handler = self.handlers.read().await.resolve(&msg.kind);
                match handler {
                    Some(handler) => {
                        if let Err(e) = handler.handle(&msg).await {
                            warn!(kind = %msg.kind, error = %e, "Message handler failed");
                        }
                    }
                    None => debug!(kind = %msg.kind, "No handler for message, dropped"),
                }
            }
        }
    }
}

/// Push the keep-alive literal into the outbound channel on a fixed period.
async fn heartbeat_loop(
    outbound: mpsc::UnboundedSender<String>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if outbound.send(PING.to_string()).is_err() {
                    break;
                }
                debug!("Keep-alive sent");
            }
        }
    }
}
