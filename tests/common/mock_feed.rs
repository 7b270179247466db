//! Mock market channel server for lifecycle tests.
//!
//! Provides a local WebSocket server that can:
//! - Accept connections and count them
//! - Record received text frames per connection
//! - Answer `PING` with `PONG`
//! - Push frames to every open connection
//! - Drop every open connection without a Close frame
//! - Count Close frames sent by the client

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// One text frame received from the client.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    /// 1-based connection number.
    pub connection: u32,
    pub text: String,
}

struct Shared {
    frames: Mutex<Vec<ReceivedFrame>>,
    connections: AtomicU32,
    client_closes: AtomicU32,
    push: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
}

/// A mock feed server for testing.
pub struct MockFeed {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockFeed {
    /// Start a new mock feed on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (push, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            frames: Mutex::new(Vec::new()),
            connections: AtomicU32::new(0),
            client_closes: AtomicU32::new(0),
            push,
            kick,
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let id = accept_shared.connections.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(handle_connection(stream, id, Arc::clone(&accept_shared)));
            }
        });

        Self {
            addr,
            shared,
            accept_task,
        }
    }

    /// URL of a local port with nothing listening.
    pub async fn closed_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}")
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> u32 {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Connections the client ended with a Close frame.
    pub fn client_closes(&self) -> u32 {
        self.shared.client_closes.load(Ordering::SeqCst)
    }

    pub async fn frames(&self) -> Vec<ReceivedFrame> {
        self.shared.frames.lock().await.clone()
    }

    /// Command frames (everything but keep-alives) on one connection.
    pub async fn commands_on(&self, connection: u32) -> Vec<String> {
        self.frames()
            .await
            .into_iter()
            .filter(|f| f.connection == connection && f.text != "PING")
            .map(|f| f.text)
            .collect()
    }

    pub async fn pings(&self) -> usize {
        self.frames()
            .await
            .iter()
            .filter(|f| f.text == "PING")
            .count()
    }

    /// Send a text frame to every open connection.
    pub fn push(&self, text: &str) {
        let _ = self.shared.push.send(text.to_string());
    }

    /// Drop every open connection without a Close frame.
    pub fn drop_connections(&self) {
        let _ = self.shared.kick.send(());
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

async fn handle_connection(stream: TcpStream, id: u32, shared: Arc<Shared>) {
    let mut kick = shared.kick.subscribe();
    let mut push = shared.push.subscribe();

    let Ok(ws_stream) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = kick.recv() => return,
            Ok(text) = push.recv() => {
                if write.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    shared.frames.lock().await.push(ReceivedFrame {
                        connection: id,
                        text: text.clone(),
                    });
                    if text == "PING" {
                        let _ = write.send(Message::Text("PONG".to_string())).await;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    shared.client_closes.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}
