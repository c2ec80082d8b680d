use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::common::error::RealtimeError;
use crate::common::protocol::{AuthResponse, ClientFrame, RealtimeEnvelope};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Connecting,
    Connected,
    Disconnected,
}

/// Connection health published by a realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHealth {
    pub mode: ChannelMode,
    pub failure_count: u32,
}

impl ChannelHealth {
    pub fn connected() -> Self {
        Self { mode: ChannelMode::Connected, failure_count: 0 }
    }

    /// Whether events may be missing and polling has to cover for the socket.
    pub fn is_degraded(&self) -> bool {
        self.mode != ChannelMode::Connected || self.failure_count >= 3
    }
}

impl Default for ChannelHealth {
    fn default() -> Self {
        Self { mode: ChannelMode::Connecting, failure_count: 0 }
    }
}

/// Outbound half of the realtime connection. Inbound envelopes and health
/// travel over the channels handed out when the connection is created.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), RealtimeError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), RealtimeError>;
    async fn send_typing(&self, topic: &str) -> Result<(), RealtimeError>;
}

/// WebSocket implementation with automatic reconnect and re-subscription.
pub struct WebSocketChannel {
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    topics: Arc<Mutex<BTreeSet<String>>>,
}

impl WebSocketChannel {
    /// Starts the connection supervisor and returns the channel with its
    /// event stream and health signal.
    pub fn connect(
        url: String,
        token: String,
    ) -> (Self, mpsc::Receiver<RealtimeEnvelope>, watch::Receiver<ChannelHealth>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (health_tx, health_rx) = watch::channel(ChannelHealth::default());
        let topics = Arc::new(Mutex::new(BTreeSet::new()));

        let supervisor = Supervisor { url, token, topics: topics.clone(), events_tx, health_tx };
        tokio::spawn(supervisor.run(outgoing_rx));

        (Self { outgoing: outgoing_tx, topics }, events_rx, health_rx)
    }

    fn topics(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send_frame(&self, frame: ClientFrame) -> Result<(), RealtimeError> {
        self.outgoing
            .send(frame)
            .map_err(|_| RealtimeError::SendFailed("realtime supervisor has stopped".to_string()))
    }
}

#[async_trait]
impl RealtimeChannel for WebSocketChannel {
    async fn subscribe(&self, topic: &str) -> Result<(), RealtimeError> {
        self.topics().insert(topic.to_string());
        self.send_frame(ClientFrame::Subscribe { topic: topic.to_string() })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), RealtimeError> {
        self.topics().remove(topic);
        self.send_frame(ClientFrame::Unsubscribe { topic: topic.to_string() })
    }

    async fn send_typing(&self, topic: &str) -> Result<(), RealtimeError> {
        self.send_frame(ClientFrame::Typing { topic: topic.to_string() })
    }
}

struct Supervisor {
    url: String,
    token: String,
    topics: Arc<Mutex<BTreeSet<String>>>,
    events_tx: mpsc::Sender<RealtimeEnvelope>,
    health_tx: watch::Sender<ChannelHealth>,
}

enum SessionEnd {
    /// The socket dropped; reconnect.
    Dropped,
    /// Nobody listens any more; stop supervising.
    Shutdown,
}

impl Supervisor {
    async fn run(self, mut outgoing: mpsc::UnboundedReceiver<ClientFrame>) {
        let mut retry_delay = INITIAL_RETRY_DELAY;
        loop {
            self.health_tx.send_modify(|h| h.mode = ChannelMode::Connecting);
            match self.try_connect().await {
                Ok(ws) => {
                    retry_delay = INITIAL_RETRY_DELAY;
                    self.health_tx.send_replace(ChannelHealth::connected());
                    info!("[WS:CLIENT] Connected and authenticated to {}", self.url);

                    // Frames queued while disconnected are stale; the topic set
                    // is replayed instead.
                    while outgoing.try_recv().is_ok() {}

                    match self.session(ws, &mut outgoing).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Dropped => {
                            warn!("[WS:CLIENT] Connection lost");
                        }
                    }
                }
                Err(e) => {
                    warn!("[WS:CLIENT] Connection attempt failed: {}", e);
                }
            }

            self.health_tx.send_modify(|h| {
                h.mode = ChannelMode::Disconnected;
                h.failure_count += 1;
            });
            if self.events_tx.is_closed() {
                break;
            }
            info!("[WS:CLIENT] Retrying in {:?}", retry_delay);
            tokio::time::sleep(retry_delay).await;
            retry_delay = std::cmp::min(retry_delay * 2, MAX_RETRY_DELAY);
        }
        info!("[WS:CLIENT] Supervisor stopped");
    }

    async fn try_connect(&self) -> Result<WsStream, RealtimeError> {
        debug!("[WS:CLIENT] Connecting to {}", self.url);
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;

        let auth = serde_json::to_string(&ClientFrame::Auth { token: self.token.clone() })
            .map_err(|e| RealtimeError::AuthenticationFailed(format!("failed to encode auth frame: {}", e)))?;
        ws.send(Message::Text(auth))
            .await
            .map_err(|e| RealtimeError::AuthenticationFailed(format!("failed to send auth frame: {}", e)))?;

        let response = match tokio::time::timeout(AUTH_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<AuthResponse>(&text)
                .map_err(|e| RealtimeError::AuthenticationFailed(format!("invalid auth response: {}", e)))?,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                return Err(RealtimeError::AuthenticationFailed("connection closed during auth".to_string()))
            }
            Ok(Some(Ok(_))) => {
                return Err(RealtimeError::AuthenticationFailed("unexpected frame during auth".to_string()))
            }
            Ok(Some(Err(e))) => return Err(RealtimeError::AuthenticationFailed(e.to_string())),
            Err(_) => return Err(RealtimeError::Timeout),
        };

        if response.success {
            debug!("[WS:CLIENT] Authenticated as user {:?}", response.user_id);
            Ok(ws)
        } else {
            let reason = response.error.unwrap_or_else(|| "unknown authentication error".to_string());
            error!("[WS:CLIENT] Authentication rejected: {}", reason);
            Err(RealtimeError::AuthenticationFailed(reason))
        }
    }

    async fn session(&self, ws: WsStream, outgoing: &mut mpsc::UnboundedReceiver<ClientFrame>) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        let topics: Vec<String> = self
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect();
        for topic in topics {
            if let Err(e) = send_json(&mut sink, &ClientFrame::Subscribe { topic }).await {
                warn!("[WS:CLIENT] Resubscribe failed: {}", e);
                return SessionEnd::Dropped;
            }
        }

        loop {
            tokio::select! {
                frame = outgoing.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = send_json(&mut sink, &frame).await {
                            warn!("[WS:CLIENT] Failed to send frame: {}", e);
                            return SessionEnd::Dropped;
                        }
                    }
                    None => return SessionEnd::Shutdown,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RealtimeEnvelope>(&text) {
                            Ok(envelope) => {
                                if self.events_tx.send(envelope).await.is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                            Err(e) => debug!("[WS:CLIENT] Ignoring frame ({}): {}", e, text),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("[WS:CLIENT] WebSocket error: {}", e);
                        return SessionEnd::Dropped;
                    }
                },
            }
        }
    }
}

async fn send_json<S>(sink: &mut S, frame: &ClientFrame) -> Result<(), RealtimeError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(frame).map_err(|e| RealtimeError::InvalidMessage(e.to_string()))?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| RealtimeError::SendFailed(e.to_string()))
}
