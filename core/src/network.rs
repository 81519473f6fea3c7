//! Network layer for Huddle - HTTP API and signaling relay client

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::error::{Error, Result};
use crate::models::*;
use crate::signaling::{Ack, ClientEvent, ClientFrame, ServerEvent, ServerFrame, SignalingRelay};
use crate::ClientConfig;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// HTTP API Client
// ============================================================================

pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.use_tls) // For development
            .timeout(config.calls.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.http_url(),
            token: Mutex::new(None),
        })
    }

    pub fn set_token(&self, token: &str) {
        *self.token.lock() = Some(token.to_string());
    }

    fn auth_header(&self) -> Option<String> {
        self.token
            .lock()
            .as_ref()
            .map(|t| format!("Bearer {}", t))
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User> {
        let mut req = self
            .client
            .get(format!("{}/api/v1/users/{}", self.base_url, user_id));

        if let Some(auth) = self.auth_header() {
            req = req.header("Authorization", auth);
        }

        let resp = req.send().await?;

        if resp.status().as_u16() == 404 {
            return Err(Error::Http(format!("user {} not found", user_id)));
        }
        if !resp.status().is_success() {
            return Err(Error::Http(format!("user lookup failed: {}", resp.status())));
        }

        let user: User = resp.json().await?;
        Ok(user)
    }

    pub async fn get_turn_credentials(&self) -> Result<TurnCredentials> {
        let mut req = self
            .client
            .get(format!("{}/api/v1/turn/credentials", self.base_url));

        if let Some(auth) = self.auth_header() {
            req = req.header("Authorization", auth);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!("TURN credentials unavailable: {}", resp.status())));
        }

        let creds: TurnCredentials = resp.json().await?;
        Ok(creds)
    }

    pub async fn check_health(&self) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await;

        match resp {
            Ok(r) => Ok(r.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

// ============================================================================
// Signaling relay client
// ============================================================================

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Ack>>>>;

/// WebSocket connection to the relay. Requests are correlated with their
/// acknowledgements by `request_id`; relay events are forwarded to the
/// receiver returned by [`WebSocketRelay::connect`].
pub struct WebSocketRelay {
    sender: mpsc::UnboundedSender<String>,
    pending: PendingAcks,
    next_request_id: AtomicU64,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
    user_id: String,
}

impl WebSocketRelay {
    /// Connect and authenticate. Returns the relay and the stream of relay
    /// events; the stream closes when the connection drops.
    pub async fn connect(config: &ClientConfig, token: &str) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>)> {
        let url = url::Url::parse(&config.ws_url())?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let auth = ClientFrame {
            request_id: None,
            event: ClientEvent::Authenticate {
                token: token.to_string(),
            },
        };
        write.send(WsMessage::Text(serde_json::to_string(&auth)?)).await?;

        let user_id = match timeout(config.calls.request_timeout, wait_authenticated(&mut read)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout),
        };
        info!("Authenticated with relay as {}", user_id);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // Receive task
        let pending_clone = pending.clone();
        let connected_clone = connected.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => dispatch_frame(frame, &pending_clone, &events_tx),
                        Err(e) => warn!("Dropping malformed relay frame: {}", e),
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            connected_clone.store(false, Ordering::SeqCst);
            // Dropping the senders fails every outstanding request.
            pending_clone.lock().clear();
            info!("Relay connection closed");
        });

        // Send task
        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        if write.send(WsMessage::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                    _ = keepalive.tick() => {
                        let ping = ClientFrame { request_id: None, event: ClientEvent::Ping };
                        let Ok(text) = serde_json::to_string(&ping) else { continue };
                        if write.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        let relay = Self {
            sender: tx,
            pending,
            next_request_id: AtomicU64::new(1),
            connected,
            request_timeout: config.calls.request_timeout,
            user_id,
        };

        Ok((relay, events_rx))
    }

    /// The user id the relay authenticated us as.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let text = serde_json::to_string(frame)?;
        self.sender.send(text).map_err(|_| Error::NotConnected)
    }
}

async fn wait_authenticated<S>(read: &mut S) -> Result<String>
where
    S: Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = read.next().await {
        let text = match msg? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::Authenticated { user_id }) => return Ok(user_id),
            Ok(ServerFrame::Error { code, message }) => {
                return Err(Error::Relay(format!("{}: {}", code, message)));
            }
            Ok(_) => debug!("Ignoring frame before authentication"),
            Err(e) => warn!("Dropping malformed relay frame: {}", e),
        }
    }
    Err(Error::NotConnected)
}

fn dispatch_frame(frame: ServerFrame, pending: &PendingAcks, events: &mpsc::UnboundedSender<ServerEvent>) {
    match frame {
        ServerFrame::Ack { request_id, ack } => match pending.lock().remove(&request_id) {
            Some(waiter) => {
                let _ = waiter.send(ack);
            }
            None => debug!("Late acknowledgement for request {}", request_id),
        },
        ServerFrame::Event { event } => {
            if events.send(event).is_err() {
                debug!("Relay event dropped: no session listening");
            }
        }
        ServerFrame::Error { code, message } => warn!("Relay error {}: {}", code, message),
        ServerFrame::Authenticated { .. } | ServerFrame::Pong => {}
    }
}

#[async_trait]
impl SignalingRelay for WebSocketRelay {
    async fn request(&self, event: ClientEvent) -> Result<Value> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let name = event.name();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        let frame = ClientFrame {
            request_id: Some(request_id),
            event,
        };
        if let Err(e) = self.send_frame(&frame) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(ack)) => ack.into_result(),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                warn!("{} request {} was not acknowledged in time", name, request_id);
                Err(Error::Timeout)
            }
        }
    }

    fn emit(&self, event: ClientEvent) -> Result<()> {
        self.send_frame(&ClientFrame {
            request_id: None,
            event,
        })
    }
}
