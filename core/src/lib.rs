//! Huddle Core Library
//!
//! Multi-party audio/video calls over a full mesh of WebRTC peer connections.
//! Provides: the call session state machine, signaling, media and
//! transport seams, the relay client and a local call log.

pub mod driver;
pub mod error;
pub mod media;
pub mod models;
pub mod network;
pub mod peers;
pub mod presence;
pub mod queue;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod storage;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::task::JoinHandle;

pub use driver::{CallCommand, CallHandle};
pub use error::*;
pub use media::*;
pub use models::*;
pub use network::*;
pub use session::{CallSession, SessionEvent};
pub use signaling::*;
pub use storage::*;
pub use transport::*;

/// Connected client: relay, HTTP API and a running call session.
pub struct HuddleClient {
    config: ClientConfig,
    api: Arc<ApiClient>,
    relay: Arc<WebSocketRelay>,
    history: Option<Arc<CallHistory>>,
    calls: CallHandle,
    task: JoinHandle<()>,
}

impl HuddleClient {
    /// Authenticate with the relay and start the call session.
    ///
    /// TURN credentials are fetched best effort; without them peers fall back
    /// to the configured STUN servers.
    pub async fn connect(
        config: ClientConfig,
        token: &str,
        media_source: Arc<dyn LocalMediaSource>,
        sink: Arc<dyn RemoteStreamSink>,
    ) -> Result<Self> {
        let api = Arc::new(ApiClient::new(&config)?);
        api.set_token(token);

        let turn = match api.get_turn_credentials().await {
            Ok(creds) => Some(creds),
            Err(e) => {
                warn!("Continuing without TURN: {}", e);
                None
            }
        };
        let factory = Arc::new(rtc::RtcTransportFactory::new(&config.calls.stun_urls, turn.as_ref()));

        let (relay, events) = WebSocketRelay::connect(&config, token).await?;
        let relay = Arc::new(relay);

        let history = match &config.data_dir {
            Some(dir) => Some(Arc::new(CallHistory::open(dir)?)),
            None => None,
        };

        let mut session = CallSession::new(
            relay.user_id(),
            config.calls.clone(),
            relay.clone(),
            factory,
            media_source,
            sink,
        );
        if let Some(history) = &history {
            session = session.with_history(history.clone());
        }

        let (calls, task) = driver::spawn(session, events);

        Ok(Self {
            config,
            api,
            relay,
            history,
            calls,
            task,
        })
    }

    pub fn user_id(&self) -> &str {
        self.relay.user_id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn calls(&self) -> &CallHandle {
        &self.calls
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn is_connected(&self) -> bool {
        self.relay.is_connected()
    }

    /// Resolve a user, preferring the server and falling back to the cache.
    pub async fn lookup_user(&self, user_id: &str) -> Result<User> {
        match self.api.get_user(user_id).await {
            Ok(user) => {
                if let Some(history) = &self.history {
                    if let Err(e) = history.save_user(&user) {
                        warn!("Failed to cache user {}: {}", user_id, e);
                    }
                }
                Ok(user)
            }
            Err(e) => match &self.history {
                Some(history) => history.get_user(user_id)?.ok_or(e),
                None => Err(e),
            },
        }
    }

    pub fn call_log(&self, limit: i64) -> Result<Vec<CallLogEntry>> {
        match &self.history {
            Some(history) => history.recent(limit),
            None => Ok(Vec::new()),
        }
    }

    /// Hang up any call and stop the session task.
    pub async fn shutdown(self) -> Result<()> {
        let result = self.calls.shutdown().await;
        let _ = self.task.await;
        result
    }
}

/// Call timing knobs.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// How long a relay request may wait for its acknowledgement.
    pub request_timeout: Duration,
    /// How long an active call survives with every peer connection gone.
    pub rejoin_grace: Duration,
    pub stun_urls: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            rejoin_grace: Duration::from_secs(15),
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub use_tls: bool,
    /// Where the call log lives. No log is kept when unset.
    pub data_dir: Option<String>,
    pub calls: CallConfig,
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server_host: host.to_string(),
            server_port: port,
            use_tls,
            data_dir: None,
            calls: CallConfig::default(),
        }
    }

    pub fn with_data_dir(mut self, data_dir: &str) -> Self {
        self.data_dir = Some(data_dir.to_string());
        self
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server_host, self.server_port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.server_host, self.server_port)
    }
}

// C FFI exports for cross-language usage
#[no_mangle]
pub extern "C" fn huddle_version() -> *const std::ffi::c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const std::ffi::c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let config = ClientConfig::new("calls.example.org", 8443, true);
        assert_eq!(config.http_url(), "https://calls.example.org:8443");
        assert_eq!(config.ws_url(), "wss://calls.example.org:8443/ws");

        let local = ClientConfig::new("localhost", 8080, false);
        assert_eq!(local.ws_url(), "ws://localhost:8080/ws");
        assert!(local.data_dir.is_none());
    }
}
