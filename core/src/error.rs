//! Error types for Huddle Core

use thiserror::Error;

use crate::models::CallState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    #[error("No {0} device found")]
    DeviceNotFound(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Call has no video track")]
    NoVideoTrack,

    #[error("Call has no audio track")]
    NoAudioTrack,

    #[error("Relay rejected request: {0}")]
    Relay(String),

    #[error("Relay did not acknowledge in time")]
    Timeout,

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid call state: expected {expected}, was {actual:?}")]
    InvalidState {
        expected: &'static str,
        actual: CallState,
    },

    #[error("At least one call target is required")]
    NoTargets,

    #[error("Cannot call yourself")]
    SelfTarget,

    #[error("No active call")]
    NoActiveCall,

    #[error("{0} is already part of this call")]
    AlreadyInCall(String),

    #[error("Call session has shut down")]
    SessionClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Device acquisition failures are scoped to the media action that hit them.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied(_) | Error::DeviceNotFound(_) | Error::DeviceBusy(_)
        )
    }

    /// Negative or missing acknowledgements from the relay.
    pub fn is_relay_error(&self) -> bool {
        matches!(self, Error::Relay(_) | Error::Timeout | Error::NotConnected)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(e.to_string())
    }
}
