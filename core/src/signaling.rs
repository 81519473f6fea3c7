//! Signaling protocol spoken with the relay.
//!
//! Every event is an explicit tagged union variant; payloads are validated by
//! serde at the boundary. Requests that expect a result carry a `request_id`
//! and are answered by exactly one [`Ack`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{Call, CallType, Identity};

// ============================================================================
// Negotiation payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// Client -> relay
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    Authenticate { token: String },
    Ping,
    Initiate { target_ids: Vec<String>, call_type: CallType },
    Accept { room_id: String },
    Reject { room_id: String, reason: Option<String> },
    Cancel { room_id: String },
    Leave { room_id: String },
    AddParticipant { room_id: String, user_id: String },
    UpgradeType { room_id: String, call_type: CallType },
    Offer { room_id: String, target_id: String, description: SessionDescription },
    Answer { room_id: String, target_id: String, description: SessionDescription },
    IceCandidate { room_id: String, target_id: String, candidate: IceCandidate },
    ToggleAudio { room_id: String, muted: bool },
    ToggleVideo { room_id: String, video_off: bool },
    ScreenShare { room_id: String, sharing: bool },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Authenticate { .. } => "authenticate",
            ClientEvent::Ping => "ping",
            ClientEvent::Initiate { .. } => "initiate",
            ClientEvent::Accept { .. } => "accept",
            ClientEvent::Reject { .. } => "reject",
            ClientEvent::Cancel { .. } => "cancel",
            ClientEvent::Leave { .. } => "leave",
            ClientEvent::AddParticipant { .. } => "add-participant",
            ClientEvent::UpgradeType { .. } => "upgrade-type",
            ClientEvent::Offer { .. } => "offer",
            ClientEvent::Answer { .. } => "answer",
            ClientEvent::IceCandidate { .. } => "ice-candidate",
            ClientEvent::ToggleAudio { .. } => "toggle-audio",
            ClientEvent::ToggleVideo { .. } => "toggle-video",
            ClientEvent::ScreenShare { .. } => "screen-share",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub event: ClientEvent,
}

// ============================================================================
// Relay -> client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    Incoming {
        call: Call,
        caller: Identity,
    },
    Cancelled {
        room_id: String,
    },
    ParticipantJoined {
        user_id: String,
        identity: Identity,
        #[serde(default)]
        room_id: Option<String>,
    },
    ParticipantLeft {
        user_id: String,
        #[serde(default)]
        call_ended: bool,
    },
    ParticipantRejected {
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        call_ended: bool,
    },
    Offer {
        from_id: String,
        room_id: String,
        description: SessionDescription,
    },
    Answer {
        from_id: String,
        description: SessionDescription,
    },
    IceCandidate {
        from_id: String,
        candidate: IceCandidate,
    },
    TypeUpgraded {
        user_id: String,
        call_type: CallType,
    },
    TypeChanged {
        call_type: CallType,
    },
    AudioToggled {
        user_id: String,
        muted: bool,
    },
    VideoToggled {
        user_id: String,
        video_off: bool,
    },
    ScreenShareToggled {
        user_id: String,
        sharing: bool,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Incoming { .. } => "incoming",
            ServerEvent::Cancelled { .. } => "cancelled",
            ServerEvent::ParticipantJoined { .. } => "participant-joined",
            ServerEvent::ParticipantLeft { .. } => "participant-left",
            ServerEvent::ParticipantRejected { .. } => "participant-rejected",
            ServerEvent::Offer { .. } => "offer",
            ServerEvent::Answer { .. } => "answer",
            ServerEvent::IceCandidate { .. } => "ice-candidate",
            ServerEvent::TypeUpgraded { .. } => "type-upgraded",
            ServerEvent::TypeChanged { .. } => "type-changed",
            ServerEvent::AudioToggled { .. } => "audio-toggled",
            ServerEvent::VideoToggled { .. } => "video-toggled",
            ServerEvent::ScreenShareToggled { .. } => "screen-share-toggled",
        }
    }
}

/// Relay acknowledgement: `{success, error, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Ack {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            error: None,
            data,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: Value::Null,
        }
    }

    /// A negative acknowledgement is treated exactly like a thrown error.
    pub fn into_result(self) -> Result<Value> {
        if self.success {
            Ok(self.data)
        } else {
            Err(Error::Relay(
                self.error.unwrap_or_else(|| "request failed".to_string()),
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Ack { request_id: u64, ack: Ack },
    Event { event: ServerEvent },
    Authenticated { user_id: String },
    Error { code: String, message: String },
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateAck {
    pub call: Call,
    pub room_id: String,
    #[serde(default)]
    pub offline_targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptAck {
    pub call: Call,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddParticipantAck {
    #[serde(default)]
    pub offline: bool,
}

/// Decode an acknowledgement payload into its typed shape.
pub fn decode_ack<T: DeserializeOwned>(data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| Error::Relay(format!("malformed acknowledgement: {}", e)))
}

// ============================================================================
// Relay seam
// ============================================================================

/// The bidirectional event channel to the signaling relay.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Send an event and wait for its acknowledgement. A negative, missing or
    /// late acknowledgement is an error.
    async fn request(&self, event: ClientEvent) -> Result<Value>;

    /// Fire-and-forget delivery.
    fn emit(&self, event: ClientEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_shape() {
        let frame = ClientFrame {
            request_id: Some(7),
            event: ClientEvent::AddParticipant {
                room_id: "r1".into(),
                user_id: "carol".into(),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "request_id": 7,
                "event": {"type": "add-participant", "payload": {"room_id": "r1", "user_id": "carol"}}
            })
        );

        let emitted = ClientFrame {
            request_id: None,
            event: ClientEvent::ToggleAudio {
                room_id: "r1".into(),
                muted: true,
            },
        };
        let value = serde_json::to_value(&emitted).unwrap();
        assert!(value.get("request_id").is_none());
        assert_eq!(value["event"]["type"], "toggle-audio");
    }

    #[test]
    fn test_server_event_defaults() {
        let frame: ServerFrame = serde_json::from_value(json!({
            "frame": "event",
            "event": {"type": "participant-left", "payload": {"user_id": "bob"}}
        }))
        .unwrap();

        assert_eq!(
            frame,
            ServerFrame::Event {
                event: ServerEvent::ParticipantLeft {
                    user_id: "bob".into(),
                    call_ended: false
                }
            }
        );

        let rejected: ServerEvent =
            serde_json::from_value(json!({"type": "participant-rejected", "payload": {}})).unwrap();
        assert_eq!(
            rejected,
            ServerEvent::ParticipantRejected {
                user_id: None,
                reason: None,
                call_ended: false
            }
        );
    }

    #[test]
    fn test_session_description_wire_name() {
        let desc = SessionDescription::offer("v=0");
        assert_eq!(serde_json::to_value(&desc).unwrap(), json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn test_negative_ack_is_error() {
        let frame: ServerFrame = serde_json::from_value(json!({
            "frame": "ack",
            "request_id": 3,
            "ack": {"success": false, "error": "NOT_IN_ROOM"}
        }))
        .unwrap();

        match frame {
            ServerFrame::Ack { request_id, ack } => {
                assert_eq!(request_id, 3);
                match ack.into_result() {
                    Err(Error::Relay(msg)) => assert_eq!(msg, "NOT_IN_ROOM"),
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_ack_data() {
        let result: Result<InitiateAck> = decode_ack(json!({"room_id": "r1"}));
        assert!(matches!(result, Err(Error::Relay(_))));
    }
}
