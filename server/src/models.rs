//! Data models for Huddle Server

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// User Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_file_id: Option<String>,
    pub created_at: String,
    pub last_seen_at: Option<String>,
    pub is_active: bool,
}

/// Directory entry as served to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_file_id: Option<String>,
    pub online: bool,
    pub last_seen_at: Option<String>,
}

impl UserProfile {
    pub fn new(user: User, online: bool) -> Self {
        Self {
            user_id: user.user_id,
            display_name: user.display_name,
            avatar_file_id: user.avatar_file_id,
            online,
            last_seen_at: user.last_seen_at,
        }
    }
}

/// Who is calling / who joined, as shown to the other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl Identity {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: None,
            avatar: None,
        }
    }
}

impl From<User> for Identity {
    fn from(user: User) -> Self {
        Self {
            user_id: user.user_id,
            display_name: user.display_name,
            avatar: user.avatar_file_id,
        }
    }
}

// ============================================================================
// Session Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub token_hash: String,
    pub user_id: String,
    pub device_id: String,
    pub created_at: String,
    pub expires_at: String,
    pub is_valid: bool,
}

// ============================================================================
// Call Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }
}

impl From<String> for CallType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "video" => CallType::Video,
            _ => CallType::Audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Invited,
    Ringing,
    Joined,
    Left,
    Rejected,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Invited => "invited",
            ParticipantStatus::Ringing => "ringing",
            ParticipantStatus::Joined => "joined",
            ParticipantStatus::Left => "left",
            ParticipantStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ParticipantStatus::Left | ParticipantStatus::Rejected)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ParticipantStatus::Invited | ParticipantStatus::Ringing)
    }
}

impl From<String> for ParticipantStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "invited" => ParticipantStatus::Invited,
            "ringing" => ParticipantStatus::Ringing,
            "joined" => ParticipantStatus::Joined,
            "rejected" => ParticipantStatus::Rejected,
            _ => ParticipantStatus::Left,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantEntry {
    pub user_id: String,
    pub status: ParticipantStatus,
    pub joined_at: Option<i64>,
    pub left_at: Option<i64>,
}

/// Durable call record. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub call_id: String,
    pub room_id: String,
    pub call_type: CallType,
    pub initiator_id: String,
    pub participants: Vec<ParticipantEntry>,
    pub created_at: i64,
    pub connected_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl Call {
    pub fn participant(&self, user_id: &str) -> Option<&ParticipantEntry> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut ParticipantEntry> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn status_of(&self, user_id: &str) -> Option<ParticipantStatus> {
        self.participant(user_id).map(|p| p.status)
    }

    pub fn ids_with(&self, filter: impl Fn(ParticipantStatus) -> bool) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| filter(p.status))
            .map(|p| p.user_id.clone())
            .collect()
    }

    pub fn joined_count(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.status == ParticipantStatus::Joined)
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.participants.iter().filter(|p| p.status.is_pending()).count()
    }

    /// Fewer than two joined and nobody still ringing, or nobody joined.
    pub fn should_end(&self) -> bool {
        let joined = self.joined_count();
        joined == 0 || (joined < 2 && self.pending_count() == 0)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CallRow {
    pub call_id: String,
    pub room_id: String,
    pub call_type: String,
    pub initiator_id: String,
    pub created_at: i64,
    pub connected_at: Option<i64>,
    pub ended_at: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ParticipantRow {
    pub user_id: String,
    pub status: String,
    pub joined_at: Option<i64>,
    pub left_at: Option<i64>,
}

impl CallRow {
    pub fn into_call(self, participants: Vec<ParticipantRow>) -> Call {
        Call {
            call_id: self.call_id,
            room_id: self.room_id,
            call_type: self.call_type.into(),
            initiator_id: self.initiator_id,
            participants: participants
                .into_iter()
                .map(|p| ParticipantEntry {
                    user_id: p.user_id,
                    status: p.status.into(),
                    joined_at: p.joined_at,
                    left_at: p.left_at,
                })
                .collect(),
            created_at: self.created_at,
            connected_at: self.connected_at,
            ended_at: self.ended_at,
        }
    }
}

// ============================================================================
// Signaling payloads (forwarded as-is)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
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

// ============================================================================
// WebSocket Models
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "authenticate")]
    Authenticate { token: String },

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "initiate")]
    Initiate { target_ids: Vec<String>, call_type: CallType },

    #[serde(rename = "accept")]
    Accept { room_id: String },

    #[serde(rename = "reject")]
    Reject { room_id: String, reason: Option<String> },

    #[serde(rename = "cancel")]
    Cancel { room_id: String },

    #[serde(rename = "leave")]
    Leave { room_id: String },

    #[serde(rename = "add-participant")]
    AddParticipant { room_id: String, user_id: String },

    #[serde(rename = "upgrade-type")]
    UpgradeType { room_id: String, call_type: CallType },

    #[serde(rename = "offer")]
    Offer { room_id: String, target_id: String, description: SessionDescription },

    #[serde(rename = "answer")]
    Answer { room_id: String, target_id: String, description: SessionDescription },

    #[serde(rename = "ice-candidate")]
    IceCandidate { room_id: String, target_id: String, candidate: IceCandidate },

    #[serde(rename = "toggle-audio")]
    ToggleAudio { room_id: String, muted: bool },

    #[serde(rename = "toggle-video")]
    ToggleVideo { room_id: String, video_off: bool },

    #[serde(rename = "screen-share")]
    ScreenShare { room_id: String, sharing: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub request_id: Option<u64>,
    pub event: ClientEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "incoming")]
    Incoming { call: Call, caller: Identity },

    #[serde(rename = "cancelled")]
    Cancelled { room_id: String },

    #[serde(rename = "participant-joined")]
    ParticipantJoined { user_id: String, identity: Identity, room_id: Option<String> },

    #[serde(rename = "participant-left")]
    ParticipantLeft { user_id: String, call_ended: bool },

    #[serde(rename = "participant-rejected")]
    ParticipantRejected { user_id: Option<String>, reason: Option<String>, call_ended: bool },

    #[serde(rename = "offer")]
    Offer { from_id: String, room_id: String, description: SessionDescription },

    #[serde(rename = "answer")]
    Answer { from_id: String, description: SessionDescription },

    #[serde(rename = "ice-candidate")]
    IceCandidate { from_id: String, candidate: IceCandidate },

    #[serde(rename = "type-upgraded")]
    TypeUpgraded { user_id: String, call_type: CallType },

    #[serde(rename = "type-changed")]
    TypeChanged { call_type: CallType },

    #[serde(rename = "audio-toggled")]
    AudioToggled { user_id: String, muted: bool },

    #[serde(rename = "video-toggled")]
    VideoToggled { user_id: String, video_off: bool },

    #[serde(rename = "screen-share-toggled")]
    ScreenShareToggled { user_id: String, sharing: bool },
}

/// `{success, error, data}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub error: Option<String>,
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
    pub offline_targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptAck {
    pub call: Call,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddParticipantAck {
    pub offline: bool,
}

// ============================================================================
// API Response Models
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RecentCallsQuery {
    #[serde(default = "default_recent_limit")]
    pub limit: i64,
}

fn default_recent_limit() -> i64 {
    20
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub online_users: usize,
    pub active_calls: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TurnCredentialsResponse {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
    pub credential_type: String,
    pub ttl: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_names() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "request_id": 3,
            "event": {"type": "add-participant", "payload": {"room_id": "r1", "user_id": "carol"}}
        }))
        .unwrap();
        assert_eq!(frame.request_id, Some(3));
        assert_eq!(
            frame.event,
            ClientEvent::AddParticipant {
                room_id: "r1".into(),
                user_id: "carol".into()
            }
        );

        let ping: ClientFrame = serde_json::from_value(json!({"event": {"type": "ping"}})).unwrap();
        assert_eq!(ping.event, ClientEvent::Ping);
    }

    #[test]
    fn test_server_frame_shape() {
        let frame = ServerFrame::Event {
            event: ServerEvent::ScreenShareToggled {
                user_id: "bob".into(),
                sharing: true,
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "frame": "event",
                "event": {"type": "screen-share-toggled", "payload": {"user_id": "bob", "sharing": true}}
            })
        );

        let ack = ServerFrame::Ack {
            request_id: 9,
            ack: Ack::failed("NOT_A_MEMBER"),
        };
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["frame"], "ack");
        assert_eq!(value["ack"]["success"], false);
    }

    #[test]
    fn test_call_end_rule() {
        let entry = |user_id: &str, status| ParticipantEntry {
            user_id: user_id.to_string(),
            status,
            joined_at: None,
            left_at: None,
        };
        let mut call = Call {
            call_id: "c".into(),
            room_id: "r".into(),
            call_type: CallType::Audio,
            initiator_id: "alice".into(),
            participants: vec![
                entry("alice", ParticipantStatus::Joined),
                entry("bob", ParticipantStatus::Ringing),
            ],
            created_at: 0,
            connected_at: None,
            ended_at: None,
        };
        assert!(!call.should_end());

        call.participants[1].status = ParticipantStatus::Rejected;
        assert!(call.should_end());

        call.participants.push(entry("carol", ParticipantStatus::Joined));
        assert!(!call.should_end());
    }
}
