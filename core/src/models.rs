//! Data models for Huddle calls

use serde::{Deserialize, Serialize};

// ============================================================================
// User directory
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_file_id: Option<String>,
    #[serde(default)]
    pub online: bool,
    pub last_seen_at: Option<String>,
}

/// Caller / participant identity as delivered by the relay.
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
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    #[default]
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

    pub fn has_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

/// Local call session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Idle,
    /// Outgoing, waiting for someone to accept.
    Calling,
    /// Incoming, waiting for the local decision.
    Ringing,
    Active,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle)
    }

    pub fn in_call(&self) -> bool {
        !self.is_idle()
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
    pub fn is_terminal(&self) -> bool {
        matches!(self, ParticipantStatus::Left | ParticipantStatus::Rejected)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ParticipantStatus::Invited | ParticipantStatus::Ringing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantEntry {
    pub user_id: String,
    pub status: ParticipantStatus,
    #[serde(default)]
    pub joined_at: Option<i64>,
    #[serde(default)]
    pub left_at: Option<i64>,
}

impl ParticipantEntry {
    pub fn invited(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: ParticipantStatus::Invited,
            joined_at: None,
            left_at: None,
        }
    }
}

/// Client-side cached copy of the relay's call record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub call_id: String,
    pub room_id: String,
    pub call_type: CallType,
    pub initiator_id: String,
    pub participants: Vec<ParticipantEntry>,
    pub created_at: i64,
    #[serde(default)]
    pub connected_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
}

impl Call {
    pub fn participant(&self, user_id: &str) -> Option<&ParticipantEntry> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    /// Apply a status change. Terminal statuses are never overwritten.
    pub fn set_status(&mut self, user_id: &str, status: ParticipantStatus, at: i64) {
        match self.participants.iter_mut().find(|p| p.user_id == user_id) {
            Some(entry) if entry.status.is_terminal() => {}
            Some(entry) => {
                entry.status = status;
                match status {
                    ParticipantStatus::Joined => entry.joined_at = Some(at),
                    ParticipantStatus::Left | ParticipantStatus::Rejected => entry.left_at = Some(at),
                    _ => {}
                }
            }
            None => {
                let mut entry = ParticipantEntry::invited(user_id);
                entry.status = status;
                if status == ParticipantStatus::Joined {
                    entry.joined_at = Some(at);
                }
                self.participants.push(entry);
            }
        }
    }

    pub fn joined_ids(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| p.status == ParticipantStatus::Joined)
            .map(|p| p.user_id.clone())
            .collect()
    }

    /// Exactly one initiator, at least one other target, no duplicate user ids.
    pub fn is_well_formed(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        if !self.participants.iter().all(|p| seen.insert(p.user_id.as_str())) {
            return false;
        }
        seen.contains(self.initiator_id.as_str()) && seen.len() >= 2
    }
}

/// Presence projection entry for one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantPresenceInfo {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub is_screen_sharing: bool,
}

impl ParticipantPresenceInfo {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            avatar: identity.avatar.clone(),
            is_muted: false,
            is_video_off: false,
            is_screen_sharing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    Cancelled,
    Rejected,
    RemoteEnded,
    PeersFailed,
    SetupFailed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::LocalHangup => "local_hangup",
            EndReason::Cancelled => "cancelled",
            EndReason::Rejected => "rejected",
            EndReason::RemoteEnded => "remote_ended",
            EndReason::PeersFailed => "peers_failed",
            EndReason::SetupFailed => "setup_failed",
        }
    }
}

/// What the presentation layer renders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub call_type: CallType,
    pub call_id: Option<String>,
    pub room_id: Option<String>,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub is_screen_sharing: bool,
    pub participants: Vec<ParticipantPresenceInfo>,
    pub offline_targets: Vec<String>,
    pub connected_peers: usize,
}

/// One row of the local call log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLogEntry {
    pub call_id: String,
    pub room_id: String,
    pub call_type: CallType,
    pub initiator_id: String,
    pub participants: Vec<String>,
    pub created_at: i64,
    pub connected_at: Option<i64>,
    pub ended_at: i64,
    pub end_reason: EndReason,
}

// ============================================================================
// TURN
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}
