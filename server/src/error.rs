//! Error types for Huddle Server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "Internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Why the relay refused a client event. Sent back as a negative ack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Authenticate first")]
    NotAuthenticated,

    #[error("At least one call target is required")]
    NoTargets,

    #[error("Cannot call yourself")]
    SelfTarget,

    #[error("Unknown user {0}")]
    UnknownUser(String),

    #[error("Unknown room {0}")]
    UnknownRoom(String),

    #[error("Not a joined member of this call")]
    NotAMember,

    #[error("{0} is not a joined member of this call")]
    TargetNotInCall(String),

    #[error("No pending invitation for this call")]
    NotInvited,

    #[error("Only the initiator may cancel")]
    NotInitiator,

    #[error("{0} is already part of this call")]
    AlreadyParticipant(String),

    #[error("{0} already left or declined this call")]
    ParticipantClosed(String),

    #[error("Call is full ({0} participants)")]
    RoomFull(usize),

    #[error("Event is not a request")]
    NotARequest,

    #[error("Storage failure")]
    Storage,
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::NotAuthenticated => "NOT_AUTHENTICATED",
            RelayError::NoTargets => "NO_TARGETS",
            RelayError::SelfTarget => "SELF_TARGET",
            RelayError::UnknownUser(_) => "UNKNOWN_USER",
            RelayError::UnknownRoom(_) => "UNKNOWN_ROOM",
            RelayError::NotAMember => "NOT_A_MEMBER",
            RelayError::TargetNotInCall(_) => "TARGET_NOT_IN_CALL",
            RelayError::NotInvited => "NOT_INVITED",
            RelayError::NotInitiator => "NOT_INITIATOR",
            RelayError::AlreadyParticipant(_) => "ALREADY_PARTICIPANT",
            RelayError::ParticipantClosed(_) => "PARTICIPANT_CLOSED",
            RelayError::RoomFull(_) => "ROOM_FULL",
            RelayError::NotARequest => "NOT_A_REQUEST",
            RelayError::Storage => "STORAGE_ERROR",
        }
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
