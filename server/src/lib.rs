//! Huddle Server - signaling relay for Huddle calls
//!
//! This server handles:
//! - Session token authentication
//! - Call rooms: invitations, membership and call records
//! - Relaying offers, answers and ICE candidates between call members
//! - Presence lookups and TURN credentials

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod models;
pub mod rooms;
pub mod storage;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::get,
    Router,
};
use parking_lot::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::rooms::{Outcome, RoomRegistry};
use crate::storage::Storage;
use crate::websocket::ConnectionManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub connections: Arc<ConnectionManager>,
    pub rooms: Arc<Mutex<RoomRegistry>>,
}

impl AppState {
    pub fn new(config: Config, storage: Storage) -> Self {
        let rooms = RoomRegistry::new(config.calls.max_participants);
        Self {
            config: Arc::new(config),
            storage: Arc::new(storage),
            connections: Arc::new(ConnectionManager::new()),
            rooms: Arc::new(Mutex::new(rooms)),
        }
    }

    /// Push the outcome's events, then persist the call records it touched.
    pub async fn publish<T>(&self, outcome: Outcome<T>) -> T {
        let Outcome {
            value,
            deliveries,
            records,
        } = outcome;

        self.connections.deliver(deliveries);
        for call in &records {
            if let Err(e) = self.storage.save_call(call).await {
                tracing::error!("Failed to save call {}: {}", call.call_id, e);
            }
        }
        value
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))

        // Directory
        .route("/api/v1/users/:user_id", get(handlers::users::get_user))

        // Call records
        .route("/api/v1/calls/recent", get(handlers::calls::recent_calls))

        // WebSocket signaling
        .route("/ws", get(handlers::websocket::websocket_handler))

        // TURN credentials
        .route("/api/v1/turn/credentials", get(handlers::turn::get_credentials))

        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Periodically decline invitations nobody answered.
pub fn spawn_invite_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let timeout_ms = state.config.calls.invite_timeout().as_millis() as i64;
        let mut interval = tokio::time::interval(state.config.calls.sweep_interval());
        loop {
            interval.tick().await;
            let outcome = state.rooms.lock().expire_invites(now_millis(), timeout_ms);
            if !outcome.deliveries.is_empty() {
                tracing::info!("Expired unanswered invitations ({} events)", outcome.deliveries.len());
            }
            state.publish(outcome).await;
        }
    })
}

/// Periodically purge dead sessions and old call records.
pub fn spawn_cleanup(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let minutes = state.config.storage.cleanup_interval_minutes.max(1);
        let mut interval = tokio::time::interval(Duration::from_secs(minutes * 60));
        loop {
            interval.tick().await;
            match state
                .storage
                .cleanup_expired(state.config.storage.call_retention_days)
                .await
            {
                Ok((sessions, calls)) => {
                    if sessions > 0 || calls > 0 {
                        tracing::info!("Cleanup: removed {} sessions, {} calls", sessions, calls);
                    }
                }
                Err(e) => {
                    tracing::error!("Cleanup failed: {}", e);
                }
            }
        }
    })
}
