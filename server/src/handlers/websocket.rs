//! WebSocket handler for call signaling

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    error::{RelayError, RelayResult},
    models::*,
    now_millis,
    rooms::Outcome,
    websocket::Connection,
    AppState,
};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending frames to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let connection_id = Uuid::new_v4().to_string();
    let mut identity: Option<Identity> = None;

    // Task to forward frames from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&frame) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    // Handle incoming frames
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    handle_frame(&state, &tx, &connection_id, &mut identity, frame).await;
                }
                Err(e) => {
                    tracing::warn!("Failed to parse WebSocket frame: {}", e);
                    let _ = tx.send(ServerFrame::Error {
                        code: "PARSE_ERROR".to_string(),
                        message: format!("Invalid frame format: {}", e),
                    });
                }
            },
            Ok(Message::Binary(_)) => {
                // Binary frames not supported
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Handled by the WebSocket library
            }
            Ok(Message::Close(_)) => {
                break;
            }
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
        }
    }

    // Cleanup
    if let Some((user_id, offline)) = state.connections.unregister(&connection_id) {
        let _ = state.storage.update_user_last_seen(&user_id).await;

        if offline {
            let outcome = state.rooms.lock().disconnect(&user_id, now_millis());
            if !outcome.records.is_empty() {
                tracing::info!("{} went offline, leaving {} call(s)", user_id, outcome.records.len());
            }
            state.publish(outcome).await;
        }
    }

    // Abort send task
    send_task.abort();
}

async fn handle_frame(
    state: &AppState,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    connection_id: &str,
    identity: &mut Option<Identity>,
    frame: ClientFrame,
) {
    let ClientFrame { request_id, event } = frame;

    match event {
        ClientEvent::Authenticate { token } => {
            if identity.is_some() {
                let _ = tx.send(ServerFrame::Error {
                    code: "ALREADY_AUTHENTICATED".to_string(),
                    message: "Connection is already authenticated".to_string(),
                });
                return;
            }
            *identity = authenticate(state, tx, connection_id, &token).await;
            if let Some(request_id) = request_id {
                let ack = match identity {
                    Some(_) => Ack::ok(json!({})),
                    None => Ack::failed("AUTH_FAILED: Invalid or expired token"),
                };
                let _ = tx.send(ServerFrame::Ack { request_id, ack });
            }
        }

        ClientEvent::Ping => {
            let _ = tx.send(ServerFrame::Pong);
        }

        event => {
            let name = event_name(&event);
            let result = match identity.as_ref() {
                Some(user) => dispatch(state, user, event).await,
                None => Err(RelayError::NotAuthenticated),
            };

            match result {
                Ok(outcome) => {
                    if let Some(request_id) = request_id {
                        let _ = tx.send(ServerFrame::Ack {
                            request_id,
                            ack: Ack::ok(outcome.value.clone()),
                        });
                    }
                    state.publish(outcome).await;
                }
                Err(e) => {
                    tracing::debug!("Refused {}: {}", name, e);
                    match request_id {
                        Some(request_id) => {
                            let _ = tx.send(ServerFrame::Ack {
                                request_id,
                                ack: Ack::failed(format!("{}: {}", e.code(), e)),
                            });
                        }
                        None if e == RelayError::NotAuthenticated => {
                            let _ = tx.send(ServerFrame::Error {
                                code: e.code().to_string(),
                                message: e.to_string(),
                            });
                        }
                        None => {}
                    }
                }
            }
        }
    }
}

async fn authenticate(
    state: &AppState,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    connection_id: &str,
    token: &str,
) -> Option<Identity> {
    let session = match state.storage.validate_session(token).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            let _ = tx.send(ServerFrame::Error {
                code: "AUTH_FAILED".to_string(),
                message: "Invalid or expired token".to_string(),
            });
            return None;
        }
        Err(e) => {
            tracing::error!("Session lookup failed: {}", e);
            let _ = tx.send(ServerFrame::Error {
                code: "AUTH_FAILED".to_string(),
                message: "Session lookup failed".to_string(),
            });
            return None;
        }
    };

    let identity = match state.storage.get_user(&session.user_id).await {
        Ok(Some(user)) => Identity::from(user),
        _ => Identity::new(&session.user_id),
    };

    // Register connection
    state.connections.register(
        &session.user_id,
        Connection {
            connection_id: connection_id.to_string(),
            device_id: session.device_id.clone(),
            sender: tx.clone(),
        },
    );

    // Send authenticated response
    let _ = tx.send(ServerFrame::Authenticated {
        user_id: session.user_id.clone(),
    });

    // Ring any call this user was invited to while away
    let pending = state.rooms.lock().pending_for(&session.user_id, now_millis());
    state.publish(pending).await;

    tracing::info!(
        "WebSocket authenticated: user={}, device={}",
        session.user_id,
        session.device_id
    );
    Some(identity)
}

/// Validate and apply one call event from an authenticated user.
async fn dispatch(state: &AppState, user: &Identity, event: ClientEvent) -> RelayResult<Outcome<Value>> {
    let now = now_millis();
    let me = user.user_id.as_str();

    match event {
        ClientEvent::Initiate {
            target_ids,
            call_type,
        } => {
            for target_id in &target_ids {
                if target_id != me {
                    require_user(state, target_id).await?;
                }
            }
            let connections = &state.connections;
            let outcome = state.rooms.lock().initiate(
                user.clone(),
                &target_ids,
                call_type,
                |id| connections.is_user_online(id),
                now,
            )?;
            tracing::info!(
                "{} started a {} call in room {}",
                me,
                call_type.as_str(),
                outcome.value.room_id
            );
            Ok(outcome.map(to_json))
        }

        ClientEvent::Accept { room_id } => {
            let outcome = state.rooms.lock().accept(user.clone(), &room_id, now)?;
            tracing::info!("{} joined room {}", me, room_id);
            Ok(outcome.map(to_json))
        }

        ClientEvent::Reject { room_id, reason } => {
            let outcome = state.rooms.lock().reject(me, &room_id, reason, now)?;
            Ok(outcome.map(empty))
        }

        ClientEvent::Cancel { room_id } => {
            let outcome = state.rooms.lock().cancel(me, &room_id, now)?;
            tracing::info!("{} cancelled room {}", me, room_id);
            Ok(outcome.map(empty))
        }

        ClientEvent::Leave { room_id } => {
            let outcome = state.rooms.lock().leave(me, &room_id, now)?;
            tracing::info!("{} left room {}", me, room_id);
            Ok(outcome.map(empty))
        }

        ClientEvent::AddParticipant { room_id, user_id } => {
            if user_id == me {
                return Err(RelayError::SelfTarget);
            }
            require_user(state, &user_id).await?;
            let online = state.connections.is_user_online(&user_id);
            let outcome = state
                .rooms
                .lock()
                .add_participant(me, &room_id, &user_id, online, now)?;
            Ok(outcome.map(to_json))
        }

        ClientEvent::UpgradeType { room_id, call_type } => {
            let outcome = state.rooms.lock().upgrade_type(me, &room_id, call_type)?;
            Ok(outcome.map(empty))
        }

        ClientEvent::Offer {
            room_id,
            target_id,
            description,
        } => {
            let event = ServerEvent::Offer {
                from_id: me.to_string(),
                room_id: room_id.clone(),
                description,
            };
            let outcome = state.rooms.lock().forward(me, &room_id, &target_id, event)?;
            Ok(outcome.map(empty))
        }

        ClientEvent::Answer {
            room_id,
            target_id,
            description,
        } => {
            let event = ServerEvent::Answer {
                from_id: me.to_string(),
                description,
            };
            let outcome = state.rooms.lock().forward(me, &room_id, &target_id, event)?;
            Ok(outcome.map(empty))
        }

        ClientEvent::IceCandidate {
            room_id,
            target_id,
            candidate,
        } => {
            let event = ServerEvent::IceCandidate {
                from_id: me.to_string(),
                candidate,
            };
            let outcome = state.rooms.lock().forward(me, &room_id, &target_id, event)?;
            Ok(outcome.map(empty))
        }

        ClientEvent::ToggleAudio { room_id, muted } => {
            let event = ServerEvent::AudioToggled {
                user_id: me.to_string(),
                muted,
            };
            let outcome = state.rooms.lock().broadcast(me, &room_id, event)?;
            Ok(outcome.map(empty))
        }

        ClientEvent::ToggleVideo { room_id, video_off } => {
            let event = ServerEvent::VideoToggled {
                user_id: me.to_string(),
                video_off,
            };
            let outcome = state.rooms.lock().broadcast(me, &room_id, event)?;
            Ok(outcome.map(empty))
        }

        ClientEvent::ScreenShare { room_id, sharing } => {
            let event = ServerEvent::ScreenShareToggled {
                user_id: me.to_string(),
                sharing,
            };
            let outcome = state.rooms.lock().broadcast(me, &room_id, event)?;
            Ok(outcome.map(empty))
        }

        ClientEvent::Authenticate { .. } | ClientEvent::Ping => Err(RelayError::NotARequest),
    }
}

async fn require_user(state: &AppState, user_id: &str) -> RelayResult<()> {
    match state.storage.get_user(user_id).await {
        Ok(Some(user)) if user.is_active => Ok(()),
        Ok(_) => Err(RelayError::UnknownUser(user_id.to_string())),
        Err(e) => {
            tracing::error!("User lookup failed: {}", e);
            Err(RelayError::Storage)
        }
    }
}

fn to_json<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

fn empty(_: ()) -> Value {
    json!({})
}

fn event_name(event: &ClientEvent) -> &'static str {
    match event {
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
