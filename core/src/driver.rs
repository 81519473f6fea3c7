//! Actor wrapper around [`CallSession`].
//!
//! The session is moved into one task that selects over user commands, relay
//! events and its own event queue. Callers talk to it through a cloneable
//! [`CallHandle`] and observe it through a `watch` channel of snapshots.

use log::{debug, info};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::models::{Call, CallSnapshot, CallType};
use crate::session::CallSession;
use crate::signaling::ServerEvent;

#[derive(Debug)]
pub enum CallCommand {
    Initiate {
        target_ids: Vec<String>,
        call_type: CallType,
        reply: oneshot::Sender<Result<Call>>,
    },
    Accept {
        reply: oneshot::Sender<Result<()>>,
    },
    Reject {
        reason: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    HangUp {
        reply: oneshot::Sender<Result<()>>,
    },
    AddParticipant {
        user_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    ToggleMute {
        reply: oneshot::Sender<Result<bool>>,
    },
    ToggleCamera {
        reply: oneshot::Sender<Result<bool>>,
    },
    UpgradeToVideo {
        reply: oneshot::Sender<Result<()>>,
    },
    StartScreenShare {
        reply: oneshot::Sender<Result<()>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable front end of a running session task.
#[derive(Debug, Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<CallCommand>,
    snapshots: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> CallCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    pub async fn initiate(&self, target_ids: Vec<String>, call_type: CallType) -> Result<Call> {
        self.call(|reply| CallCommand::Initiate {
            target_ids,
            call_type,
            reply,
        })
        .await
    }

    pub async fn accept(&self) -> Result<()> {
        self.call(|reply| CallCommand::Accept { reply }).await
    }

    pub async fn reject(&self, reason: Option<String>) -> Result<()> {
        self.call(|reply| CallCommand::Reject { reason, reply }).await
    }

    pub async fn hang_up(&self) -> Result<()> {
        self.call(|reply| CallCommand::HangUp { reply }).await
    }

    pub async fn add_participant(&self, user_id: &str) -> Result<bool> {
        let user_id = user_id.to_string();
        self.call(|reply| CallCommand::AddParticipant { user_id, reply }).await
    }

    pub async fn toggle_mute(&self) -> Result<bool> {
        self.call(|reply| CallCommand::ToggleMute { reply }).await
    }

    pub async fn toggle_camera(&self) -> Result<bool> {
        self.call(|reply| CallCommand::ToggleCamera { reply }).await
    }

    pub async fn upgrade_to_video(&self) -> Result<()> {
        self.call(|reply| CallCommand::UpgradeToVideo { reply }).await
    }

    pub async fn start_screen_share(&self) -> Result<()> {
        self.call(|reply| CallCommand::StartScreenShare { reply }).await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        self.call(|reply| CallCommand::StopScreenShare { reply }).await
    }

    /// Hang up, release everything and stop the task.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| CallCommand::Shutdown { reply }).await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.clone()
    }
}

/// Move the session into its own task.
///
/// The task ends on [`CallHandle::shutdown`], when every handle is dropped,
/// or when the relay event stream closes. In each case the call is torn down
/// first.
pub fn spawn(mut session: CallSession, mut server_events: mpsc::UnboundedReceiver<ServerEvent>) -> (CallHandle, JoinHandle<()>) {
    let (commands, mut command_rx) = mpsc::channel(32);
    let handle = CallHandle {
        commands,
        snapshots: session.subscribe(),
    };

    let task = tokio::spawn(async move {
        let Some(mut session_events) = session.take_event_receiver() else {
            debug!("Session queue already taken; driver not started");
            return;
        };

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(CallCommand::Shutdown { reply }) => {
                            let _ = reply.send(session.close().await);
                            break;
                        }
                        Some(command) => apply_command(&mut session, command).await,
                        None => {
                            debug!("All call handles dropped");
                            let _ = session.close().await;
                            break;
                        }
                    }
                }
                event = server_events.recv() => {
                    match event {
                        Some(event) => session.handle_server_event(event).await,
                        None => {
                            info!("Relay event stream closed");
                            let _ = session.close().await;
                            break;
                        }
                    }
                }
                Some(event) = session_events.recv() => {
                    session.handle_session_event(event).await;
                }
            }
        }
    });

    (handle, task)
}

async fn apply_command(session: &mut CallSession, command: CallCommand) {
    // A dropped reply receiver only means the caller stopped waiting.
    match command {
        CallCommand::Initiate {
            target_ids,
            call_type,
            reply,
        } => {
            let _ = reply.send(session.initiate_call(target_ids, call_type).await);
        }
        CallCommand::Accept { reply } => {
            let _ = reply.send(session.accept_call().await);
        }
        CallCommand::Reject { reason, reply } => {
            let _ = reply.send(session.reject_call(reason).await);
        }
        CallCommand::HangUp { reply } => {
            let _ = reply.send(session.hang_up().await);
        }
        CallCommand::AddParticipant { user_id, reply } => {
            let _ = reply.send(session.add_participant(&user_id).await);
        }
        CallCommand::ToggleMute { reply } => {
            let _ = reply.send(session.toggle_mute());
        }
        CallCommand::ToggleCamera { reply } => {
            let _ = reply.send(session.toggle_camera());
        }
        CallCommand::UpgradeToVideo { reply } => {
            let _ = reply.send(session.upgrade_to_video().await);
        }
        CallCommand::StartScreenShare { reply } => {
            let _ = reply.send(session.start_screen_share().await);
        }
        CallCommand::StopScreenShare { reply } => {
            let _ = reply.send(session.stop_screen_share().await);
        }
        CallCommand::Shutdown { reply } => {
            let _ = reply.send(session.close().await);
        }
    }
}
