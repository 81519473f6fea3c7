//! Call session: the local state machine that owns media, peers and presence
//! for at most one call at a time.
//!
//! The session is single-consumer. Relay events, user actions and transport
//! callbacks are all applied through `&mut self`, so no two handlers ever
//! interleave. Transport callbacks and spawned offer work report back through
//! the session's own event queue (see [`SessionEvent`]).

mod controls;
mod negotiation;

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::media::{LocalMedia, LocalMediaSource, MediaTrack, RemoteStreamSink};
use crate::models::{
    Call, CallLogEntry, CallSnapshot, CallState, CallType, EndReason, Identity, ParticipantPresenceInfo,
    ParticipantStatus,
};
use crate::peers::PeerRegistry;
use crate::presence::PresenceProjection;
use crate::signaling::{
    decode_ack, AcceptAck, AddParticipantAck, ClientEvent, InitiateAck, ServerEvent, SessionDescription,
    SignalingRelay,
};
use crate::storage::CallHistory;
use crate::transport::{ConnectionState, TransportEvent, TransportFactory};
use crate::CallConfig;

/// Work posted back into the session from outside the consumer.
#[derive(Debug)]
pub enum SessionEvent {
    /// A transport callback, tagged with the entry that produced it.
    Transport {
        peer_id: String,
        generation: u64,
        event: TransportEvent,
    },
    /// A spawned `create_offer` + `set_local_description` finished.
    LocalOfferReady {
        peer_id: String,
        generation: u64,
        result: Result<SessionDescription>,
    },
    /// The platform ended the screen capture (e.g. the user clicked "stop").
    ScreenShareEnded { track_id: String },
    /// Every peer dropped and nobody came back in time.
    RejoinGraceExpired { token: u64 },
}

/// Everything that belongs to the current call and is reset on teardown.
#[derive(Debug, Default)]
pub struct LocalSessionState {
    pub state: CallState,
    pub call_type: CallType,
    pub call: Option<Call>,
    pub media: Option<LocalMedia>,
    pub screen: Option<MediaTrack>,
    pub is_muted: bool,
    pub is_video_off: bool,
    pub is_screen_sharing: bool,
    pub offline_targets: Vec<String>,
}

pub struct CallSession {
    user_id: String,
    config: CallConfig,
    local: LocalSessionState,
    peers: PeerRegistry,
    presence: PresenceProjection,
    relay: Arc<dyn SignalingRelay>,
    media_source: Arc<dyn LocalMediaSource>,
    sink: Arc<dyn RemoteStreamSink>,
    history: Option<Arc<CallHistory>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    grace_token: u64,
    snapshots: watch::Sender<CallSnapshot>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl CallSession {
    pub fn new(
        user_id: &str,
        config: CallConfig,
        relay: Arc<dyn SignalingRelay>,
        factory: Arc<dyn TransportFactory>,
        media_source: Arc<dyn LocalMediaSource>,
        sink: Arc<dyn RemoteStreamSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshots, _) = watch::channel(CallSnapshot::default());

        Self {
            user_id: user_id.to_string(),
            config,
            local: LocalSessionState::default(),
            peers: PeerRegistry::new(factory, events_tx.clone()),
            presence: PresenceProjection::new(),
            relay,
            media_source,
            sink,
            history: None,
            events_tx,
            events_rx: Some(events_rx),
            grace_token: 0,
            snapshots,
        }
    }

    /// Record every finished call into the local call log.
    pub fn with_history(mut self, history: Arc<CallHistory>) -> Self {
        self.history = Some(history);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> CallState {
        self.local.state
    }

    pub fn call_type(&self) -> CallType {
        self.local.call_type
    }

    pub fn call(&self) -> Option<&Call> {
        self.local.call.as_ref()
    }

    pub fn room_id(&self) -> Option<String> {
        self.local.call.as_ref().map(|c| c.room_id.clone())
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local.media.as_ref()
    }

    pub fn screen_track(&self) -> Option<&MediaTrack> {
        self.local.screen.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.local.is_muted
    }

    pub fn is_video_off(&self) -> bool {
        self.local.is_video_off
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.local.is_screen_sharing
    }

    pub fn offline_targets(&self) -> &[String] {
        &self.local.offline_targets
    }

    pub fn presence(&self, user_id: &str) -> Option<&ParticipantPresenceInfo> {
        self.presence.get(user_id)
    }

    pub fn participants(&self) -> Vec<ParticipantPresenceInfo> {
        self.presence.list()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.ids()
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains(peer_id)
    }

    pub fn peer_connection_state(&self, peer_id: &str) -> Option<ConnectionState> {
        self.peers.connection_state(peer_id)
    }

    pub fn queued_candidates(&self, peer_id: &str) -> usize {
        self.peers.queued_candidates(peer_id)
    }

    pub fn has_pending_answer(&self, peer_id: &str) -> bool {
        self.peers.has_pending_answer(peer_id)
    }

    /// True when nothing from a previous call survives: no media, no peers,
    /// no queued negotiation state and no presence entries.
    pub fn is_clear(&self) -> bool {
        self.local.state.is_idle()
            && self.local.call.is_none()
            && self.local.media.is_none()
            && self.local.screen.is_none()
            && self.peers.is_clear()
            && self.presence.is_empty()
            && self.local.offline_targets.is_empty()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            state: self.local.state,
            call_type: self.local.call_type,
            call_id: self.local.call.as_ref().map(|c| c.call_id.clone()),
            room_id: self.room_id(),
            is_muted: self.local.is_muted,
            is_video_off: self.local.is_video_off,
            is_screen_sharing: self.local.is_screen_sharing,
            participants: self.presence.list(),
            offline_targets: self.local.offline_targets.clone(),
            connected_peers: self.peers.connected_count(),
        }
    }

    /// Observe state changes. The receiver always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.subscribe()
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    fn expect_state(&self, expected: CallState, name: &'static str) -> Result<()> {
        if self.local.state != expected {
            return Err(Error::InvalidState {
                expected: name,
                actual: self.local.state,
            });
        }
        Ok(())
    }

    fn require_room(&self) -> Result<String> {
        self.room_id().ok_or(Error::NoActiveCall)
    }

    fn is_current_room(&self, room_id: &str) -> bool {
        self.local
            .call
            .as_ref()
            .map(|c| c.room_id == room_id)
            .unwrap_or(false)
    }

    /// Tracks attached to a new peer: audio plus whatever currently feeds the
    /// video sender (the screen while sharing, otherwise the camera).
    fn outgoing_tracks(&self) -> Vec<MediaTrack> {
        let mut tracks = Vec::new();
        if let Some(media) = &self.local.media {
            if let Some(audio) = &media.audio {
                tracks.push(audio.clone());
            }
            match (&self.local.screen, &media.camera) {
                (Some(screen), _) => tracks.push(screen.clone()),
                (None, Some(camera)) => tracks.push(camera.clone()),
                (None, None) => {}
            }
        }
        tracks
    }

    fn activate(&mut self) {
        if self.local.state != CallState::Active {
            info!("Call is now active");
        }
        self.local.state = CallState::Active;
        if let Some(call) = self.local.call.as_mut() {
            call.connected_at.get_or_insert_with(now_millis);
        }
    }

    // ========================================================================
    // User actions
    // ========================================================================

    /// Start a call to one or more users.
    ///
    /// Local media is acquired before the relay is contacted. A device error
    /// leaves the session idle; a relay error tears everything down again.
    pub async fn initiate_call(&mut self, target_ids: Vec<String>, call_type: CallType) -> Result<Call> {
        self.expect_state(CallState::Idle, "idle")?;

        let mut targets: Vec<String> = Vec::with_capacity(target_ids.len());
        for target in target_ids {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        if targets.is_empty() {
            return Err(Error::NoTargets);
        }
        if targets.iter().any(|t| t == &self.user_id) {
            return Err(Error::SelfTarget);
        }

        let media = self.media_source.acquire(call_type).await?;
        self.local.media = Some(media);
        self.local.call_type = call_type;
        self.local.is_video_off = !call_type.has_video();
        self.local.state = CallState::Calling;
        self.publish();

        let result = match self
            .relay
            .request(ClientEvent::Initiate {
                target_ids: targets,
                call_type,
            })
            .await
        {
            Ok(data) => decode_ack::<InitiateAck>(data),
            Err(e) => Err(e),
        };

        match result {
            Ok(ack) => {
                let mut call = ack.call;
                if call.room_id.is_empty() {
                    call.room_id = ack.room_id;
                }
                info!(
                    "Calling {} participant(s) in room {} ({} offline)",
                    call.participants.len().saturating_sub(1),
                    call.room_id,
                    ack.offline_targets.len()
                );
                self.local.offline_targets = ack.offline_targets;
                self.local.call = Some(call.clone());
                self.publish();
                Ok(call)
            }
            Err(e) => {
                warn!("Failed to initiate call: {}", e);
                self.teardown(EndReason::SetupFailed).await;
                Err(e)
            }
        }
    }

    /// Accept the ringing call. On failure the session keeps ringing and any
    /// media acquired for the attempt is released. A timed out accept is
    /// withdrawn with a leave, since the relay may already count us in.
    pub async fn accept_call(&mut self) -> Result<()> {
        self.expect_state(CallState::Ringing, "ringing")?;
        let (room_id, call_type) = match &self.local.call {
            Some(call) => (call.room_id.clone(), call.call_type),
            None => return Err(Error::NoActiveCall),
        };

        let media = self.media_source.acquire(call_type).await?;

        let result = match self.relay.request(ClientEvent::Accept { room_id: room_id.clone() }).await {
            Ok(data) => decode_ack::<AcceptAck>(data),
            Err(e) => Err(e),
        };

        let ack = match result {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Failed to accept call in room {}: {}", room_id, e);
                media.stop_all();
                if matches!(e, Error::Timeout) {
                    // The relay may have joined us anyway; undo that.
                    if let Err(e) = self.relay.emit(ClientEvent::Leave { room_id }) {
                        warn!("Failed to withdraw timed out accept: {}", e);
                    }
                }
                return Err(e);
            }
        };

        if self.local.state != CallState::Ringing {
            media.stop_all();
            return Err(Error::NoActiveCall);
        }

        let mut call = ack.call;
        if call.room_id.is_empty() {
            call.room_id = room_id.clone();
        }
        call.set_status(&self.user_id, ParticipantStatus::Joined, now_millis());

        self.local.media = Some(media);
        self.local.call_type = call.call_type;
        self.local.is_video_off = !call.call_type.has_video();
        self.local.call = Some(call);
        self.activate();
        info!("Accepted call in room {}", room_id);
        self.publish();
        Ok(())
    }

    /// Decline the ringing call. Local state is torn down even if the relay
    /// never acknowledges.
    pub async fn reject_call(&mut self, reason: Option<String>) -> Result<()> {
        self.expect_state(CallState::Ringing, "ringing")?;
        let room_id = self.require_room()?;

        let result = self.relay.request(ClientEvent::Reject { room_id, reason }).await;
        self.teardown(EndReason::Rejected).await;
        result.map(|_| ())
    }

    /// Withdraw an outgoing call nobody has answered yet.
    pub async fn cancel_call(&mut self) -> Result<()> {
        self.expect_state(CallState::Calling, "calling")?;
        let room_id = self.require_room()?;

        let result = self.relay.request(ClientEvent::Cancel { room_id }).await;
        self.teardown(EndReason::Cancelled).await;
        result.map(|_| ())
    }

    pub async fn leave_call(&mut self) -> Result<()> {
        self.expect_state(CallState::Active, "active")?;
        let room_id = self.require_room()?;

        let result = self.relay.request(ClientEvent::Leave { room_id }).await;
        self.teardown(EndReason::LocalHangup).await;
        result.map(|_| ())
    }

    /// Whatever ends the call from the current state: cancel, reject or leave.
    pub async fn hang_up(&mut self) -> Result<()> {
        match self.local.state {
            CallState::Idle => Ok(()),
            CallState::Calling if self.local.call.is_some() => self.cancel_call().await,
            CallState::Ringing => self.reject_call(None).await,
            CallState::Active => self.leave_call().await,
            CallState::Calling => {
                self.teardown(EndReason::LocalHangup).await;
                Ok(())
            }
        }
    }

    /// Hang up and release everything. Safe to call any number of times.
    pub async fn close(&mut self) -> Result<()> {
        let result = self.hang_up().await;
        if !self.is_clear() {
            self.teardown(EndReason::LocalHangup).await;
        }
        result
    }

    /// Invite another user into the current call. Returns true if the user
    /// was offline and will only be notified later.
    pub async fn add_participant(&mut self, user_id: &str) -> Result<bool> {
        if !matches!(self.local.state, CallState::Calling | CallState::Active) {
            return Err(Error::InvalidState {
                expected: "calling or active",
                actual: self.local.state,
            });
        }
        if user_id == self.user_id {
            return Err(Error::SelfTarget);
        }
        let room_id = self.require_room()?;
        let already_present = self
            .local
            .call
            .as_ref()
            .and_then(|c| c.participant(user_id))
            .map(|p| !p.status.is_terminal())
            .unwrap_or(false);
        if already_present {
            return Err(Error::AlreadyInCall(user_id.to_string()));
        }

        let data = self
            .relay
            .request(ClientEvent::AddParticipant {
                room_id,
                user_id: user_id.to_string(),
            })
            .await?;
        let ack: AddParticipantAck = decode_ack(data)?;

        let status = if ack.offline {
            ParticipantStatus::Invited
        } else {
            ParticipantStatus::Ringing
        };
        if let Some(call) = self.local.call.as_mut() {
            call.set_status(user_id, status, now_millis());
        }
        if ack.offline && !self.local.offline_targets.iter().any(|t| t == user_id) {
            self.local.offline_targets.push(user_id.to_string());
        }

        info!("Invited {} (offline: {})", user_id, ack.offline);
        self.publish();
        Ok(ack.offline)
    }

    // ========================================================================
    // Relay events
    // ========================================================================

    /// Apply one relay event. A failure is logged and confined to the event
    /// (and the peer) that caused it.
    pub async fn handle_server_event(&mut self, event: ServerEvent) {
        let name = event.name();
        if let Err(e) = self.dispatch_server_event(event).await {
            warn!("Failed to handle {} event: {}", name, e);
        }
        self.publish();
    }

    async fn dispatch_server_event(&mut self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::Incoming { call, caller } => self.on_incoming(call, caller),
            ServerEvent::Cancelled { room_id } => {
                if self.is_current_room(&room_id) {
                    info!("Call in room {} was cancelled", room_id);
                    self.teardown(EndReason::Cancelled).await;
                }
                Ok(())
            }
            ServerEvent::ParticipantJoined {
                user_id,
                identity,
                room_id,
            } => self.on_participant_joined(user_id, identity, room_id).await,
            ServerEvent::ParticipantLeft { user_id, call_ended } => {
                self.on_participant_left(&user_id, call_ended).await;
                Ok(())
            }
            ServerEvent::ParticipantRejected {
                user_id,
                reason,
                call_ended,
            } => {
                self.on_participant_rejected(user_id, reason, call_ended).await;
                Ok(())
            }
            ServerEvent::Offer {
                from_id,
                room_id,
                description,
            } => self.on_remote_offer(from_id, room_id, description).await,
            ServerEvent::Answer { from_id, description } => self.on_remote_answer(from_id, description).await,
            ServerEvent::IceCandidate { from_id, candidate } => self.on_remote_candidate(from_id, candidate).await,
            ServerEvent::TypeUpgraded { user_id, call_type } => {
                self.on_type_changed(call_type);
                if !self.local.state.is_idle() && call_type.has_video() {
                    self.presence.set_video_off(&user_id, false);
                    self.follow_video_upgrade(&user_id).await;
                }
                Ok(())
            }
            ServerEvent::TypeChanged { call_type } => {
                self.on_type_changed(call_type);
                Ok(())
            }
            ServerEvent::AudioToggled { user_id, muted } => {
                if !self.local.state.is_idle() {
                    self.presence.set_muted(&user_id, muted);
                }
                Ok(())
            }
            ServerEvent::VideoToggled { user_id, video_off } => {
                if !self.local.state.is_idle() {
                    self.presence.set_video_off(&user_id, video_off);
                }
                Ok(())
            }
            ServerEvent::ScreenShareToggled { user_id, sharing } => {
                if !self.local.state.is_idle() {
                    self.presence.set_screen_sharing(&user_id, sharing);
                }
                Ok(())
            }
        }
    }

    fn on_incoming(&mut self, call: Call, caller: Identity) -> Result<()> {
        if self.is_current_room(&call.room_id) {
            debug!("Duplicate incoming notification for room {}", call.room_id);
            return Ok(());
        }

        if !self.local.state.is_idle() {
            info!("Busy, declining incoming call from {}", caller.user_id);
            return self.relay.emit(ClientEvent::Reject {
                room_id: call.room_id,
                reason: Some("busy".to_string()),
            });
        }

        info!("Incoming {} call from {}", call.call_type.as_str(), caller.user_id);
        self.presence.upsert_identity(&caller);
        self.local.call_type = call.call_type;
        self.local.is_video_off = !call.call_type.has_video();
        self.local.call = Some(call);
        self.local.state = CallState::Ringing;
        Ok(())
    }

    async fn on_participant_joined(
        &mut self,
        user_id: String,
        identity: Identity,
        room_id: Option<String>,
    ) -> Result<()> {
        if self.local.state.is_idle() {
            debug!("Ignoring join of {} while idle", user_id);
            return Ok(());
        }
        if let Some(room_id) = room_id {
            if !self.is_current_room(&room_id) {
                debug!("Ignoring join of {} for foreign room {}", user_id, room_id);
                return Ok(());
            }
        }

        self.presence.upsert_identity(&identity);
        if let Some(call) = self.local.call.as_mut() {
            call.set_status(&user_id, ParticipantStatus::Joined, now_millis());
        }
        self.local.offline_targets.retain(|t| t != &user_id);

        if user_id == self.user_id {
            if self.local.media.is_some() {
                self.activate();
            }
            return Ok(());
        }

        if self.local.state == CallState::Calling {
            self.activate();
        }
        if self.local.state != CallState::Active || self.local.media.is_none() {
            return Ok(());
        }

        if self.peers.contains(&user_id) {
            debug!("{} joined again; keeping the existing connection", user_id);
            return Ok(());
        }

        // Existing participants offer to whoever just joined. Nothing queued
        // for this id can belong to the connection we are about to offer.
        let stale = self.peers.discard_candidates(&user_id);
        if stale > 0 {
            debug!("Discarded {} candidates from an earlier connection to {}", stale, user_id);
        }
        let tracks = self.outgoing_tracks();
        self.peers.ensure_peer(&user_id, &tracks).await?;
        self.start_offer(&user_id);
        Ok(())
    }

    async fn on_participant_left(&mut self, user_id: &str, call_ended: bool) {
        if self.local.state.is_idle() {
            return;
        }
        if user_id == self.user_id {
            self.teardown(EndReason::RemoteEnded).await;
            return;
        }

        info!("{} left the call", user_id);
        self.presence.remove(user_id);
        if let Some(call) = self.local.call.as_mut() {
            call.set_status(user_id, ParticipantStatus::Left, now_millis());
        }
        self.close_peer(user_id).await;

        if call_ended {
            self.teardown(EndReason::RemoteEnded).await;
        }
    }

    async fn on_participant_rejected(&mut self, user_id: Option<String>, reason: Option<String>, call_ended: bool) {
        if self.local.state.is_idle() {
            return;
        }

        if let Some(user_id) = &user_id {
            info!(
                "{} declined the call ({})",
                user_id,
                reason.as_deref().unwrap_or("no reason")
            );
            if let Some(call) = self.local.call.as_mut() {
                call.set_status(user_id, ParticipantStatus::Rejected, now_millis());
            }
            self.presence.remove(user_id);
            self.local.offline_targets.retain(|t| t != user_id);
        }

        if call_ended {
            self.teardown(EndReason::Rejected).await;
        }
    }

    fn on_type_changed(&mut self, call_type: CallType) {
        if self.local.state.is_idle() {
            return;
        }
        self.local.call_type = call_type;
        if let Some(call) = self.local.call.as_mut() {
            call.call_type = call_type;
        }
    }

    // ========================================================================
    // Session events
    // ========================================================================

    /// Take the receiving half of the session queue, for a driver that
    /// selects over several sources at once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Wait for the next queued session event and apply it. Returns false once
    /// the queue is closed or has been taken by a driver.
    pub async fn process_next_event(&mut self) -> bool {
        let event = match self.events_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => return false,
        };
        match event {
            Some(event) => {
                self.handle_session_event(event).await;
                true
            }
            None => false,
        }
    }

    /// Apply every event that is already queued without waiting.
    pub async fn process_ready_events(&mut self) -> usize {
        let mut count = 0;
        loop {
            let event = match self.events_rx.as_mut() {
                Some(rx) => match rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
                None => break,
            };
            self.handle_session_event(event).await;
            count += 1;
        }
        count
    }

    pub async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Transport {
                peer_id,
                generation,
                event,
            } => {
                if !self.peers.is_current(&peer_id, generation) {
                    debug!("Dropping stale transport event for {} (generation {})", peer_id, generation);
                } else if let Err(e) = self.on_transport_event(&peer_id, event).await {
                    warn!("Transport event for {} failed: {}", peer_id, e);
                }
            }
            SessionEvent::LocalOfferReady {
                peer_id,
                generation,
                result,
            } => self.on_local_offer_ready(&peer_id, generation, result).await,
            SessionEvent::ScreenShareEnded { track_id } => {
                let current = self.local.screen.as_ref().map(|s| s.id() == track_id).unwrap_or(false);
                if current {
                    info!("Screen capture ended by the platform");
                    if let Err(e) = self.stop_screen_share().await {
                        warn!("Failed to restore camera after screen share: {}", e);
                    }
                }
            }
            SessionEvent::RejoinGraceExpired { token } => {
                if token == self.grace_token && self.local.state == CallState::Active && self.peers.is_empty() {
                    info!("No peer reconnected within {:?}", self.config.rejoin_grace);
                    self.abandon_call().await;
                }
            }
        }
        self.publish();
    }

    async fn close_peer(&mut self, peer_id: &str) {
        if self.peers.close_peer(peer_id).await {
            self.sink.remove(peer_id);
        }
    }

    /// Every peer is gone: tell the relay we left and tear down.
    async fn abandon_call(&mut self) {
        if let Some(room_id) = self.room_id() {
            if let Err(e) = self.relay.emit(ClientEvent::Leave { room_id }) {
                warn!("Failed to notify relay of leave: {}", e);
            }
        }
        self.teardown(EndReason::PeersFailed).await;
    }

    /// End the call after a grace period unless a peer shows up again.
    fn schedule_rejoin_grace(&mut self) {
        self.grace_token += 1;
        let token = self.grace_token;
        let grace = self.config.rejoin_grace;
        let tx = self.events_tx.clone();

        debug!("All peers gone; waiting {:?} for a rejoin", grace);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(SessionEvent::RejoinGraceExpired { token });
        });
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Release everything that belongs to the current call and return to
    /// idle. Every exit path ends here; calling it again is a no-op.
    pub async fn teardown(&mut self, reason: EndReason) {
        let had_call = self.local.call.is_some() || !self.local.state.is_idle();

        if let Some(media) = self.local.media.take() {
            media.stop_all();
        }
        if let Some(screen) = self.local.screen.take() {
            screen.stop();
        }

        for peer_id in self.peers.close_all().await {
            self.sink.remove(&peer_id);
        }
        self.presence.clear();

        if let Some(mut call) = self.local.call.take() {
            call.ended_at = Some(now_millis());
            self.record_history(&call, reason);
        }

        self.local = LocalSessionState::default();
        // Outstanding grace timers belong to the old call.
        self.grace_token += 1;

        if had_call {
            info!("Call ended: {}", reason.as_str());
        }
        self.publish();
    }

    fn record_history(&self, call: &Call, reason: EndReason) {
        let Some(history) = &self.history else {
            return;
        };

        let entry = CallLogEntry {
            call_id: call.call_id.clone(),
            room_id: call.room_id.clone(),
            call_type: call.call_type,
            initiator_id: call.initiator_id.clone(),
            participants: call.participants.iter().map(|p| p.user_id.clone()).collect(),
            created_at: call.created_at,
            connected_at: call.connected_at,
            ended_at: call.ended_at.unwrap_or_else(now_millis),
            end_reason: reason,
        };
        if let Err(e) = history.record(&entry) {
            warn!("Failed to record call {}: {}", call.call_id, e);
        }
    }
}
