//! In-memory relay, transport and media doubles for driving a `CallSession`.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use huddle_core::{
    CallConfig, CallHistory, CallSession, CallType, ClientEvent, Error, IceCandidate, LocalMedia, LocalMediaSource, MediaTrack,
    PeerEventSink, PeerTransport, RemoteStreams, Result, SdpKind, SessionDescription, SignalingRelay,
    SignalingState, TrackKind, TrackSource, TransportFactory,
};
use huddle_core::{Call, ParticipantEntry, ParticipantStatus};

// ============================================================================
// Relay
// ============================================================================

pub struct MockRelay {
    user_id: String,
    requests: Mutex<Vec<ClientEvent>>,
    emitted: Mutex<Vec<ClientEvent>>,
    scripted: Mutex<HashMap<&'static str, VecDeque<Result<Value>>>>,
}

impl MockRelay {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            requests: Mutex::new(Vec::new()),
            emitted: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
        }
    }

    /// Queue the acknowledgement for the next request with this event name.
    pub fn respond(&self, name: &'static str, result: Result<Value>) {
        self.scripted.lock().entry(name).or_default().push_back(result);
    }

    pub fn requests(&self) -> Vec<ClientEvent> {
        self.requests.lock().clone()
    }

    pub fn request_names(&self) -> Vec<&'static str> {
        self.requests.lock().iter().map(|e| e.name()).collect()
    }

    pub fn emitted(&self) -> Vec<ClientEvent> {
        self.emitted.lock().clone()
    }

    pub fn take_emitted(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.emitted.lock())
    }

    pub fn offers_to(&self, target: &str) -> Vec<SessionDescription> {
        self.emitted
            .lock()
            .iter()
            .filter_map(|e| match e {
                ClientEvent::Offer {
                    target_id, description, ..
                } if target_id == target => Some(description.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn answers_to(&self, target: &str) -> Vec<SessionDescription> {
        self.emitted
            .lock()
            .iter()
            .filter_map(|e| match e {
                ClientEvent::Answer {
                    target_id, description, ..
                } if target_id == target => Some(description.clone()),
                _ => None,
            })
            .collect()
    }

    fn default_ack(&self, event: &ClientEvent) -> Result<Value> {
        match event {
            ClientEvent::Initiate { target_ids, call_type } => {
                let mut participants = vec![ParticipantEntry {
                    user_id: self.user_id.clone(),
                    status: ParticipantStatus::Joined,
                    joined_at: Some(1),
                    left_at: None,
                }];
                for target in target_ids {
                    participants.push(ParticipantEntry {
                        user_id: target.clone(),
                        status: ParticipantStatus::Ringing,
                        joined_at: None,
                        left_at: None,
                    });
                }
                let call = Call {
                    call_id: "call-1".into(),
                    room_id: "room-1".into(),
                    call_type: *call_type,
                    initiator_id: self.user_id.clone(),
                    participants,
                    created_at: 1,
                    connected_at: None,
                    ended_at: None,
                };
                Ok(json!({"call": call, "room_id": "room-1", "offline_targets": []}))
            }
            ClientEvent::Accept { .. } => Err(Error::Relay("unscripted accept".into())),
            ClientEvent::AddParticipant { .. } => Ok(json!({"offline": false})),
            _ => Ok(json!({})),
        }
    }
}

#[async_trait]
impl SignalingRelay for MockRelay {
    async fn request(&self, event: ClientEvent) -> Result<Value> {
        self.requests.lock().push(event.clone());
        let scripted = self.scripted.lock().get_mut(event.name()).and_then(|q| q.pop_front());
        match scripted {
            Some(result) => result,
            None => self.default_ack(&event),
        }
    }

    fn emit(&self, event: ClientEvent) -> Result<()> {
        self.emitted.lock().push(event);
        Ok(())
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Default)]
struct TransportState {
    signaling: Option<SignalingState>,
    remote: Option<SessionDescription>,
    remotes_applied: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
    tracks: Vec<MediaTrack>,
    video: Option<MediaTrack>,
    offers_created: usize,
    rollbacks: usize,
    closed: bool,
}

/// Follows the offer/answer state rules of a real peer connection.
pub struct MockTransport {
    pub peer_id: String,
    pub events: PeerEventSink,
    state: Mutex<TransportState>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockTransport {
    fn new(peer_id: &str, events: PeerEventSink, gated: bool) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            events,
            state: Mutex::new(TransportState::default()),
            gate: Mutex::new(if gated { Some(Arc::new(Semaphore::new(0))) } else { None }),
        }
    }

    /// Block every following `set_local_description` until released.
    pub fn hold_local_descriptions(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_local_descriptions(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(1_000);
        }
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn signaling(&self) -> SignalingState {
        self.current()
    }

    pub fn remotes_applied(&self) -> Vec<SessionDescription> {
        self.state.lock().remotes_applied.clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.state.lock().candidates.iter().map(|c| c.candidate.clone()).collect()
    }

    pub fn track_kinds(&self) -> Vec<TrackKind> {
        self.state.lock().tracks.iter().map(|t| t.kind()).collect()
    }

    pub fn video_track(&self) -> Option<MediaTrack> {
        self.state.lock().video.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn current(&self) -> SignalingState {
        self.state.lock().signaling.unwrap_or(SignalingState::Stable)
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "offer-for-{}-{}",
            self.peer_id, state.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.current() != SignalingState::HaveRemoteOffer {
            return Err(Error::Transport("no remote offer to answer".into()));
        }
        Ok(SessionDescription::answer(format!("answer-for-{}", self.peer_id)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| Error::Transport("gate closed".into()))?;
        }

        let mut state = self.state.lock();
        let current = state.signaling.unwrap_or(SignalingState::Stable);
        state.signaling = Some(match (description.kind, current) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(Error::Transport(format!("set local {:?} in {:?}", kind, current)));
            }
        });
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        let current = state.signaling.unwrap_or(SignalingState::Stable);
        state.signaling = Some(match (description.kind, current) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(Error::Transport(format!("set remote {:?} in {:?}", kind, current)));
            }
        });
        state.remote = Some(description.clone());
        state.remotes_applied.push(description);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.signaling != Some(SignalingState::HaveLocalOffer) {
            return Err(Error::Transport("nothing to roll back".into()));
        }
        state.signaling = Some(SignalingState::Stable);
        state.rollbacks += 1;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(Error::Transport("candidate before remote description".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        let mut state = self.state.lock();
        if track.kind() == TrackKind::Video {
            state.video = Some(track.clone());
        }
        state.tracks.push(track.clone());
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<()> {
        let mut state = self.state.lock();
        if state.video.is_none() {
            return Err(Error::NoVideoTrack);
        }
        state.video = track.cloned();
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.current()
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = Some(SignalingState::Closed);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockFactory {
    created: Mutex<HashMap<String, Vec<Arc<MockTransport>>>>,
    gated: Mutex<HashSet<String>>,
}

impl MockFactory {
    /// Transports created for this peer start with `set_local_description` held.
    pub fn gate(&self, peer_id: &str) {
        self.gated.lock().insert(peer_id.to_string());
    }

    /// The newest transport created for the peer.
    pub fn transport(&self, peer_id: &str) -> Arc<MockTransport> {
        self.created
            .lock()
            .get(peer_id)
            .and_then(|all| all.last().cloned())
            .unwrap_or_else(|| panic!("no transport created for {}", peer_id))
    }

    pub fn created(&self, peer_id: &str) -> usize {
        self.created.lock().get(peer_id).map(|all| all.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(&self, peer_id: &str, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>> {
        let gated = self.gated.lock().contains(peer_id);
        let transport = Arc::new(MockTransport::new(peer_id, events, gated));
        self.created
            .lock()
            .entry(peer_id.to_string())
            .or_default()
            .push(transport.clone());
        Ok(transport)
    }
}

// ============================================================================
// Media
// ============================================================================

#[derive(Default)]
pub struct MockMediaSource {
    fail_acquire: Mutex<Option<Error>>,
    fail_camera: Mutex<Option<Error>>,
    acquired: Mutex<Vec<MediaTrack>>,
}

impl MockMediaSource {
    pub fn fail_next_acquire(&self, error: Error) {
        *self.fail_acquire.lock() = Some(error);
    }

    pub fn fail_next_camera(&self, error: Error) {
        *self.fail_camera.lock() = Some(error);
    }

    /// Every track handed out so far, in order.
    pub fn acquired(&self) -> Vec<MediaTrack> {
        self.acquired.lock().clone()
    }

    pub fn acquired_from(&self, source: TrackSource) -> Vec<MediaTrack> {
        self.acquired
            .lock()
            .iter()
            .filter(|t| t.source() == source)
            .cloned()
            .collect()
    }

    fn track(&self, source: TrackSource) -> MediaTrack {
        let track = MediaTrack::new(source);
        self.acquired.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl LocalMediaSource for MockMediaSource {
    async fn acquire(&self, call_type: CallType) -> Result<LocalMedia> {
        if let Some(e) = self.fail_acquire.lock().take() {
            return Err(e);
        }
        let audio = Some(self.track(TrackSource::Microphone));
        let camera = if call_type.has_video() {
            Some(self.track(TrackSource::Camera))
        } else {
            None
        };
        Ok(LocalMedia { audio, camera })
    }

    async fn acquire_camera(&self) -> Result<MediaTrack> {
        if let Some(e) = self.fail_camera.lock().take() {
            return Err(e);
        }
        Ok(self.track(TrackSource::Camera))
    }

    async fn acquire_screen(&self) -> Result<MediaTrack> {
        Ok(self.track(TrackSource::Screen))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub session: CallSession,
    pub relay: Arc<MockRelay>,
    pub factory: Arc<MockFactory>,
    pub media: Arc<MockMediaSource>,
    pub streams: Arc<RemoteStreams>,
}

impl Harness {
    pub fn with_history(self, history: Arc<CallHistory>) -> Self {
        Harness {
            session: self.session.with_history(history),
            ..self
        }
    }
}

pub fn test_config() -> CallConfig {
    CallConfig {
        request_timeout: Duration::from_secs(1),
        rejoin_grace: Duration::from_secs(15),
        stun_urls: Vec::new(),
    }
}

pub fn harness(user_id: &str) -> Harness {
    harness_with(user_id, test_config())
}

pub fn harness_with(user_id: &str, config: CallConfig) -> Harness {
    let relay = Arc::new(MockRelay::new(user_id));
    let factory = Arc::new(MockFactory::default());
    let media = Arc::new(MockMediaSource::default());
    let streams = Arc::new(RemoteStreams::new());

    let session = CallSession::new(
        user_id,
        config,
        relay.clone(),
        factory.clone(),
        media.clone(),
        streams.clone(),
    );

    Harness {
        session,
        relay,
        factory,
        media,
        streams,
    }
}

/// Let spawned offer tasks run and apply whatever they posted back.
pub async fn settle(session: &mut CallSession) {
    for _ in 0..10 {
        tokio::task::yield_now().await;
        session.process_ready_events().await;
    }
}

pub fn call(room_id: &str, initiator: &str, call_type: CallType, members: &[(&str, ParticipantStatus)]) -> Call {
    Call {
        call_id: format!("call-{}", room_id),
        room_id: room_id.to_string(),
        call_type,
        initiator_id: initiator.to_string(),
        participants: members
            .iter()
            .map(|(user_id, status)| ParticipantEntry {
                user_id: user_id.to_string(),
                status: *status,
                joined_at: None,
                left_at: None,
            })
            .collect(),
        created_at: 1,
        connected_at: None,
        ended_at: None,
    }
}

pub fn candidate(value: &str) -> IceCandidate {
    IceCandidate::new(value)
}
