//! Abstract per-peer media transport.
//!
//! One transport per remote participant. Callbacks from the transport never
//! touch session state directly: they are posted as [`SessionEvent`]s into the
//! session's queue, tagged with the peer id and the generation of the entry
//! that produced them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{MediaTrack, RemoteTrack};
use crate::session::SessionEvent;
use crate::signaling::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    IceCandidate(IceCandidate),
    Track(RemoteTrack),
    ConnectionState(ConnectionState),
    NegotiationNeeded,
}

/// Posts transport callbacks into the owning session's queue.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerEventSink {
    pub fn new(peer_id: &str, generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn send(&self, event: TransportEvent) {
        // The session is gone; nothing left to notify.
        let _ = self.tx.send(SessionEvent::Transport {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) {
        self.send(TransportEvent::IceCandidate(candidate));
    }

    pub fn track(&self, track: RemoteTrack) {
        self.send(TransportEvent::Track(track));
    }

    pub fn connection_state(&self, state: ConnectionState) {
        self.send(TransportEvent::ConnectionState(state));
    }

    pub fn negotiation_needed(&self) {
        self.send(TransportEvent::NegotiationNeeded);
    }
}

/// One bidirectional media transport to a single remote participant.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Discard our unanswered offer: have-local-offer back to stable.
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach a local track. Changes the track set, so renegotiation follows.
    async fn add_track(&self, track: &MediaTrack) -> Result<()>;

    /// Swap what the video sender transmits. No renegotiation.
    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, peer_id: &str, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>>;
}
