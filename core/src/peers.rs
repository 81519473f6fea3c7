//! Peer connection registry: one transport per remote participant, plus the
//! per-peer ICE queue, pending-answer slot and negotiation lock.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::MediaTrack;
use crate::queue::{IceCandidateQueue, PendingAnswerBuffer};
use crate::session::SessionEvent;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::transport::{ConnectionState, PeerEventSink, PeerTransport, TransportFactory};

pub struct PeerEntry {
    pub transport: Arc<dyn PeerTransport>,
    pub generation: u64,
    pub connection_state: ConnectionState,
    /// Negotiation lock: an offer for this peer is in flight.
    negotiating: bool,
    /// Our offer exists but `set_local_description` has not resolved yet.
    offer_pending: bool,
    /// A remote offer that collided with our pending one and wins over it.
    held_offer: Option<SessionDescription>,
}

pub struct PeerRegistry {
    peers: HashMap<String, PeerEntry>,
    ice: IceCandidateQueue,
    answers: PendingAnswerBuffer,
    next_generation: u64,
    factory: Arc<dyn TransportFactory>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            peers: HashMap::new(),
            ice: IceCandidateQueue::new(),
            answers: PendingAnswerBuffer::new(),
            next_generation: 0,
            factory,
            events,
        }
    }

    /// Return the peer's transport, creating it with every given local track
    /// attached if it does not exist yet.
    pub async fn ensure_peer(&mut self, peer_id: &str, tracks: &[MediaTrack]) -> Result<Arc<dyn PeerTransport>> {
        if let Some(entry) = self.peers.get(peer_id) {
            return Ok(Arc::clone(&entry.transport));
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = PeerEventSink::new(peer_id, generation, self.events.clone());
        let transport = self.factory.create(peer_id, sink).await?;

        for track in tracks {
            if let Err(e) = transport.add_track(track).await {
                let _ = transport.close().await;
                return Err(e);
            }
        }

        debug!("Peer {} created (generation {})", peer_id, generation);
        self.peers.insert(
            peer_id.to_string(),
            PeerEntry {
                transport: Arc::clone(&transport),
                generation,
                connection_state: ConnectionState::New,
                negotiating: false,
                offer_pending: false,
                held_offer: None,
            },
        );

        Ok(transport)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    pub fn transport(&self, peer_id: &str) -> Option<Arc<dyn PeerTransport>> {
        self.peers.get(peer_id).map(|e| Arc::clone(&e.transport))
    }

    /// Events from a closed or replaced entry carry a stale generation.
    pub fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.peers
            .get(peer_id)
            .map(|e| e.generation == generation)
            .unwrap_or(false)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn transports(&self) -> Vec<(String, Arc<dyn PeerTransport>)> {
        let mut all: Vec<(String, Arc<dyn PeerTransport>)> = self
            .peers
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(&e.transport)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn set_connection_state(&mut self, peer_id: &str, state: ConnectionState) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.connection_state = state;
        }
    }

    pub fn connection_state(&self, peer_id: &str) -> Option<ConnectionState> {
        self.peers.get(peer_id).map(|e| e.connection_state)
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|e| e.connection_state == ConnectionState::Connected)
            .count()
    }

    // ========================================================================
    // Negotiation lock
    // ========================================================================

    /// Take the negotiation lock. `None` if the peer is unknown or an offer
    /// is already in flight.
    pub fn try_begin_negotiation(&mut self, peer_id: &str) -> Option<(Arc<dyn PeerTransport>, u64)> {
        let entry = self.peers.get_mut(peer_id)?;
        if entry.negotiating {
            return None;
        }
        entry.negotiating = true;
        entry.offer_pending = true;
        Some((Arc::clone(&entry.transport), entry.generation))
    }

    /// Our local offer resolved (or failed). Returns false for stale entries.
    pub fn settle_local_offer(&mut self, peer_id: &str, generation: u64) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(entry) if entry.generation == generation => {
                entry.offer_pending = false;
                true
            }
            _ => false,
        }
    }

    pub fn end_negotiation(&mut self, peer_id: &str, generation: u64) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            if entry.generation == generation {
                entry.negotiating = false;
                entry.offer_pending = false;
            }
        }
    }

    pub fn is_negotiating(&self, peer_id: &str) -> bool {
        self.peers.get(peer_id).map(|e| e.negotiating).unwrap_or(false)
    }

    pub fn is_offer_pending(&self, peer_id: &str) -> bool {
        self.peers.get(peer_id).map(|e| e.offer_pending).unwrap_or(false)
    }

    // ========================================================================
    // Early arrivals
    // ========================================================================

    pub fn hold_answer(&mut self, peer_id: &str, answer: SessionDescription) -> bool {
        self.answers.store(peer_id, answer)
    }

    pub fn take_pending_answer(&mut self, peer_id: &str) -> Option<SessionDescription> {
        self.answers.take(peer_id)
    }

    pub fn has_pending_answer(&self, peer_id: &str) -> bool {
        self.answers.contains(peer_id)
    }

    /// Park a remote offer until our own offer has settled.
    pub fn hold_offer(&mut self, peer_id: &str, offer: SessionDescription) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.held_offer = Some(offer);
        }
    }

    pub fn take_held_offer(&mut self, peer_id: &str) -> Option<SessionDescription> {
        self.peers.get_mut(peer_id).and_then(|e| e.held_offer.take())
    }

    pub fn queued_candidates(&self, peer_id: &str) -> usize {
        self.ice.len(peer_id)
    }

    /// Drop everything queued for the peer. Returns how many were dropped.
    pub fn discard_candidates(&mut self, peer_id: &str) -> usize {
        self.ice.take(peer_id).len()
    }

    /// Set the remote description, then apply every queued candidate in
    /// arrival order. The queue is only consumed if the description was set.
    pub async fn apply_remote_description(&mut self, peer_id: &str, description: SessionDescription) -> Result<usize> {
        let Some(transport) = self.transport(peer_id) else {
            return Ok(0);
        };

        transport.set_remote_description(description).await?;

        let queued = self.ice.take(peer_id);
        let count = queued.len();
        for candidate in queued {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("Dropping queued candidate for {}: {}", peer_id, e);
            }
        }
        if count > 0 {
            debug!("Applied {} queued candidates for {}", count, peer_id);
        }

        Ok(count)
    }

    /// Apply now if the peer has a remote description, otherwise queue.
    /// Returns true if the candidate was applied.
    pub async fn add_ice_candidate(&mut self, peer_id: &str, candidate: IceCandidate) -> Result<bool> {
        if let Some(transport) = self.transport(peer_id) {
            if transport.has_remote_description().await {
                transport.add_ice_candidate(candidate).await?;
                return Ok(true);
            }
        }
        self.ice.push(peer_id, candidate);
        Ok(false)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Close one peer. Never touches any other entry.
    pub async fn close_peer(&mut self, peer_id: &str) -> bool {
        self.ice.remove(peer_id);
        self.answers.remove(peer_id);

        match self.peers.remove(peer_id) {
            Some(entry) => {
                if let Err(e) = entry.transport.close().await {
                    warn!("Error closing peer {}: {}", peer_id, e);
                }
                debug!("Peer {} closed", peer_id);
                true
            }
            None => false,
        }
    }

    /// Close every peer and drop all queued state. Returns the closed ids.
    pub async fn close_all(&mut self) -> Vec<String> {
        let ids = self.ids();
        for id in &ids {
            self.close_peer(id).await;
        }
        self.ice.clear();
        self.answers.clear();
        ids
    }

    /// No peers, no queued candidates, no held answers.
    pub fn is_clear(&self) -> bool {
        self.peers.is_empty() && self.ice.is_empty() && self.answers.is_empty()
    }
}
