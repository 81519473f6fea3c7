//! Offer/answer and ICE handling for the session's peers.
//!
//! Offers are created off the consumer: the spawned task runs `create_offer`
//! and `set_local_description`, then posts [`SessionEvent::LocalOfferReady`].
//! An answer that arrives in between is held and applied once the offer has
//! settled.
//!
//! Two renegotiations can cross, e.g. when both ends attach a camera at once.
//! Of the two colliding offers the one from the lower user id stands: that
//! side ignores the incoming offer, the other side rolls its own back,
//! answers, and offers again afterwards.

use log::{debug, info, warn};

use super::{now_millis, CallSession, SessionEvent};
use crate::error::{Error, Result};
use crate::models::CallState;
use crate::signaling::{ClientEvent, IceCandidate, SessionDescription};
use crate::transport::{ConnectionState, SignalingState, TransportEvent};

impl CallSession {
    /// Take the peer's negotiation lock and start an offer. Returns false if
    /// an offer is already in flight.
    pub(super) fn start_offer(&mut self, peer_id: &str) -> bool {
        let Some((transport, generation)) = self.peers.try_begin_negotiation(peer_id) else {
            debug!("Offer to {} already in flight", peer_id);
            return false;
        };

        let tx = self.events_tx.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            let result: Result<SessionDescription> = async {
                let offer = transport.create_offer().await?;
                transport.set_local_description(offer.clone()).await?;
                Ok(offer)
            }
            .await;

            let _ = tx.send(SessionEvent::LocalOfferReady {
                peer_id,
                generation,
                result,
            });
        });

        true
    }

    /// Offer again to an established peer, e.g. after a track was added.
    /// Skipped while another negotiation for the peer is under way.
    pub(super) async fn renegotiate(&mut self, peer_id: &str) -> bool {
        if self.local.state != CallState::Active {
            return false;
        }
        let Some(transport) = self.peers.transport(peer_id) else {
            return false;
        };
        if self.peers.is_negotiating(peer_id) {
            debug!("Renegotiation with {} deferred: offer in flight", peer_id);
            return false;
        }
        let signaling = transport.signaling_state();
        if signaling != SignalingState::Stable {
            debug!("Renegotiation with {} deferred: signaling {:?}", peer_id, signaling);
            return false;
        }
        if !transport.has_remote_description().await {
            debug!("Renegotiation with {} deferred: initial exchange pending", peer_id);
            return false;
        }

        self.start_offer(peer_id)
    }

    pub(super) async fn on_local_offer_ready(
        &mut self,
        peer_id: &str,
        generation: u64,
        result: Result<SessionDescription>,
    ) {
        if !self.peers.settle_local_offer(peer_id, generation) {
            debug!("Dropping offer for replaced peer {}", peer_id);
            return;
        }

        if let Some(remote_offer) = self.peers.take_held_offer(peer_id) {
            self.peers.end_negotiation(peer_id, generation);
            if result.is_ok() {
                debug!("Withdrawing our offer to {} in favour of theirs", peer_id);
            }
            if let Err(e) = self.yield_to_offer(peer_id, remote_offer).await {
                warn!("Failed to answer colliding offer from {}: {}", peer_id, e);
            }
            return;
        }

        let offer = match result {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Failed to create offer for {}: {}", peer_id, e);
                self.peers.end_negotiation(peer_id, generation);
                return;
            }
        };

        if let Some(answer) = self.peers.take_pending_answer(peer_id) {
            debug!("Applying early answer from {}", peer_id);
            if let Err(e) = self.apply_answer(peer_id, answer).await {
                warn!("Failed to apply answer from {}: {}", peer_id, e);
            }
        }

        match self.room_id() {
            Some(room_id) => {
                let event = ClientEvent::Offer {
                    room_id,
                    target_id: peer_id.to_string(),
                    description: offer,
                };
                if let Err(e) = self.relay.emit(event) {
                    warn!("Failed to send offer to {}: {}", peer_id, e);
                }
            }
            None => debug!("Offer for {} outlived its call", peer_id),
        }

        self.peers.end_negotiation(peer_id, generation);
    }

    /// Apply an answer only while we actually wait for one.
    async fn apply_answer(&mut self, peer_id: &str, answer: SessionDescription) -> Result<()> {
        let Some(transport) = self.peers.transport(peer_id) else {
            return Ok(());
        };
        let signaling = transport.signaling_state();
        if signaling != SignalingState::HaveLocalOffer {
            debug!("Ignoring answer from {} in signaling state {:?}", peer_id, signaling);
            return Ok(());
        }

        self.peers.apply_remote_description(peer_id, answer).await?;
        Ok(())
    }

    pub(super) async fn on_remote_offer(
        &mut self,
        from_id: String,
        room_id: String,
        description: SessionDescription,
    ) -> Result<()> {
        if self.local.state.is_idle() {
            debug!("Ignoring offer from {} while idle", from_id);
            return Ok(());
        }
        if !self.is_current_room(&room_id) {
            debug!("Ignoring offer from {} for foreign room {}", from_id, room_id);
            return Ok(());
        }
        if self.local.media.is_none() {
            debug!("Ignoring offer from {}: no local media yet", from_id);
            return Ok(());
        }

        let tracks = self.outgoing_tracks();
        let transport = self.peers.ensure_peer(&from_id, &tracks).await?;

        let offer_pending = self.peers.is_offer_pending(&from_id);
        if offer_pending || transport.signaling_state() == SignalingState::HaveLocalOffer {
            if !self.yields_to(&from_id) {
                debug!("Offer from {} collided with ours; keeping ours", from_id);
                return Ok(());
            }
            if offer_pending {
                debug!("Offer from {} collided with ours; answering once ours settles", from_id);
                self.peers.hold_offer(&from_id, description);
                return Ok(());
            }
            return self.yield_to_offer(&from_id, description).await;
        }

        self.answer_offer(&from_id, description).await
    }

    /// In an offer collision the side with the greater user id backs off.
    fn yields_to(&self, peer_id: &str) -> bool {
        self.user_id.as_str() > peer_id
    }

    /// Roll back our unanswered offer, answer theirs, then offer again for
    /// whatever change ours carried.
    async fn yield_to_offer(&mut self, peer_id: &str, offer: SessionDescription) -> Result<()> {
        let Some(transport) = self.peers.transport(peer_id) else {
            return Ok(());
        };
        self.peers.take_pending_answer(peer_id);
        if transport.signaling_state() == SignalingState::HaveLocalOffer {
            transport.rollback().await?;
        }

        self.answer_offer(peer_id, offer).await?;
        self.renegotiate(peer_id).await;
        Ok(())
    }

    async fn answer_offer(&mut self, peer_id: &str, offer: SessionDescription) -> Result<()> {
        let Some(transport) = self.peers.transport(peer_id) else {
            return Ok(());
        };
        let room_id = self.require_room()?;

        if let Err(e) = self.peers.apply_remote_description(peer_id, offer).await {
            return Err(Error::Transport(format!("remote offer from {}: {}", peer_id, e)));
        }

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;

        self.relay.emit(ClientEvent::Answer {
            room_id,
            target_id: peer_id.to_string(),
            description: answer,
        })
    }

    pub(super) async fn on_remote_answer(&mut self, from_id: String, description: SessionDescription) -> Result<()> {
        if self.local.state.is_idle() {
            return Ok(());
        }
        if !self.peers.contains(&from_id) {
            debug!("Ignoring answer from unknown peer {}", from_id);
            return Ok(());
        }

        if self.peers.is_offer_pending(&from_id) {
            if self.peers.hold_answer(&from_id, description) {
                debug!("Holding answer from {} until our offer settles", from_id);
            } else {
                debug!("Dropping duplicate early answer from {}", from_id);
            }
            return Ok(());
        }

        self.apply_answer(&from_id, description).await
    }

    pub(super) async fn on_remote_candidate(&mut self, from_id: String, candidate: IceCandidate) -> Result<()> {
        if self.local.state.is_idle() {
            return Ok(());
        }
        if !self.peers.add_ice_candidate(&from_id, candidate).await? {
            debug!("Queued candidate for {} ({} waiting)", from_id, self.peers.queued_candidates(&from_id));
        }
        Ok(())
    }

    pub(super) async fn on_transport_event(&mut self, peer_id: &str, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                let room_id = self.require_room()?;
                self.relay.emit(ClientEvent::IceCandidate {
                    room_id,
                    target_id: peer_id.to_string(),
                    candidate,
                })?;
            }
            TransportEvent::Track(track) => {
                debug!("Remote {:?} track from {}", track.kind, peer_id);
                self.sink.publish(peer_id, track);
            }
            TransportEvent::ConnectionState(state) => {
                self.peers.set_connection_state(peer_id, state);
                match state {
                    ConnectionState::Connected => {
                        info!("Connected to {}", peer_id);
                        if self.local.state == CallState::Calling {
                            self.activate();
                        }
                        if let Some(call) = self.local.call.as_mut() {
                            call.connected_at.get_or_insert_with(now_millis);
                        }
                    }
                    state if state.is_terminal() => {
                        warn!("Connection to {} {:?}", peer_id, state);
                        self.close_peer(peer_id).await;
                        if self.local.state == CallState::Active && self.peers.is_empty() {
                            if self.config.rejoin_grace.is_zero() {
                                self.abandon_call().await;
                            } else {
                                self.schedule_rejoin_grace();
                            }
                        }
                    }
                    _ => {}
                }
            }
            TransportEvent::NegotiationNeeded => {
                self.renegotiate(peer_id).await;
            }
        }
        Ok(())
    }
}
