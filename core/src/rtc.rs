//! webrtc-rs backed peer transport.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::media::{MediaTrack, RemoteTrack, TrackKind};
use crate::models::TurnCredentials;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{ConnectionState, PeerEventSink, PeerTransport, SignalingState, TransportFactory};

// ============================================================================
// Factory
// ============================================================================

pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new(stun_urls: &[String], turn: Option<&TurnCredentials>) -> Self {
        let mut ice_servers = Vec::new();
        if !stun_urls.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: stun_urls.to_vec(),
                ..Default::default()
            });
        }
        if let Some(turn) = turn {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        Self { ice_servers }
    }

    pub fn ice_server_count(&self) -> usize {
        self.ice_servers.len()
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        Ok(Arc::new(api.new_peer_connection(config).await?))
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, peer_id: &str, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>> {
        let pc = self.new_peer_connection().await?;

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.ice_candidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(e) => warn!("Unusable local candidate for {}: {}", sink.peer_id(), e),
                }
            })
        }));

        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = if track.kind() == RTPCodecType::Video {
                        TrackKind::Video
                    } else {
                        TrackKind::Audio
                    };
                    let track_id = format!("{}-{}", track.kind(), track.ssrc());
                    sink.track(RemoteTrack {
                        track_id,
                        kind,
                        rtc: Some(track),
                    });
                })
            },
        ));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let mapped = match state {
                RTCPeerConnectionState::New => Some(ConnectionState::New),
                RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                _ => None,
            };
            if let Some(state) = mapped {
                sink.connection_state(state);
            }
            Box::pin(async {})
        }));

        let sink = events;
        pc.on_negotiation_needed(Box::new(move || {
            sink.negotiation_needed();
            Box::pin(async {})
        }));

        debug!("Peer connection for {} ready", peer_id);
        Ok(Arc::new(RtcTransport {
            peer_id: peer_id.to_string(),
            pc,
            video_sender: Mutex::new(None),
        }))
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct RtcTransport {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    /// The sender that carries camera or screen.
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(Error::Transport(format!("unsupported description type {}", other))),
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let Some(mut pending) = self.pc.pending_local_description().await else {
            return Err(Error::Transport("no local offer to roll back".into()));
        };
        pending.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(pending).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack) -> Result<()> {
        let sender = self
            .pc
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        if track.kind() == TrackKind::Video {
            *self.video_sender.lock() = Some(Arc::clone(&sender));
        }

        // RTCP has to be drained for the interceptors to work.
        let peer_id = self.peer_id.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
            debug!("RTCP reader for {} stopped", peer_id);
        });

        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<()> {
        let sender = self.video_sender.lock().clone().ok_or(Error::NoVideoTrack)?;
        let replacement = track.map(|t| t.rtc_track() as Arc<dyn TrackLocal + Send + Sync>);
        sender.replace_track(replacement).await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Other,
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
