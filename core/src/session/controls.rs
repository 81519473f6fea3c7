//! Local media controls: mute, camera, audio-to-video upgrade and screen
//! sharing.

use log::{debug, info, warn};

use super::{CallSession, SessionEvent};
use crate::error::{Error, Result};
use crate::media::MediaTrack;
use crate::models::{CallState, CallType};
use crate::signaling::ClientEvent;

impl CallSession {
    /// Flip the microphone. Returns the new muted state.
    pub fn toggle_mute(&mut self) -> Result<bool> {
        let muted = !self.local.is_muted;
        self.set_muted(muted)?;
        Ok(muted)
    }

    /// Setting the current value again is a no-op apart from the broadcast.
    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        let room_id = self.require_room()?;
        let audio = self
            .local
            .media
            .as_ref()
            .and_then(|m| m.audio.clone())
            .ok_or(Error::NoAudioTrack)?;

        audio.set_enabled(!muted);
        self.local.is_muted = muted;
        self.broadcast(ClientEvent::ToggleAudio { room_id, muted });
        self.publish();
        Ok(())
    }

    /// Flip the camera. Returns the new video-off state.
    pub fn toggle_camera(&mut self) -> Result<bool> {
        let video_off = !self.local.is_video_off;
        self.set_video_off(video_off)?;
        Ok(video_off)
    }

    pub fn set_video_off(&mut self, video_off: bool) -> Result<()> {
        let room_id = self.require_room()?;
        let camera = self
            .local
            .media
            .as_ref()
            .and_then(|m| m.camera.clone())
            .ok_or(Error::NoVideoTrack)?;

        camera.set_enabled(!video_off);
        self.local.is_video_off = video_off;
        self.broadcast(ClientEvent::ToggleVideo { room_id, video_off });
        self.publish();
        Ok(())
    }

    /// Turn an active audio call into a video call.
    ///
    /// The camera is acquired first; a device error leaves the audio call
    /// untouched. If the relay refuses the upgrade the camera is released
    /// again. Every connected peer gets the new track and one renegotiation.
    pub async fn upgrade_to_video(&mut self) -> Result<()> {
        self.expect_state(CallState::Active, "active")?;
        let room_id = self.require_room()?;

        let has_camera = self.local.media.as_ref().map(|m| m.camera.is_some()).unwrap_or(false);
        if has_camera {
            debug!("Camera already live; nothing to upgrade");
            return Ok(());
        }

        let camera = self.media_source.acquire_camera().await?;

        if let Err(e) = self
            .relay
            .request(ClientEvent::UpgradeType {
                room_id,
                call_type: CallType::Video,
            })
            .await
        {
            warn!("Relay refused video upgrade: {}", e);
            camera.stop();
            return Err(e);
        }

        if self.local.state != CallState::Active {
            camera.stop();
            return Err(Error::NoActiveCall);
        }

        self.attach_camera(camera).await;
        info!("Upgraded call to video");
        self.publish();
        Ok(())
    }

    /// Another member upgraded the call: bring our own camera up as well.
    ///
    /// Without a camera this side stays audio-only and keeps receiving video.
    pub(super) async fn follow_video_upgrade(&mut self, upgraded_by: &str) {
        if self.local.state != CallState::Active {
            return;
        }
        let has_camera = self.local.media.as_ref().map(|m| m.camera.is_some()).unwrap_or(false);
        if has_camera {
            return;
        }

        let camera = match self.media_source.acquire_camera().await {
            Ok(camera) => camera,
            Err(e) => {
                warn!("Staying audio-only after {} upgraded: {}", upgraded_by, e);
                return;
            }
        };

        self.attach_camera(camera).await;
        if let Some(room_id) = self.room_id() {
            self.broadcast(ClientEvent::ToggleVideo {
                room_id,
                video_off: false,
            });
        }
        info!("Camera on after {} upgraded the call", upgraded_by);
    }

    /// Make the camera part of the call and offer it to every peer.
    async fn attach_camera(&mut self, camera: MediaTrack) {
        if let Some(media) = self.local.media.as_mut() {
            media.camera = Some(camera.clone());
        }
        self.local.call_type = CallType::Video;
        self.local.is_video_off = false;
        if let Some(call) = self.local.call.as_mut() {
            call.call_type = CallType::Video;
        }

        for (peer_id, transport) in self.peers.transports() {
            if let Err(e) = transport.add_track(&camera).await {
                warn!("Failed to add camera for {}: {}", peer_id, e);
                continue;
            }
            self.renegotiate(&peer_id).await;
        }
    }

    /// Replace the outgoing camera with a screen capture on every peer.
    ///
    /// Needs an existing video sender, so audio-only calls must be upgraded
    /// first.
    pub async fn start_screen_share(&mut self) -> Result<()> {
        self.expect_state(CallState::Active, "active")?;
        let room_id = self.require_room()?;
        if self.local.is_screen_sharing {
            return Ok(());
        }
        let has_camera = self.local.media.as_ref().map(|m| m.camera.is_some()).unwrap_or(false);
        if !has_camera {
            return Err(Error::NoVideoTrack);
        }

        let screen = self.media_source.acquire_screen().await?;

        for (peer_id, transport) in self.peers.transports() {
            if let Err(e) = transport.replace_video_track(Some(&screen)).await {
                warn!("Failed to share screen with {}: {}", peer_id, e);
            }
        }

        let tx = self.events_tx.clone();
        let track_id = screen.id().to_string();
        screen.on_ended(move || {
            let _ = tx.send(SessionEvent::ScreenShareEnded { track_id });
        });

        self.local.screen = Some(screen);
        self.local.is_screen_sharing = true;
        self.broadcast(ClientEvent::ScreenShare { room_id, sharing: true });
        info!("Screen sharing started");
        self.publish();
        Ok(())
    }

    /// Put the camera back on every peer. No-op when not sharing.
    pub async fn stop_screen_share(&mut self) -> Result<()> {
        let Some(screen) = self.local.screen.take() else {
            return Ok(());
        };

        let camera = self.local.media.as_ref().and_then(|m| m.camera.clone());
        for (peer_id, transport) in self.peers.transports() {
            if let Err(e) = transport.replace_video_track(camera.as_ref()).await {
                warn!("Failed to restore camera for {}: {}", peer_id, e);
            }
        }

        screen.stop();
        self.local.is_screen_sharing = false;
        if let Some(room_id) = self.room_id() {
            self.broadcast(ClientEvent::ScreenShare { room_id, sharing: false });
        }
        info!("Screen sharing stopped");
        self.publish();
        Ok(())
    }

    /// Media flag changes are best effort; the local change already applies.
    fn broadcast(&self, event: ClientEvent) {
        let name = event.name();
        if let Err(e) = self.relay.emit(event) {
            warn!("Failed to broadcast {}: {}", name, e);
        }
    }
}
