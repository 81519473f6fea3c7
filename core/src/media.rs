//! Local media handles and the remote stream sink.
//!
//! Capture and rendering are platform capabilities; the core only sees
//! [`LocalMediaSource`] (where tracks come from) and [`RemoteStreamSink`]
//! (where remote tracks go).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::models::CallType;

const STREAM_ID: &str = "huddle-local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

type EndedHook = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    ended: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
    on_ended: Mutex<Vec<EndedHook>>,
}

/// A local capture track. Clones share the same underlying track, so every
/// peer connection sees the same enabled flag and the same stop.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(source: TrackSource) -> Self {
        let id = format!("{:?}-{}", source, uuid::Uuid::new_v4()).to_lowercase();
        let capability = match source.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            STREAM_ID.to_owned(),
        ));

        Self {
            inner: Arc::new(TrackInner {
                id,
                source,
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
                rtc,
                on_ended: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Stop capture from our side. Ended hooks are dropped, not run.
    pub fn stop(&self) {
        self.inner.ended.store(true, Ordering::SeqCst);
        self.inner.on_ended.lock().clear();
    }

    /// The platform ended the track (e.g. the user pressed "stop sharing" in
    /// the OS picker). Runs the registered hooks once.
    pub fn end_from_platform(&self) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks: Vec<EndedHook> = std::mem::take(&mut *self.inner.on_ended.lock());
        for hook in hooks {
            hook();
        }
    }

    pub fn on_ended(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_ended() {
            return;
        }
        self.inner.on_ended.lock().push(Box::new(hook));
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtc)
    }

    /// Feed one encoded sample. Disabled or ended tracks drop it, which is
    /// how mute and camera-off work without renegotiation.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() || self.is_ended() {
            return Ok(());
        }
        self.inner.rtc.write_sample(sample).await?;
        Ok(())
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// The local media handle shared by every peer connection of a call.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    pub audio: Option<MediaTrack>,
    pub camera: Option<MediaTrack>,
}

impl LocalMedia {
    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.audio.iter().chain(self.camera.iter()).cloned().collect()
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// Where local tracks come from (camera, microphone, screen capture).
#[async_trait]
pub trait LocalMediaSource: Send + Sync {
    /// Microphone, plus camera for video calls.
    async fn acquire(&self, call_type: CallType) -> Result<LocalMedia>;

    async fn acquire_camera(&self) -> Result<MediaTrack>;

    async fn acquire_screen(&self) -> Result<MediaTrack>;
}

// ============================================================================
// Remote side
// ============================================================================

#[derive(Clone)]
pub struct RemoteTrack {
    pub track_id: String,
    pub kind: TrackKind,
    pub rtc: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Receives remote tracks keyed by remote user id. Each key is written only
/// by that user's peer connection.
pub trait RemoteStreamSink: Send + Sync {
    fn publish(&self, user_id: &str, track: RemoteTrack);
    fn remove(&self, user_id: &str);
}

/// In-memory sink; renderers poll it by user id.
#[derive(Default)]
pub struct RemoteStreams {
    streams: RwLock<HashMap<String, Vec<RemoteTrack>>>,
}

impl RemoteStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracks_for(&self, user_id: &str) -> Vec<RemoteTrack> {
        self.streams.read().get(user_id).cloned().unwrap_or_default()
    }

    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}

impl RemoteStreamSink for RemoteStreams {
    fn publish(&self, user_id: &str, track: RemoteTrack) {
        let mut streams = self.streams.write();
        let tracks = streams.entry(user_id.to_string()).or_default();
        tracks.retain(|t| t.track_id != track.track_id);
        tracks.push(track);
    }

    fn remove(&self, user_id: &str) {
        self.streams.write().remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_clones_share_enabled_flag() {
        let track = MediaTrack::new(TrackSource::Microphone);
        let shared = track.clone();

        shared.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(track.same_track(&shared));
        assert_eq!(track.kind(), TrackKind::Audio);
    }

    #[test]
    fn test_platform_end_runs_hooks_once() {
        let track = MediaTrack::new(TrackSource::Screen);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        track.on_ended(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        track.end_from_platform();
        track.end_from_platform();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_local_stop_skips_hooks() {
        let track = MediaTrack::new(TrackSource::Screen);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        track.on_ended(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        track.stop();
        track.end_from_platform();
        assert!(track.is_ended());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remote_streams_keyed_by_user() {
        let sink = RemoteStreams::new();
        let track = RemoteTrack {
            track_id: "t1".into(),
            kind: TrackKind::Audio,
            rtc: None,
        };
        sink.publish("bob", track.clone());
        sink.publish("bob", track);
        sink.publish(
            "carol",
            RemoteTrack {
                track_id: "t2".into(),
                kind: TrackKind::Video,
                rtc: None,
            },
        );

        assert_eq!(sink.tracks_for("bob").len(), 1);
        sink.remove("bob");
        assert_eq!(sink.user_ids(), vec!["carol".to_string()]);
    }
}
