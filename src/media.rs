//! Local media: capture acquisition and the readiness gate
//!
//! The gate owns the local capture handle. Until it is ready the engine
//! never initiates negotiation; inbound offers wait in the pending queue.
//! A failed acquisition leaves the room in answer-only degradation: it is
//! reportable, not fatal, and is not retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::Result;

/// Media gate state, as surfaced in the room snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaState {
    /// Capture acquisition still in flight
    Pending,
    /// Local tracks available; negotiation may proceed
    Ready,
    /// Acquisition failed; this client answers but never initiates
    Failed(String),
}

/// The local capture handle: one audio and one video track sharing a
/// stream id, so remote ends group them into a single stream.
///
/// The tracks are passive sample sinks. Whatever pumps samples into them
/// runs outside the engine and consults the gate's mic/cam flags; a muted
/// track keeps flowing silence or black frames, never renegotiates.
#[derive(Clone)]
pub struct LocalMedia {
    /// Stream id shared by both tracks
    pub stream_id: String,

    /// Opus audio track
    pub audio: Arc<TrackLocalStaticSample>,

    /// VP8 video track
    pub video: Arc<TrackLocalStaticSample>,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field("audio", &self.audio.id())
            .field("video", &self.video.id())
            .finish()
    }
}

/// Capability call producing the local capture handle.
///
/// Called exactly once per room entry. Implementations live at the edge
/// of the system (devices, files, synthetic sources); the engine only
/// cares about the tracks it gets back.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Acquire the local audio+video tracks, or explain why not
    async fn acquire(&self) -> Result<LocalMedia>;
}

/// Capture source producing opus/VP8 sample tracks without touching real
/// devices. Used by the CLI and the integration tests; pair it with an
/// external sample pump when actual packets need to flow.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticCapture;

#[async_trait]
impl CaptureSource for SyntheticCapture {
    async fn acquire(&self) -> Result<LocalMedia> {
        let tag = Uuid::new_v4();
        let stream_id = format!("stream-{}", tag);

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            format!("audio-{}", tag),
            stream_id.clone(),
        ));

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("video-{}", tag),
            stream_id.clone(),
        ));

        Ok(LocalMedia {
            stream_id,
            audio,
            video,
        })
    }
}

/// Owns the local capture handle and gates outgoing negotiation on it
#[derive(Debug)]
pub struct MediaGate {
    state: MediaState,
    media: Option<LocalMedia>,
    mic_enabled: Arc<AtomicBool>,
    cam_enabled: Arc<AtomicBool>,
}

impl Default for MediaGate {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaGate {
    /// New gate: capture pending, mic and cam muted until explicitly
    /// enabled
    pub fn new() -> Self {
        Self {
            state: MediaState::Pending,
            media: None,
            mic_enabled: Arc::new(AtomicBool::new(false)),
            cam_enabled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current gate state
    pub fn state(&self) -> &MediaState {
        &self.state
    }

    /// Whether local tracks are available
    pub fn is_ready(&self) -> bool {
        self.state == MediaState::Ready
    }

    /// The capture handle, once ready
    pub fn media(&self) -> Option<&LocalMedia> {
        self.media.as_ref()
    }

    /// Record a successful acquisition. Only the first transition out of
    /// pending counts; later calls are ignored.
    pub fn set_ready(&mut self, media: LocalMedia) -> bool {
        if self.state != MediaState::Pending {
            tracing::debug!("Ignoring capture result, gate already {:?}", self.state);
            return false;
        }
        self.state = MediaState::Ready;
        self.media = Some(media);
        true
    }

    /// Record a failed acquisition. The gate stays not-ready for good.
    pub fn set_failed(&mut self, message: String) -> bool {
        if self.state != MediaState::Pending {
            tracing::debug!("Ignoring capture failure, gate already {:?}", self.state);
            return false;
        }
        self.state = MediaState::Failed(message);
        true
    }

    /// Release the capture handle on room exit
    pub fn release(&mut self) -> Option<LocalMedia> {
        self.media.take()
    }

    /// Flip the microphone flag
    pub fn set_mic(&self, enabled: bool) {
        self.mic_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flip the camera flag
    pub fn set_cam(&self, enabled: bool) {
        self.cam_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the microphone is live
    pub fn mic_enabled(&self) -> bool {
        self.mic_enabled.load(Ordering::SeqCst)
    }

    /// Whether the camera is live
    pub fn cam_enabled(&self) -> bool {
        self.cam_enabled.load(Ordering::SeqCst)
    }

    /// Shared mic flag for the external sample pump
    pub fn mic_flag(&self) -> Arc<AtomicBool> {
        self.mic_enabled.clone()
    }

    /// Shared cam flag for the external sample pump
    pub fn cam_flag(&self) -> Arc<AtomicBool> {
        self.cam_enabled.clone()
    }
}
