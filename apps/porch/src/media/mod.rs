use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use webrtc::track::track_remote::TrackRemote;

use crate::protocol::{CandidateBlob, SessionDescriptor};

pub mod mock;
pub mod rtc;

pub use mock::MockMediaStack;
pub use rtc::{RtcConfig, RtcMediaStack};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media capability unavailable: {0}")]
    CapabilityUnavailable(String),
    #[error("no media capability could be acquired")]
    AcquisitionExhausted,
    #[error("media negotiation failed: {0}")]
    Negotiation(String),
}

/// What the caller would like to capture locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };

    pub const fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub const fn video_only() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            audio: false,
            video: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

/// What was actually acquired. Shared read-only across every peer negotiation
/// in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMedia {
    pub audio: bool,
    pub video: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Handle to a remote participant's media, surfaced to the UI layer once
/// negotiation produces a live track.
#[derive(Clone)]
pub struct MediaStreamHandle {
    pub peer: String,
    pub kind: MediaKind,
    track: Option<Arc<TrackRemote>>,
}

impl MediaStreamHandle {
    pub fn rtc(peer: impl Into<String>, kind: MediaKind, track: Arc<TrackRemote>) -> Self {
        Self {
            peer: peer.into(),
            kind,
            track: Some(track),
        }
    }

    pub fn synthetic(peer: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            peer: peer.into(),
            kind,
            track: None,
        }
    }

    pub fn track(&self) -> Option<&Arc<TrackRemote>> {
        self.track.as_ref()
    }
}

impl fmt::Debug for MediaStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStreamHandle")
            .field("peer", &self.peer)
            .field("kind", &self.kind)
            .field("has_track", &self.track.is_some())
            .finish()
    }
}

/// Events the media stack pushes back into the negotiation engine.
#[derive(Debug)]
pub enum MediaEvent {
    /// A locally gathered network-path candidate that must be relayed to the
    /// peer (trickle).
    LocalCandidate {
        peer: String,
        candidate: CandidateBlob,
    },
    RemoteTrack {
        peer: String,
        stream: MediaStreamHandle,
    },
    /// The stack observed a live path to the peer. This is what moves a
    /// responder from ANSWER_SENT to CONNECTED.
    PeerConnected { peer: String },
    PeerFailed { peer: String, reason: String },
}

/// The external media stack the negotiation core drives. Descriptors and
/// candidates are opaque blobs here; capture and codecs live behind this
/// seam.
#[async_trait]
pub trait MediaStack: Send + Sync {
    async fn acquire_local(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;

    async fn create_offer(&self, peer: &str) -> Result<SessionDescriptor, MediaError>;

    /// Produce a local answer. Only valid after the peer's remote offer has
    /// been applied.
    async fn create_answer(&self, peer: &str) -> Result<SessionDescriptor, MediaError>;

    async fn apply_remote_descriptor(
        &self,
        peer: &str,
        descriptor: SessionDescriptor,
    ) -> Result<(), MediaError>;

    async fn apply_remote_candidate(
        &self,
        peer: &str,
        candidate: CandidateBlob,
    ) -> Result<(), MediaError>;

    /// Release per-peer resources. The shared local capture stays alive.
    async fn drop_peer(&self, peer: &str);
}

/// Capture acquisition ladder: audio+video, then audio only, then video only.
/// A partial grant degrades gracefully; only total failure errors.
pub async fn acquire_with_fallback(
    stack: &dyn MediaStack,
    want: MediaConstraints,
) -> Result<LocalMedia, MediaError> {
    if want.is_empty() {
        return Ok(LocalMedia {
            audio: false,
            video: false,
        });
    }

    let mut attempts = Vec::new();
    if want.audio && want.video {
        attempts.push(MediaConstraints::AUDIO_VIDEO);
    }
    if want.audio {
        attempts.push(MediaConstraints::audio_only());
    }
    if want.video {
        attempts.push(MediaConstraints::video_only());
    }

    for constraints in attempts {
        match stack.acquire_local(constraints).await {
            Ok(local) => {
                tracing::debug!(
                    target = "porch::media",
                    audio = local.audio,
                    video = local.video,
                    "local media acquired"
                );
                return Ok(local);
            }
            Err(err) => {
                tracing::debug!(
                    target = "porch::media",
                    audio = constraints.audio,
                    video = constraints.video,
                    error = %err,
                    "capture attempt failed"
                );
            }
        }
    }
    Err(MediaError::AcquisitionExhausted)
}
