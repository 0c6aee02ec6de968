//! Local and remote media track handles
//!
//! A [`LocalMedia`] is acquired once and fanned out read-only to every
//! outbound peer link. Enabling or disabling a track flips a shared flag that
//! every attached link observes, so mute and camera-off never renegotiate.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Camera video
    Video,
    /// Microphone audio
    Audio,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// A single captured track shared by every outbound link
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl LocalTrack {
    /// Create an enabled, live track
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        }
    }

    /// Track ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Whether samples from this track should currently be sent
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && !self.is_ended()
    }

    /// Set the enabled flag, returning the new value
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.store(enabled, Ordering::Release);
        enabled
    }

    /// Flip the enabled flag, returning the new value
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::AcqRel)
    }

    /// Whether the track has been released
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Release the track; it never produces samples again
    pub fn stop(&self) {
        self.ended.store(true, Ordering::Release);
    }
}

/// Handle to the local camera/microphone stream
#[derive(Debug, Clone)]
pub struct LocalMedia {
    stream_id: String,
    video: Option<Arc<LocalTrack>>,
    audio: Option<Arc<LocalTrack>>,
}

impl LocalMedia {
    /// Assemble a stream from its tracks
    pub fn new(
        stream_id: impl Into<String>,
        video: Option<Arc<LocalTrack>>,
        audio: Option<Arc<LocalTrack>>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            video,
            audio,
        }
    }

    /// Stream ID shared by all tracks of this stream
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Camera track, if captured
    pub fn video(&self) -> Option<&Arc<LocalTrack>> {
        self.video.as_ref()
    }

    /// Microphone track, if captured
    pub fn audio(&self) -> Option<&Arc<LocalTrack>> {
        self.audio.as_ref()
    }

    /// Track of the given kind, if captured
    pub fn track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        match kind {
            TrackKind::Video => self.video(),
            TrackKind::Audio => self.audio(),
        }
    }

    /// All captured tracks, video first
    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.video.iter().chain(self.audio.iter()).cloned().collect()
    }

    /// Release every track
    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// Description of a track received from a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    /// Track ID as announced by the remote side
    pub track_id: String,
    /// Track kind
    pub kind: TrackKind,
    /// Remote stream the track belongs to
    pub stream_id: String,
}
