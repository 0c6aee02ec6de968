//! Shared outbound tracks
//!
//! Every captured [`LocalTrack`] maps to exactly one `TrackLocalStaticSample`,
//! which is added to every peer connection of the mesh. Writing a sample once
//! delivers it to all bound connections.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use watchsync_core::{LocalTrack, TrackKind, WatchSyncError};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Outbound track shared by every peer connection
pub struct FanoutTrack {
    source: Arc<LocalTrack>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl fmt::Debug for FanoutTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutTrack")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl FanoutTrack {
    fn new(source: Arc<LocalTrack>, stream_id: &str) -> Self {
        let capability = match source.kind() {
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            source.id().to_string(),
            stream_id.to_string(),
        ));
        Self { source, rtc }
    }

    /// The captured track this one mirrors
    pub fn source(&self) -> &Arc<LocalTrack> {
        &self.source
    }

    /// The WebRTC track added to peer connections
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Send one encoded frame to every bound connection
    ///
    /// Returns `Ok(false)` when the source is disabled or stopped and the
    /// frame was dropped.
    pub async fn write_sample(
        &self,
        data: Bytes,
        duration: Duration,
    ) -> Result<bool, WatchSyncError> {
        if !self.source.is_enabled() {
            return Ok(false);
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.rtc
            .write_sample(&sample)
            .await
            .map_err(|e| WatchSyncError::SampleWrite {
                track_id: self.source.id().to_string(),
                reason: e.to_string(),
            })?;
        Ok(true)
    }
}

/// Registry of shared tracks, keyed by local track ID
#[derive(Debug, Clone, Default)]
pub struct TrackFanout {
    tracks: Arc<Mutex<HashMap<String, Arc<FanoutTrack>>>>,
}

impl TrackFanout {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared track for `source`, created on first use
    ///
    /// A stopped source is replaced by a fresh track the next time media is
    /// acquired under the same ID.
    pub fn track_for(&self, source: &Arc<LocalTrack>, stream_id: &str) -> Arc<FanoutTrack> {
        let mut tracks = self.tracks.lock();
        if let Some(existing) = tracks.get(source.id()) {
            if Arc::ptr_eq(&existing.source, source) {
                return existing.clone();
            }
        }
        debug!("Creating shared {} track {}", source.kind(), source.id());
        let track = Arc::new(FanoutTrack::new(source.clone(), stream_id));
        tracks.insert(source.id().to_string(), track.clone());
        track
    }

    /// Shared track registered under `track_id`
    pub fn get(&self, track_id: &str) -> Option<Arc<FanoutTrack>> {
        self.tracks.lock().get(track_id).cloned()
    }

    /// Number of registered tracks
    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    /// Whether no track is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget tracks whose source has been stopped
    pub fn prune(&self) {
        self.tracks.lock().retain(|_, track| !track.source.is_ended());
    }
}
