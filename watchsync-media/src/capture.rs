//! Camera/microphone acquisition
//!
//! [`MediaCapture`] is the seam between the mesh coordinator and whatever
//! actually owns the devices. [`VirtualCapture`] produces device-less tracks
//! and can be scripted to fail or stall, which is what tests and headless
//! clients use.

use crate::error::{MediaError, MediaResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;
use watchsync_core::{LocalMedia, LocalTrack, TrackKind};

/// Which tracks to request from the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Request a camera track
    pub video: bool,
    /// Request a microphone track
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

impl MediaConstraints {
    /// Whether any track is requested
    pub fn is_empty(&self) -> bool {
        !self.video && !self.audio
    }
}

/// Source of local camera/microphone tracks
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Acquire tracks satisfying `constraints`
    async fn acquire(&self, constraints: &MediaConstraints) -> MediaResult<LocalMedia>;
}

#[derive(Debug, Default)]
struct VirtualCaptureState {
    scripted_failures: VecDeque<MediaError>,
    acquisitions: usize,
    /// Streams handed out whose tracks are not all stopped yet
    outstanding: Vec<LocalMedia>,
}

impl VirtualCaptureState {
    fn forget_stopped(&mut self) {
        self.outstanding
            .retain(|media| media.tracks().iter().any(|track| !track.is_ended()));
    }
}

/// Device-less capture producing virtual tracks
#[derive(Debug, Clone, Default)]
pub struct VirtualCapture {
    state: Arc<Mutex<VirtualCaptureState>>,
    delay: Option<Duration>,
}

impl VirtualCapture {
    /// Capture that always succeeds immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait `delay` before every acquisition completes
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next acquisition fail with `error`
    pub fn fail_next(&self, error: MediaError) {
        self.state.lock().scripted_failures.push_back(error);
    }

    /// Number of successful acquisitions so far
    pub fn acquisition_count(&self) -> usize {
        self.state.lock().acquisitions
    }

    /// Number of acquired streams with at least one live track
    pub fn live_stream_count(&self) -> usize {
        let mut state = self.state.lock();
        state.forget_stopped();
        state.outstanding.len()
    }
}

#[async_trait]
impl MediaCapture for VirtualCapture {
    async fn acquire(&self, constraints: &MediaConstraints) -> MediaResult<LocalMedia> {
        if constraints.is_empty() {
            return Err(MediaError::InvalidConstraints {
                reason: "neither video nor audio requested".to_string(),
            });
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.state.lock().scripted_failures.pop_front() {
            debug!("Virtual capture failing as scripted: {}", error);
            return Err(error);
        }

        let stream_id = Uuid::new_v4().to_string();
        let video = constraints
            .video
            .then(|| Arc::new(LocalTrack::new(Uuid::new_v4().to_string(), TrackKind::Video)));
        let audio = constraints
            .audio
            .then(|| Arc::new(LocalTrack::new(Uuid::new_v4().to_string(), TrackKind::Audio)));
        let media = LocalMedia::new(stream_id, video, audio);

        info!(
            "Acquired virtual media stream {} ({} tracks)",
            media.stream_id(),
            media.tracks().len()
        );
        let mut state = self.state.lock();
        state.forget_stopped();
        state.acquisitions += 1;
        state.outstanding.push(media.clone());
        Ok(media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_constraints_are_rejected() {
        let capture = VirtualCapture::new();
        let result = capture
            .acquire(&MediaConstraints {
                video: false,
                audio: false,
            })
            .await;
        assert!(matches!(result, Err(MediaError::InvalidConstraints { .. })));
        assert_eq!(capture.acquisition_count(), 0);
    }

    #[tokio::test]
    async fn test_stopped_streams_are_forgotten() {
        let capture = VirtualCapture::new();
        for _ in 0..10 {
            let media = capture.acquire(&MediaConstraints::default()).await.unwrap();
            media.stop();
        }
        let live = capture.acquire(&MediaConstraints::default()).await.unwrap();

        assert_eq!(capture.acquisition_count(), 11);
        assert_eq!(capture.live_stream_count(), 1);
        assert_eq!(capture.state.lock().outstanding.len(), 1);

        live.stop();
        assert_eq!(capture.live_stream_count(), 0);
    }
}
