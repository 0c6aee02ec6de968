//! Client side of the playback sync protocol

use super::reporter::PositionReporter;
use crate::config::SyncConfig;
use crate::event::{Event, EventEmitter};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use watchsync_core::WatchSyncError;
use watchsync_signaling::{CorrectionType, RoomPlaybackState, SignalingSink, SyncCorrection};

/// The local video player, as far as drift correction is concerned
pub trait PlayerControl: Send + Sync {
    /// Set the playback rate (1.0 is normal speed)
    fn set_playback_rate(&self, rate: f64);

    /// Seek to an absolute position in seconds
    fn seek_to(&self, seconds: f64);

    /// Current position in seconds
    fn current_time(&self) -> f64;
}

/// Correction state of the local player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Normal speed, no correction pending
    Normal,
    /// Playing at a corrected rate to re-converge
    RateAdjusted,
    /// Absolute seek in progress
    Seeking,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Normal => write!(f, "NORMAL"),
            SyncState::RateAdjusted => write!(f, "RATE_ADJUSTED"),
            SyncState::Seeking => write!(f, "SEEKING"),
        }
    }
}

/// What the handler last asked the player to do
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackTarget {
    /// Requested playback rate
    pub rate: f64,
    /// Last absolute seek target, if any
    pub position: Option<f64>,
}

impl Default for PlaybackTarget {
    fn default() -> Self {
        Self {
            rate: 1.0,
            position: None,
        }
    }
}

struct HandlerState {
    sync_state: SyncState,
    target: PlaybackTarget,
    /// Play/pause intent not yet confirmed by the room
    local_override: Option<bool>,
    room_state: Option<RoomPlaybackState>,
    reporter: Option<PositionReporter>,
}

/// Applies server corrections to the local player and reports its position
///
/// Position reports run on a Tokio runtime: the one passed to
/// [`SyncCorrectionHandler::with_runtime`], else the one the handler was
/// created on, else the one current when reporting starts. Without any of
/// them play/pause is still tracked but no reports are sent.
pub struct SyncCorrectionHandler {
    config: SyncConfig,
    runtime: Option<Handle>,
    player: Arc<dyn PlayerControl>,
    signaling: Arc<dyn SignalingSink>,
    events: EventEmitter,
    state: Mutex<HandlerState>,
}

impl SyncCorrectionHandler {
    /// Create a handler in the `Normal` state with reporting stopped
    pub fn new(
        config: SyncConfig,
        player: Arc<dyn PlayerControl>,
        signaling: Arc<dyn SignalingSink>,
        events: EventEmitter,
    ) -> Self {
        Self {
            config,
            runtime: Handle::try_current().ok(),
            player,
            signaling,
            events,
            state: Mutex::new(HandlerState {
                sync_state: SyncState::Normal,
                target: PlaybackTarget::default(),
                local_override: None,
                room_state: None,
                reporter: None,
            }),
        }
    }

    /// Run position reports on `runtime`
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Apply one correction directive, returning the resulting state
    ///
    /// Directives violating their value constraints are rejected without
    /// touching the player.
    pub fn apply_correction(&self, correction: &SyncCorrection) -> Result<SyncState, WatchSyncError> {
        correction.validate()?;
        let resulting = {
            let mut state = self.state.lock();
            match correction.correction_type {
                CorrectionType::RateAdjust => {
                    self.player.set_playback_rate(correction.playback_rate);
                    state.target.rate = correction.playback_rate;
                    state.sync_state = SyncState::RateAdjusted;
                }
                CorrectionType::Seek => {
                    state.sync_state = SyncState::Seeking;
                    self.player.set_playback_rate(1.0);
                    self.player.seek_to(correction.target_time_seconds);
                    state.target = PlaybackTarget {
                        rate: 1.0,
                        position: Some(correction.target_time_seconds),
                    };
                    state.sync_state = SyncState::Normal;
                }
                CorrectionType::RateReset => {
                    self.player.set_playback_rate(1.0);
                    state.target.rate = 1.0;
                    state.sync_state = SyncState::Normal;
                }
            }
            state.sync_state
        };

        info!(
            "Applied {} correction (target {:.3}s, rate {}), now {}",
            correction.correction_type,
            correction.target_time_seconds,
            correction.playback_rate,
            resulting
        );
        self.events.emit(Event::CorrectionApplied {
            correction_type: correction.correction_type,
            state: resulting,
        });
        Ok(resulting)
    }

    /// The user pressed play; reflect it before the room confirms
    pub fn on_local_play(&self) {
        let mut state = self.state.lock();
        state.local_override = Some(true);
        self.start_reporting(&mut state);
    }

    /// The user pressed pause; reflect it before the room confirms
    pub fn on_local_pause(&self) {
        let mut state = self.state.lock();
        state.local_override = Some(false);
        self.stop_reporting(&mut state);
    }

    /// Adopt the room's authoritative playback state
    ///
    /// Clears any local play/pause override and starts or stops reporting to
    /// follow the room.
    pub fn apply_room_state(&self, room_state: RoomPlaybackState) {
        let mut state = self.state.lock();
        if state.local_override.take().is_some() {
            debug!("Authoritative room state arrived; clearing local override");
        }
        let playing = room_state.is_playing;
        state.room_state = Some(room_state);
        if playing {
            self.start_reporting(&mut state);
        } else {
            self.stop_reporting(&mut state);
        }
    }

    /// Stop reporting and return the player to normal speed
    pub fn leave(&self) {
        let mut state = self.state.lock();
        state.local_override = None;
        self.stop_reporting(&mut state);
    }

    /// Current correction state
    pub fn sync_state(&self) -> SyncState {
        self.state.lock().sync_state
    }

    /// What the player was last asked to do
    pub fn target(&self) -> PlaybackTarget {
        self.state.lock().target
    }

    /// Local play/pause intent awaiting confirmation
    pub fn local_override(&self) -> Option<bool> {
        self.state.lock().local_override
    }

    /// Effective playing flag: local override first, then the room
    pub fn is_playing(&self) -> bool {
        let state = self.state.lock();
        state
            .local_override
            .or_else(|| state.room_state.as_ref().map(|room| room.is_playing))
            .unwrap_or(false)
    }

    /// Last authoritative room state
    pub fn room_state(&self) -> Option<RoomPlaybackState> {
        self.state.lock().room_state.clone()
    }

    /// Whether position reports are being sent
    pub fn is_reporting(&self) -> bool {
        self.state
            .lock()
            .reporter
            .as_ref()
            .is_some_and(PositionReporter::is_running)
    }

    fn start_reporting(&self, state: &mut HandlerState) {
        if state.reporter.is_some() {
            return;
        }
        let Some(runtime) = self
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            warn!("No Tokio runtime available; position reports disabled");
            return;
        };
        info!(
            "Starting position reports every {:?}",
            self.config.report_interval
        );
        state.reporter = Some(PositionReporter::start(
            &runtime,
            self.player.clone(),
            self.signaling.clone(),
            self.config.report_interval,
        ));
        self.events.emit(Event::ReportingStarted);
    }

    fn stop_reporting(&self, state: &mut HandlerState) {
        if let Some(mut reporter) = state.reporter.take() {
            reporter.stop();
            info!("Stopped position reports");
            self.events.emit(Event::ReportingStopped);
        }
        self.player.set_playback_rate(1.0);
        state.target.rate = 1.0;
        state.sync_state = SyncState::Normal;
    }
}
