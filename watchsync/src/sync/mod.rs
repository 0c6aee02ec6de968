//! Playback position synchronization
//!
//! [`SyncCorrectionHandler`] applies server-issued corrections to the local
//! player and reports the local position while playing. [`drift`] holds the
//! reference policy that decides which correction a report deserves.

pub mod drift;
mod handler;
mod reporter;

pub use drift::{DriftPolicy, DriftTracker, ReferenceClock};
pub use handler::{PlaybackTarget, PlayerControl, SyncCorrectionHandler, SyncState};
pub use reporter::PositionReporter;

#[cfg(test)]
pub(crate) mod tests {
    use super::PlayerControl;
    use parking_lot::Mutex;

    /// Player frozen at one position
    pub(crate) struct FixedPlayer(f64);

    impl FixedPlayer {
        pub(crate) fn at(position: f64) -> Self {
            Self(position)
        }
    }

    impl PlayerControl for FixedPlayer {
        fn set_playback_rate(&self, _rate: f64) {}
        fn seek_to(&self, _seconds: f64) {}
        fn current_time(&self) -> f64 {
            self.0
        }
    }

    /// Player recording every call
    #[derive(Default)]
    pub(crate) struct RecordingPlayer {
        rates: Mutex<Vec<f64>>,
        seeks: Mutex<Vec<f64>>,
    }

    impl RecordingPlayer {
        pub(crate) fn rates(&self) -> Vec<f64> {
            self.rates.lock().clone()
        }

        pub(crate) fn seeks(&self) -> Vec<f64> {
            self.seeks.lock().clone()
        }
    }

    impl PlayerControl for RecordingPlayer {
        fn set_playback_rate(&self, rate: f64) {
            self.rates.lock().push(rate);
        }

        fn seek_to(&self, seconds: f64) {
            self.seeks.lock().push(seconds);
        }

        fn current_time(&self) -> f64 {
            self.seeks.lock().last().copied().unwrap_or(0.0)
        }
    }
}
