//! Reference drift policy
//!
//! The room server keeps one [`ReferenceClock`] per room and evaluates every
//! incoming position report against it. This module implements that
//! decision so that a server, a test harness or a single-process demo can
//! produce the same [`SyncCorrection`]s the client consumes.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;
use watchsync_signaling::SyncCorrection;

/// Authoritative playback position of a room
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceClock {
    /// Position at `updated_at`
    pub current_time_seconds: f64,
    /// Whether the room is playing
    pub is_playing: bool,
    /// When the position was last set
    pub updated_at: DateTime<Utc>,
}

impl ReferenceClock {
    /// Clock anchored at `position` as of `now`
    pub fn new(position: f64, is_playing: bool, now: DateTime<Utc>) -> Self {
        Self {
            current_time_seconds: position,
            is_playing,
            updated_at: now,
        }
    }

    /// Where a perfectly synchronized player would be at `now`
    pub fn expected_position(&self, now: DateTime<Utc>) -> f64 {
        if !self.is_playing {
            return self.current_time_seconds;
        }
        let elapsed = (now - self.updated_at)
            .to_std()
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0);
        self.current_time_seconds + elapsed
    }
}

/// Thresholds and rates used to turn drift into corrections
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftPolicy {
    /// Absolute drift at which the rate is adjusted
    pub rate_adjust_threshold: f64,
    /// Absolute drift at which the player is seeked instead
    pub seek_threshold: f64,
    /// Rate for a player that is behind
    pub catch_up_rate: f64,
    /// Rate for a player that is ahead
    pub slow_down_rate: f64,
}

impl Default for DriftPolicy {
    fn default() -> Self {
        Self {
            rate_adjust_threshold: 0.5,
            seek_threshold: 2.0,
            catch_up_rate: 1.05,
            slow_down_rate: 0.95,
        }
    }
}

impl DriftPolicy {
    /// Correction for a player at `reported` when it should be at `expected`
    pub fn evaluate(&self, reported: f64, expected: f64) -> Option<SyncCorrection> {
        let drift = reported - expected;
        if drift.abs() >= self.seek_threshold {
            Some(SyncCorrection::seek(expected.max(0.0)))
        } else if drift.abs() >= self.rate_adjust_threshold {
            let rate = if drift < 0.0 {
                self.catch_up_rate
            } else {
                self.slow_down_rate
            };
            Some(SyncCorrection::rate_adjust(expected.max(0.0), rate))
        } else {
            None
        }
    }
}

/// Per-participant drift evaluation with rate-reset tracking
#[derive(Debug, Default)]
pub struct DriftTracker {
    policy: DriftPolicy,
    adjusted: HashSet<String>,
}

impl DriftTracker {
    /// Tracker using `policy`
    pub fn new(policy: DriftPolicy) -> Self {
        Self {
            policy,
            adjusted: HashSet::new(),
        }
    }

    /// Policy in use
    pub fn policy(&self) -> &DriftPolicy {
        &self.policy
    }

    /// Evaluate one position report from `connection_id`
    ///
    /// Returns `RATE_RESET` once a rate-adjusted participant is back inside
    /// tolerance. Reports are ignored while the clock is paused.
    pub fn on_report(
        &mut self,
        connection_id: &str,
        reported: f64,
        clock: &ReferenceClock,
        now: DateTime<Utc>,
    ) -> Option<SyncCorrection> {
        if !clock.is_playing {
            debug!("Ignoring report from {}: room paused", connection_id);
            return None;
        }
        let expected = clock.expected_position(now);
        match self.policy.evaluate(reported, expected) {
            Some(correction) if correction.playback_rate != 1.0 => {
                self.adjusted.insert(connection_id.to_string());
                Some(correction)
            }
            Some(correction) => {
                self.adjusted.remove(connection_id);
                Some(correction)
            }
            None if self.adjusted.remove(connection_id) => Some(SyncCorrection::rate_reset()),
            None => None,
        }
    }

    /// Whether `connection_id` was last told to play at a corrected rate
    pub fn is_adjusted(&self, connection_id: &str) -> bool {
        self.adjusted.contains(connection_id)
    }

    /// Drop everything known about `connection_id`
    pub fn forget(&mut self, connection_id: &str) {
        self.adjusted.remove(connection_id);
    }
}
