//! Roster helpers, camera-state tracking and the aggregated remote-stream view

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use watchsync_core::RemoteTrackInfo;
use watchsync_signaling::{CameraStateMessage, ParticipantRecord};

/// Nickname shown for peers missing from the roster
pub const UNKNOWN_NICKNAME: &str = "Unknown";

/// Look up a participant by connection ID
pub fn find_participant<'a>(
    roster: &'a [ParticipantRecord],
    connection_id: &str,
) -> Option<&'a ParticipantRecord> {
    roster.iter().find(|p| p.connection_id == connection_id)
}

/// Participants currently broadcasting camera/microphone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CameraStateMap {
    states: HashMap<String, bool>,
}

impl CameraStateMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an announcement, returning whether the map changed
    pub fn apply(&mut self, message: &CameraStateMessage) -> bool {
        if message.enabled {
            self.states
                .insert(message.connection_id.clone(), true)
                .is_none()
        } else {
            self.states.remove(&message.connection_id).is_some()
        }
    }

    /// Drop entries for participants no longer in the roster
    pub fn retain_present(&mut self, roster: &[ParticipantRecord]) -> bool {
        let before = self.states.len();
        self.states
            .retain(|id, _| find_participant(roster, id).is_some());
        self.states.len() != before
    }

    /// Whether the participant is broadcasting
    pub fn is_broadcasting(&self, connection_id: &str) -> bool {
        self.states.get(connection_id).copied().unwrap_or(false)
    }

    /// Number of broadcasting participants
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether nobody is broadcasting
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// One renderable remote participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    /// Remote connection ID
    pub connection_id: String,
    /// Display name
    pub nickname: String,
    /// Tracks received so far
    pub tracks: Vec<RemoteTrackInfo>,
}
