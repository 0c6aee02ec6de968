//! Configuration types and defaults

use serde::{Deserialize, Serialize};
use std::time::Duration;
use watchsync_media::MediaConstraints;
use watchsync_signaling::ReconnectPolicy;

/// Largest mesh the coordinator will form, including the local participant
pub const MAX_MESH_PARTICIPANTS: usize = 6;

/// Peer mesh configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Largest mesh, including the local participant; capped at
    /// [`MAX_MESH_PARTICIPANTS`]
    pub max_participants: usize,
    /// STUN/TURN server URLs handed to every peer transport
    pub ice_servers: Vec<String>,
    /// Tracks requested when local media starts
    pub media: MediaConstraints,
    /// Per-peer cap on candidates buffered before a remote description exists
    pub max_buffered_candidates: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_participants: MAX_MESH_PARTICIPANTS,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            media: MediaConstraints::default(),
            max_buffered_candidates: 64,
        }
    }
}

impl MeshConfig {
    /// Largest number of direct links to remote participants
    pub fn max_remote_links(&self) -> usize {
        self.max_participants
            .min(MAX_MESH_PARTICIPANTS)
            .saturating_sub(1)
    }
}

/// Playback sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Cadence of position reports while playing
    pub report_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(5),
        }
    }
}

/// Room session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Room code
    pub room_code: String,
    /// Own connection ID, assigned by the signaling server
    pub connection_id: String,
    /// Signaling server URL
    pub signaling_url: Option<String>,
    /// Signaling reconnection behaviour
    pub reconnect: ReconnectPolicy,
    /// Peer mesh settings
    pub mesh: MeshConfig,
    /// Playback sync settings
    pub sync: SyncConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.max_participants, 6);
        assert_eq!(config.max_remote_links(), 5);
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.media.video && config.media.audio);
    }

    #[test]
    fn test_degenerate_mesh_size() {
        let config = MeshConfig {
            max_participants: 0,
            ..MeshConfig::default()
        };
        assert_eq!(config.max_remote_links(), 0);
    }

    #[test]
    fn test_mesh_size_is_capped() {
        let config = MeshConfig {
            max_participants: 9,
            ..MeshConfig::default()
        };
        assert_eq!(config.max_remote_links(), 5);
    }

    #[test]
    fn test_sync_defaults() {
        assert_eq!(SyncConfig::default().report_interval, Duration::from_secs(5));
    }
}
