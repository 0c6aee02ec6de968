//! Error types for watchsync

use thiserror::Error;

/// Main error type for watchsync operations
#[derive(Error, Debug)]
pub enum WatchSyncError {
    /// Initialization error
    #[error("Initialization failed: {reason}")]
    Initialization {
        /// Reason for initialization failure
        reason: String,
    },

    /// Missing configuration error
    #[error("Missing required configuration: {field}")]
    MissingConfiguration {
        /// Missing configuration field
        field: String,
    },

    /// Local camera/microphone could not be acquired
    #[error("Media access failed: {reason}")]
    MediaAccess {
        /// User-presentable reason
        reason: String,
    },

    /// An outbound media sample could not be written
    #[error("Failed to write sample to track {track_id}: {reason}")]
    SampleWrite {
        /// Local track ID
        track_id: String,
        /// Reason the write failed
        reason: String,
    },

    /// Offer/answer or description failure on a single peer link
    #[error("Negotiation with {connection_id} failed: {reason}")]
    Negotiation {
        /// Remote connection ID
        connection_id: String,
        /// Reason for negotiation failure
        reason: String,
    },

    /// A single ICE candidate could not be applied
    #[error("ICE candidate for {connection_id} rejected: {reason}")]
    IceApplication {
        /// Remote connection ID
        connection_id: String,
        /// Reason the candidate was rejected
        reason: String,
    },

    /// The transport of a peer link reported failure or closure
    #[error("Transport to {connection_id} closed")]
    TransportClosed {
        /// Remote connection ID
        connection_id: String,
    },

    /// Signaling channel error
    #[error("Signaling error: {reason}")]
    Signaling {
        /// Reason for signaling failure
        reason: String,
    },

    /// Invalid message format
    #[error("Invalid message format: {message}, error: {source}")]
    InvalidMessage {
        /// Invalid message content
        message: String,
        /// Parsing error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A sync correction directive violated its value constraints
    #[error("Invalid sync correction: {reason}")]
    InvalidCorrection {
        /// Violated constraint
        reason: String,
    },

    /// Invalid state error
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// An in-flight operation was superseded by `stop()`
    #[error("Operation cancelled: {operation}")]
    Cancelled {
        /// Operation that was cancelled
        operation: String,
    },
}

impl WatchSyncError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            WatchSyncError::Initialization { .. } => "INITIALIZATION_FAILED".to_string(),
            WatchSyncError::MissingConfiguration { .. } => "MISSING_CONFIGURATION".to_string(),
            WatchSyncError::MediaAccess { .. } => "MEDIA_ACCESS_ERROR".to_string(),
            WatchSyncError::SampleWrite { .. } => "SAMPLE_WRITE_ERROR".to_string(),
            WatchSyncError::Negotiation { .. } => "NEGOTIATION_ERROR".to_string(),
            WatchSyncError::IceApplication { .. } => "ICE_APPLICATION_ERROR".to_string(),
            WatchSyncError::TransportClosed { .. } => "TRANSPORT_CLOSED".to_string(),
            WatchSyncError::Signaling { .. } => "SIGNALING_ERROR".to_string(),
            WatchSyncError::InvalidMessage { .. } => "INVALID_MESSAGE".to_string(),
            WatchSyncError::InvalidCorrection { .. } => "INVALID_CORRECTION".to_string(),
            WatchSyncError::InvalidState { .. } => "INVALID_STATE".to_string(),
            WatchSyncError::Cancelled { .. } => "CANCELLED".to_string(),
        }
    }

    /// Whether the error is confined to one peer link and must not affect the rest of the mesh
    pub fn is_link_scoped(&self) -> bool {
        matches!(
            self,
            WatchSyncError::Negotiation { .. }
                | WatchSyncError::IceApplication { .. }
                | WatchSyncError::TransportClosed { .. }
        )
    }

    /// Remote connection ID the error is scoped to, if any
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            WatchSyncError::Negotiation { connection_id, .. }
            | WatchSyncError::IceApplication { connection_id, .. }
            | WatchSyncError::TransportClosed { connection_id } => Some(connection_id),
            _ => None,
        }
    }

    /// Shorthand for a negotiation failure on one link
    pub fn negotiation(connection_id: &str, reason: impl std::fmt::Display) -> Self {
        WatchSyncError::Negotiation {
            connection_id: connection_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let error = WatchSyncError::MediaAccess {
            reason: "Camera/microphone access denied: NotAllowedError".to_string(),
        };
        assert_eq!(error.error_code(), "MEDIA_ACCESS_ERROR");
        assert!(!error.is_link_scoped());
        assert!(error.connection_id().is_none());

        let error = WatchSyncError::negotiation("peer-b", "bad sdp");
        assert_eq!(error.error_code(), "NEGOTIATION_ERROR");
        assert!(error.is_link_scoped());
        assert_eq!(error.connection_id(), Some("peer-b"));
        assert_eq!(error.to_string(), "Negotiation with peer-b failed: bad sdp");
    }

    #[test]
    fn test_sample_write_is_not_link_scoped() {
        let error = WatchSyncError::SampleWrite {
            track_id: "cam".to_string(),
            reason: "track closed".to_string(),
        };
        assert_eq!(error.error_code(), "SAMPLE_WRITE_ERROR");
        assert!(!error.is_link_scoped());
        assert!(error.connection_id().is_none());
    }

    #[test]
    fn test_transport_closed_is_link_scoped() {
        let error = WatchSyncError::TransportClosed {
            connection_id: "peer-c".to_string(),
        };
        assert!(error.is_link_scoped());
        assert_eq!(error.error_code(), "TRANSPORT_CLOSED");
    }
}
