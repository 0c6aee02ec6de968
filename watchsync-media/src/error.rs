//! Error types for media acquisition

use thiserror::Error;
use watchsync_core::{TrackKind, WatchSyncError};

/// Errors raised while acquiring local camera/microphone tracks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused access
    #[error("Permission denied: {reason}")]
    PermissionDenied {
        /// Reason reported by the platform
        reason: String,
    },

    /// No capture device of the requested kind exists
    #[error("No {kind} device found")]
    DeviceNotFound {
        /// Requested track kind
        kind: TrackKind,
    },

    /// Device exists but is held by another process
    #[error("{kind} device busy: {reason}")]
    DeviceBusy {
        /// Requested track kind
        kind: TrackKind,
        /// Reason reported by the platform
        reason: String,
    },

    /// Nothing was requested
    #[error("Invalid constraints: {reason}")]
    InvalidConstraints {
        /// Description of the problem
        reason: String,
    },

    /// Any other capture failure
    #[error("Capture failed: {reason}")]
    CaptureFailed {
        /// Failure reason
        reason: String,
    },
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    /// Whether retrying later may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            MediaError::PermissionDenied { .. } => true,
            MediaError::DeviceBusy { .. } => true,
            MediaError::CaptureFailed { .. } => true,
            MediaError::DeviceNotFound { .. } => false,
            MediaError::InvalidConstraints { .. } => false,
        }
    }

    /// Get error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied { .. } => "PERMISSION_DENIED",
            MediaError::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
            MediaError::DeviceBusy { .. } => "DEVICE_BUSY",
            MediaError::InvalidConstraints { .. } => "INVALID_CONSTRAINTS",
            MediaError::CaptureFailed { .. } => "CAPTURE_FAILED",
        }
    }
}

impl From<MediaError> for WatchSyncError {
    fn from(error: MediaError) -> Self {
        WatchSyncError::MediaAccess {
            reason: format!("Camera/microphone access denied: {}", error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_keeps_platform_reason() {
        let error: WatchSyncError = MediaError::PermissionDenied {
            reason: "NotAllowedError".to_string(),
        }
        .into();
        assert_eq!(error.error_code(), "MEDIA_ACCESS_ERROR");
        assert_eq!(
            error.to_string(),
            "Media access failed: Camera/microphone access denied: Permission denied: NotAllowedError"
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(MediaError::DeviceBusy {
            kind: TrackKind::Video,
            reason: "in use".to_string()
        }
        .is_recoverable());
        assert!(!MediaError::DeviceNotFound {
            kind: TrackKind::Audio
        }
        .is_recoverable());
        assert_eq!(
            MediaError::DeviceNotFound {
                kind: TrackKind::Audio
            }
            .to_string(),
            "No audio device found"
        );
    }
}
