//! # watchsync media
//!
//! Local camera/microphone acquisition. The track handles themselves live in
//! `watchsync-core` so that transports can attach them; they are re-exported
//! here for convenience.

#![warn(clippy::all)]

pub mod capture;
pub mod error;

// Re-export main types
pub use capture::{MediaCapture, MediaConstraints, VirtualCapture};
pub use error::{MediaError, MediaResult};
pub use watchsync_core::{LocalMedia, LocalTrack, RemoteTrackInfo, TrackKind};
