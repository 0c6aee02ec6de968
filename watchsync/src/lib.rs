//! # watchsync
//!
//! Real-time consistency for watch parties: a full-mesh camera/microphone
//! coordinator for up to six participants and a drift-correcting playback
//! sync handler, both driven by a room's signaling channel.
//!
//! ## Key Features
//!
//! - **Full mesh**: one direct link per remote participant, reconciled against
//!   every roster delivery, with deterministic glare resolution
//! - **Ordered ICE**: remote candidates are buffered until their description
//!   is applied and flushed exactly once, in arrival order
//! - **Drift correction**: rate adjustments, seeks and rate resets applied to
//!   the local player, with position reports every five seconds while playing
//! - **Pluggable collaborators**: peer transports, media capture, signaling
//!   and the player are traits
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use watchsync::{PlayerControl, SessionBuilder, VirtualCapture};
//! # use watchsync::PeerConnector;
//!
//! struct Player;
//!
//! impl PlayerControl for Player {
//!     fn set_playback_rate(&self, _rate: f64) {}
//!     fn seek_to(&self, _seconds: f64) {}
//!     fn current_time(&self) -> f64 { 0.0 }
//! }
//!
//! # async fn example(connector: Arc<dyn PeerConnector>) -> Result<(), watchsync::WatchSyncError> {
//! watchsync::init_logging()?;
//!
//! let (session, streams) = SessionBuilder::new("movie-night")
//!     .signaling_url("ws://localhost:8080/ws")
//!     .connector(connector)
//!     .capture(Arc::new(VirtualCapture::new()))
//!     .player(Arc::new(Player))
//!     .connect()
//!     .await?;
//!
//! session.mesh().start().await?;
//! session.run(streams.inbound, streams.transport_events).await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export collaborator types for easy access
pub use watchsync_core::{
    IceCandidate, LinkConnectionState, LinkEventSender, LocalMedia, LocalTrack, PeerConnector,
    PeerTransport, RemoteTrackInfo, SdpKind, TrackKind, TransportEvent, TransportEventKind,
    WatchSyncError,
};
pub use watchsync_media::{MediaCapture, MediaConstraints, MediaError, VirtualCapture};
pub use watchsync_signaling::{
    CameraStateMessage, ChannelSink, CorrectionType, InboundMessage, OutboundMessage,
    ParticipantRecord, PositionReport, ReconnectPolicy, RoomPlaybackState, SignalEnvelope,
    SignalType, SignalingClient, SignalingSink, SyncCorrection, Welcome,
};

// Public API modules
pub mod config;
pub mod event;
pub mod logging;
pub mod mesh;
pub mod participant;
pub mod session;
pub mod sync;

// Re-export main API types
pub use config::{MeshConfig, SessionConfig, SyncConfig, MAX_MESH_PARTICIPANTS};
pub use event::{Event, EventEmitter, EventStream, GlareOutcome};
pub use logging::{init_logging, init_logging_with};
pub use mesh::{MeshCoordinator, NegotiationState, PeerLinkInfo};
pub use participant::{CameraStateMap, RemoteStream};
pub use session::{RoomSession, SessionBuilder, SessionStreams};
pub use sync::{
    DriftPolicy, DriftTracker, PlaybackTarget, PlayerControl, PositionReporter, ReferenceClock,
    SyncCorrectionHandler, SyncState,
};
