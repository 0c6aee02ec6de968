//! # watchsync signaling
//!
//! Wire protocol spoken with the room server, the outbound [`SignalingSink`]
//! seam, and a WebSocket client implementing it.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod protocol;
pub mod sink;

// Re-export main types
pub use client::{ReconnectPolicy, SignalingClient};
pub use protocol::{
    CameraStateMessage, CorrectionType, InboundMessage, OutboundMessage, ParticipantRecord,
    PositionReport, RoomPlaybackState, SignalEnvelope, SignalType, SyncCorrection, Welcome,
};
pub use sink::{ChannelSink, SignalingSink};
