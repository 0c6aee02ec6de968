//! Peer transport abstraction
//!
//! The mesh coordinator never talks to a media stack directly. It asks a
//! [`PeerConnector`] for one [`PeerTransport`] per remote participant and
//! drives offer/answer/candidate exchange through it. Asynchronous
//! notifications from the transport (gathered candidates, connection state,
//! remote tracks) flow back through the [`LinkEventSender`] handed out at
//! connect time, stamped with the link epoch so that events from a transport
//! the coordinator already discarded can be recognised and ignored.

use crate::error::WatchSyncError;
use crate::track::{LocalMedia, RemoteTrackInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A proposed network path, exchanged incrementally during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,
    /// Media stream identification tag
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate without media line association
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Which side of an offer/answer exchange a session description is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Session description offer
    Offer,
    /// Session description answer
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// Connection state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkConnectionState {
    /// Transport created, nothing exchanged yet
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Temporarily lost connectivity; may recover
    Disconnected,
    /// Unrecoverable failure
    Failed,
    /// Closed by either side
    Closed,
}

impl LinkConnectionState {
    /// Whether the link must be torn down
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkConnectionState::Failed | LinkConnectionState::Closed)
    }
}

impl fmt::Display for LinkConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkConnectionState::New => write!(f, "new"),
            LinkConnectionState::Connecting => write!(f, "connecting"),
            LinkConnectionState::Connected => write!(f, "connected"),
            LinkConnectionState::Disconnected => write!(f, "disconnected"),
            LinkConnectionState::Failed => write!(f, "failed"),
            LinkConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Notification raised by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// A local candidate was gathered and must be sent to the remote side
    LocalCandidate(IceCandidate),
    /// The connection state changed
    StateChanged(LinkConnectionState),
    /// A remote track started arriving
    TrackAdded(RemoteTrackInfo),
}

/// Notification raised by the transport of one link
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    /// Remote connection ID of the link
    pub connection_id: String,
    /// Epoch of the link the transport was created for
    pub link_epoch: u64,
    /// What happened
    pub kind: TransportEventKind,
}

/// Per-link handle a transport uses to report events
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    connection_id: String,
    link_epoch: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl LinkEventSender {
    /// Create a sender for the link identified by `connection_id` and `link_epoch`
    pub fn new(
        connection_id: impl Into<String>,
        link_epoch: u64,
        tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            link_epoch,
            tx,
        }
    }

    /// Remote connection ID of the link
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Epoch of the link
    pub fn link_epoch(&self) -> u64 {
        self.link_epoch
    }

    /// Report a locally gathered candidate
    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(TransportEventKind::LocalCandidate(candidate));
    }

    /// Report a connection state change
    pub fn state_changed(&self, state: LinkConnectionState) {
        self.emit(TransportEventKind::StateChanged(state));
    }

    /// Report a remote track
    pub fn track_added(&self, track: RemoteTrackInfo) {
        self.emit(TransportEventKind::TrackAdded(track));
    }

    fn emit(&self, kind: TransportEventKind) {
        let event = TransportEvent {
            connection_id: self.connection_id.clone(),
            link_epoch: self.link_epoch,
            kind,
        };
        if self.tx.send(event).is_err() {
            debug!(
                "Dropping transport event for {}: coordinator gone",
                self.connection_id
            );
        }
    }
}

/// One direct connection to a remote participant
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Start sending the given local tracks on this connection
    async fn attach_local_tracks(&self, media: &LocalMedia) -> Result<(), WatchSyncError>;

    /// Create an offer, apply it as local description and return its SDP
    async fn create_offer(&self) -> Result<String, WatchSyncError>;

    /// Create an answer, apply it as local description and return its SDP
    async fn create_answer(&self) -> Result<String, WatchSyncError>;

    /// Apply the remote session description
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), WatchSyncError>;

    /// Apply one remote candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), WatchSyncError>;

    /// Close the connection; further calls are no-ops
    async fn close(&self);
}

/// Factory for peer transports
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a transport to `connection_id`, reporting through `events`
    async fn connect(
        &self,
        connection_id: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerTransport>, WatchSyncError>;
}
