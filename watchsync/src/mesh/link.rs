//! Per-peer link record
//!
//! Everything the coordinator knows about one remote participant lives in a
//! single [`PeerLink`], so that invariants such as "candidates are buffered
//! only while the remote description is unset" have exactly one owner.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex as OpLock;
use watchsync_core::{IceCandidate, PeerTransport, RemoteTrackInfo};

/// Negotiation progress of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// Reserved; transport being created or remote offer being applied
    Idle,
    /// Local offer sent, waiting for the answer
    OfferSent,
    /// Answer sent, waiting for the transport to connect
    AnswerSent,
    /// Negotiation complete on this side
    Connected,
    /// Torn down
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "idle"),
            NegotiationState::OfferSent => write!(f, "offer-sent"),
            NegotiationState::AnswerSent => write!(f, "answer-sent"),
            NegotiationState::Connected => write!(f, "connected"),
            NegotiationState::Closed => write!(f, "closed"),
        }
    }
}

/// Read-only snapshot of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLinkInfo {
    /// Remote connection ID
    pub connection_id: String,
    /// Display name
    pub nickname: String,
    /// Negotiation state
    pub state: NegotiationState,
    /// Whether a remote description has been applied
    pub has_remote_description: bool,
    /// Candidates waiting for the remote description
    pub pending_ice_candidates: usize,
    /// Whether local tracks are being sent on this link
    pub has_local_tracks_attached: bool,
    /// Whether the transport reported connected
    pub transport_connected: bool,
    /// Remote tracks received so far
    pub remote_tracks: Vec<RemoteTrackInfo>,
}

pub(crate) struct PeerLink {
    pub(crate) connection_id: String,
    pub(crate) nickname: String,
    /// Bumped whenever the transport is replaced
    pub(crate) epoch: u64,
    pub(crate) transport: Option<Arc<dyn PeerTransport>>,
    pub(crate) state: NegotiationState,
    pub(crate) has_remote_description: bool,
    pub(crate) pending_ice_candidates: VecDeque<IceCandidate>,
    pub(crate) has_local_tracks_attached: bool,
    pub(crate) transport_connected: bool,
    pub(crate) remote_tracks: Vec<RemoteTrackInfo>,
    /// Held for the whole of every operation touching this link
    pub(crate) op_lock: Arc<OpLock<()>>,
}

impl PeerLink {
    pub(crate) fn new(
        connection_id: &str,
        nickname: String,
        epoch: u64,
        pending_ice_candidates: VecDeque<IceCandidate>,
    ) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            nickname,
            epoch,
            transport: None,
            state: NegotiationState::Idle,
            has_remote_description: false,
            pending_ice_candidates,
            has_local_tracks_attached: false,
            transport_connected: false,
            remote_tracks: Vec::new(),
            op_lock: Arc::new(OpLock::new(())),
        }
    }

    pub(crate) fn info(&self) -> PeerLinkInfo {
        PeerLinkInfo {
            connection_id: self.connection_id.clone(),
            nickname: self.nickname.clone(),
            state: self.state,
            has_remote_description: self.has_remote_description,
            pending_ice_candidates: self.pending_ice_candidates.len(),
            has_local_tracks_attached: self.has_local_tracks_attached,
            transport_connected: self.transport_connected,
            remote_tracks: self.remote_tracks.clone(),
        }
    }

    /// Queue a candidate until the remote description is applied
    pub(crate) fn buffer_candidate(&mut self, candidate: IceCandidate, limit: usize) -> bool {
        if self.pending_ice_candidates.len() >= limit {
            return false;
        }
        self.pending_ice_candidates.push_back(candidate);
        true
    }

    /// Mark the remote description applied and hand back the buffered candidates
    pub(crate) fn remote_description_applied(&mut self) -> VecDeque<IceCandidate> {
        self.has_remote_description = true;
        std::mem::take(&mut self.pending_ice_candidates)
    }

    pub(crate) fn add_remote_track(&mut self, track: RemoteTrackInfo) -> bool {
        if self.remote_tracks.iter().any(|t| t.track_id == track.track_id) {
            return false;
        }
        self.remote_tracks.push(track);
        true
    }

    /// Detach the transport ahead of a replacement, keeping buffered candidates
    pub(crate) fn replace_transport(&mut self, epoch: u64) -> Option<Arc<dyn PeerTransport>> {
        self.epoch = epoch;
        self.state = NegotiationState::Idle;
        self.has_remote_description = false;
        self.has_local_tracks_attached = false;
        self.transport_connected = false;
        self.remote_tracks.clear();
        self.transport.take()
    }
}
