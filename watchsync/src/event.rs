//! Event system for mesh, media and sync events

use crate::sync::SyncState;
use tokio::sync::mpsc;
use tracing::debug;
use watchsync_signaling::CorrectionType;

/// How a simultaneous-offer race was settled on this side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlareOutcome {
    /// Own offer discarded, remote offer answered
    AcceptedRemote,
    /// Remote offer ignored, own offer kept
    KeptLocal,
}

/// Events observable by the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Local camera/microphone acquired
    LocalMediaStarted {
        /// Local stream ID
        stream_id: String,
    },
    /// Local media released
    LocalMediaStopped,
    /// Local media could not be acquired
    MediaAccessFailed {
        /// User-presentable reason
        reason: String,
    },
    /// Camera track enabled flag flipped
    CameraToggled {
        /// New state
        enabled: bool,
    },
    /// Microphone track enabled flag flipped
    MicrophoneToggled {
        /// New state
        enabled: bool,
    },
    /// A transport to a remote participant was created
    PeerLinkOpened {
        /// Remote connection ID
        connection_id: String,
        /// Whether the local side sends the offer
        initiator: bool,
    },
    /// A peer link was torn down
    PeerLinkClosed {
        /// Remote connection ID
        connection_id: String,
        /// Why the link was closed
        reason: String,
    },
    /// A simultaneous-offer race was settled
    GlareResolved {
        /// Remote connection ID
        connection_id: String,
        /// Which offer survived on this side
        outcome: GlareOutcome,
    },
    /// The aggregated remote-stream list changed
    RemoteStreamsChanged {
        /// Connection IDs now rendered
        peers: Vec<String>,
    },
    /// A sync correction was applied to the player
    CorrectionApplied {
        /// Applied correction
        correction_type: CorrectionType,
        /// Handler state afterwards
        state: SyncState,
    },
    /// Periodic position reporting started
    ReportingStarted,
    /// Periodic position reporting stopped
    ReportingStopped,
    /// The signaling socket dropped; the client is reconnecting
    SignalingDisconnected,
    /// The signaling socket is open again
    SignalingReconnected {
        /// Connection attempts it took
        attempts: u32,
    },
    /// The server assigned a new connection ID and the mesh was rebuilt
    ConnectionIdChanged {
        /// ID before the reconnect
        previous: String,
        /// ID now in use
        current: String,
    },
}

impl Event {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::LocalMediaStarted { .. } => "local_media_started",
            Event::LocalMediaStopped => "local_media_stopped",
            Event::MediaAccessFailed { .. } => "media_access_failed",
            Event::CameraToggled { .. } => "camera_toggled",
            Event::MicrophoneToggled { .. } => "microphone_toggled",
            Event::PeerLinkOpened { .. } => "peer_link_opened",
            Event::PeerLinkClosed { .. } => "peer_link_closed",
            Event::GlareResolved { .. } => "glare_resolved",
            Event::RemoteStreamsChanged { .. } => "remote_streams_changed",
            Event::CorrectionApplied { .. } => "correction_applied",
            Event::ReportingStarted => "reporting_started",
            Event::ReportingStopped => "reporting_stopped",
            Event::SignalingDisconnected => "signaling_disconnected",
            Event::SignalingReconnected { .. } => "signaling_reconnected",
            Event::ConnectionIdChanged { .. } => "connection_id_changed",
        }
    }

    /// Check if this is a local-media event
    pub fn is_media_event(&self) -> bool {
        matches!(
            self,
            Event::LocalMediaStarted { .. }
                | Event::LocalMediaStopped
                | Event::MediaAccessFailed { .. }
                | Event::CameraToggled { .. }
                | Event::MicrophoneToggled { .. }
        )
    }

    /// Check if this is a peer-mesh event
    pub fn is_mesh_event(&self) -> bool {
        matches!(
            self,
            Event::PeerLinkOpened { .. }
                | Event::PeerLinkClosed { .. }
                | Event::GlareResolved { .. }
                | Event::RemoteStreamsChanged { .. }
        )
    }

    /// Check if this is a playback-sync event
    pub fn is_sync_event(&self) -> bool {
        matches!(
            self,
            Event::CorrectionApplied { .. } | Event::ReportingStarted | Event::ReportingStopped
        )
    }

    /// Check if this is a signaling connection event
    pub fn is_signaling_event(&self) -> bool {
        matches!(
            self,
            Event::SignalingDisconnected
                | Event::SignalingReconnected { .. }
                | Event::ConnectionIdChanged { .. }
        )
    }

    /// Check if this is an error event
    pub fn is_error_event(&self) -> bool {
        matches!(self, Event::MediaAccessFailed { .. })
    }
}

/// Sending half shared by the coordinator and the sync handler
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventEmitter {
    /// Create an emitter and the stream observing it
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, EventStream::new(rx))
    }

    /// Emitter whose events go nowhere
    pub fn detached() -> Self {
        Self::channel().0
    }

    /// Publish one event
    pub fn emit(&self, event: Event) {
        debug!("Emitting event: {}", event.event_type());
        let _ = self.tx.send(event);
    }
}

/// Stream of events for async iteration
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Create a new event stream with a receiver
    pub fn new(receiver: mpsc::UnboundedReceiver<Event>) -> Self {
        Self { receiver }
    }

    /// Get the next event from the stream
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Result<Option<Event>, mpsc::error::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(mpsc::error::TryRecvError::Disconnected)
            }
        }
    }

    /// Drain every event queued so far
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Close the event stream
    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// Check if the event stream is closed
    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }
}
