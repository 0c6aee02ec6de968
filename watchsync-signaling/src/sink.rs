//! Outbound signaling seam

use crate::protocol::OutboundMessage;
use async_trait::async_trait;
use tokio::sync::mpsc;
use watchsync_core::WatchSyncError;

/// Anything that can deliver frames to the signaling server
#[async_trait]
pub trait SignalingSink: Send + Sync {
    /// Queue one frame for delivery
    async fn send(&self, message: OutboundMessage) -> Result<(), WatchSyncError>;
}

/// In-process sink backed by an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelSink {
    /// Create a sink and the receiver observing everything sent through it
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SignalingSink for ChannelSink {
    async fn send(&self, message: OutboundMessage) -> Result<(), WatchSyncError> {
        self.tx.send(message).map_err(|_| WatchSyncError::Signaling {
            reason: "signaling channel closed".to_string(),
        })
    }
}
