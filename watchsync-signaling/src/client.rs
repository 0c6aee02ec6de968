//! WebSocket signaling client
//!
//! One connection task pumps the outgoing queue into the socket and decodes
//! text frames into [`InboundMessage`]s. Malformed frames are logged and
//! skipped so that one bad frame never tears down the session.
//!
//! When the server drops the socket the task reports
//! [`InboundMessage::ConnectionLost`], waits [`ReconnectPolicy::delay`] and
//! dials again, reporting [`InboundMessage::Reconnected`] once it is back.
//! Frames queued while disconnected are dropped. The server greets every new
//! connection with a fresh `welcome`.

use crate::protocol::{InboundMessage, OutboundMessage};
use crate::sink::SignalingSink;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use watchsync_core::WatchSyncError;

const QUEUE_CAPACITY: usize = 256;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How the client recovers from a dropped socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Pause before each connection attempt
    pub delay: Duration,
    /// Attempts per outage before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect; the inbound stream ends with the first socket
    pub fn disabled() -> Self {
        Self {
            delay: Duration::ZERO,
            max_attempts: Some(0),
        }
    }
}

/// How one socket ended
enum Ended {
    /// The client or its inbound receiver is gone
    Local,
    /// The server closed the socket or it failed
    Remote,
}

/// Connected signaling client
pub struct SignalingClient {
    outgoing: mpsc::Sender<OutboundMessage>,
    task: JoinHandle<()>,
}

impl SignalingClient {
    /// Connect to `url` with the default [`ReconnectPolicy`], returning the
    /// client and the stream of inbound frames
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), WatchSyncError> {
        Self::connect_with(url, ReconnectPolicy::default()).await
    }

    /// Connect to `url`, recovering from dropped sockets as `policy` says
    ///
    /// Only the first connection attempt is reported as an error.
    pub async fn connect_with(
        url: &str,
        policy: ReconnectPolicy,
    ) -> Result<(Self, mpsc::Receiver<InboundMessage>), WatchSyncError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| WatchSyncError::Signaling {
                reason: format!("failed to connect to {}: {}", url, e),
            })?;
        info!("Connected to signaling server at {}", url);

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<OutboundMessage>(QUEUE_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel::<InboundMessage>(QUEUE_CAPACITY);
        let task = tokio::spawn(supervise(
            url.to_string(),
            socket,
            policy,
            outgoing_rx,
            incoming_tx,
        ));

        Ok((
            Self {
                outgoing: outgoing_tx,
                task,
            },
            incoming_rx,
        ))
    }

    /// Stop the connection task; the inbound stream ends
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl SignalingSink for SignalingClient {
    async fn send(&self, message: OutboundMessage) -> Result<(), WatchSyncError> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| WatchSyncError::Signaling {
                reason: "signaling connection closed".to_string(),
            })
    }
}

async fn supervise(
    url: String,
    socket: Socket,
    policy: ReconnectPolicy,
    mut outgoing: mpsc::Receiver<OutboundMessage>,
    incoming: mpsc::Sender<InboundMessage>,
) {
    let mut socket = socket;
    loop {
        if let Ended::Local = pump(socket, &mut outgoing, &incoming).await {
            debug!("Signaling connection task stopped");
            return;
        }
        warn!("Signaling connection to {} lost", url);
        if incoming.send(InboundMessage::ConnectionLost).await.is_err() {
            return;
        }

        let Some((next, attempts)) = redial(&url, policy, &mut outgoing, &incoming).await else {
            info!("Giving up on signaling server at {}", url);
            return;
        };
        info!("Reconnected to {} after {} attempt(s)", url, attempts);
        if incoming
            .send(InboundMessage::Reconnected { attempts })
            .await
            .is_err()
        {
            return;
        }
        socket = next;
    }
}

/// Dial until a socket opens, dropping frames queued in the meantime
async fn redial(
    url: &str,
    policy: ReconnectPolicy,
    outgoing: &mut mpsc::Receiver<OutboundMessage>,
    incoming: &mpsc::Sender<InboundMessage>,
) -> Option<(Socket, u32)> {
    let mut attempts = 0;
    loop {
        if policy.max_attempts.is_some_and(|max| attempts >= max) || incoming.is_closed() {
            return None;
        }
        attempts += 1;

        let pause = tokio::time::sleep(policy.delay);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                _ = &mut pause => break,
                message = outgoing.recv() => match message {
                    Some(message) => debug!("Dropping {:?} while disconnected", message),
                    None => return None,
                },
            }
        }

        match connect_async(url).await {
            Ok((socket, _)) => return Some((socket, attempts)),
            Err(e) => warn!("Reconnect attempt {} to {} failed: {}", attempts, url, e),
        }
    }
}

async fn pump(
    socket: Socket,
    outgoing: &mut mpsc::Receiver<OutboundMessage>,
    incoming: &mpsc::Sender<InboundMessage>,
) -> Ended {
    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(message) = message else {
                    let _ = write.close().await;
                    return Ended::Local;
                };
                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Dropping outbound frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("Signaling socket write failed: {}", e);
                    return Ended::Remote;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match InboundMessage::from_json(&text) {
                    Ok(message) => {
                        if incoming.send(message).await.is_err() {
                            return Ended::Local;
                        }
                    }
                    Err(e) => warn!("Skipping malformed signaling frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Signaling server closed the connection");
                    return Ended::Remote;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Signaling socket error: {}", e);
                    return Ended::Remote;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, None);
        assert_eq!(ReconnectPolicy::disabled().max_attempts, Some(0));
    }
}
