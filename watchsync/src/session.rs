//! Room session: bootstrap and inbound dispatch

use crate::config::{MeshConfig, SessionConfig, SyncConfig};
use crate::event::{Event, EventEmitter, EventStream};
use crate::mesh::MeshCoordinator;
use crate::sync::{PlayerControl, SyncCorrectionHandler};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use watchsync_core::{PeerConnector, TransportEvent, WatchSyncError};
use watchsync_media::MediaCapture;
use watchsync_signaling::{
    InboundMessage, OutboundMessage, ParticipantRecord, ReconnectPolicy, SignalEnvelope,
    SignalingClient, SignalingSink,
};

/// Inbound channels of a connected session
pub struct SessionStreams {
    /// Frames from the signaling server
    pub inbound: mpsc::Receiver<InboundMessage>,
    /// Notifications from peer transports
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Fluent builder for a [`RoomSession`]
pub struct SessionBuilder {
    room_code: String,
    connection_id: Option<String>,
    signaling_url: Option<String>,
    reconnect: ReconnectPolicy,
    mesh: MeshConfig,
    sync: SyncConfig,
    connector: Option<Arc<dyn PeerConnector>>,
    capture: Option<Arc<dyn MediaCapture>>,
    signaling: Option<Arc<dyn SignalingSink>>,
    player: Option<Arc<dyn PlayerControl>>,
}

impl SessionBuilder {
    /// Start building a session for `room_code`
    pub fn new(room_code: &str) -> Self {
        Self {
            room_code: room_code.to_string(),
            connection_id: None,
            signaling_url: None,
            reconnect: ReconnectPolicy::default(),
            mesh: MeshConfig::default(),
            sync: SyncConfig::default(),
            connector: None,
            capture: None,
            signaling: None,
            player: None,
        }
    }

    /// Own connection ID, when already known
    pub fn connection_id(mut self, id: &str) -> Self {
        self.connection_id = Some(id.to_string());
        self
    }

    /// Signaling server URL (required by [`SessionBuilder::connect`])
    pub fn signaling_url(mut self, url: &str) -> Self {
        self.signaling_url = Some(url.to_string());
        self
    }

    /// How the signaling client recovers from a dropped socket
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Replace the mesh configuration
    pub fn mesh_config(mut self, config: MeshConfig) -> Self {
        self.mesh = config;
        self
    }

    /// Replace the sync configuration
    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync = config;
        self
    }

    /// Largest mesh, including the local participant; values above
    /// [`crate::MAX_MESH_PARTICIPANTS`] are capped
    pub fn max_participants(mut self, max: usize) -> Self {
        self.mesh.max_participants = max;
        self
    }

    /// Add a STUN/TURN server
    pub fn ice_server(mut self, url: &str) -> Self {
        self.mesh.ice_servers.push(url.to_string());
        self
    }

    /// Position report cadence
    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.sync.report_interval = interval;
        self
    }

    /// Peer transport factory (required)
    pub fn connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Local media source (required)
    pub fn capture(mut self, capture: Arc<dyn MediaCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Outbound signaling, for sessions not using [`SessionBuilder::connect`]
    pub fn signaling(mut self, signaling: Arc<dyn SignalingSink>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    /// Local video player (required)
    pub fn player(mut self, player: Arc<dyn PlayerControl>) -> Self {
        self.player = Some(player);
        self
    }

    /// Assemble the session from explicitly provided collaborators
    pub fn build(
        self,
    ) -> Result<(RoomSession, mpsc::UnboundedReceiver<TransportEvent>), WatchSyncError> {
        let signaling = self
            .signaling
            .clone()
            .ok_or_else(|| missing("signaling"))?;
        self.assemble(signaling)
    }

    /// Connect to the signaling server, wait for the assigned connection ID
    /// and assemble the session around the connection
    pub async fn connect(mut self) -> Result<(RoomSession, SessionStreams), WatchSyncError> {
        let url = self
            .signaling_url
            .clone()
            .ok_or_else(|| missing("signaling_url"))?;
        let (client, mut inbound) = SignalingClient::connect_with(&url, self.reconnect).await?;

        let assigned = loop {
            match inbound.recv().await {
                Some(InboundMessage::Welcome(welcome)) => break welcome.connection_id,
                Some(other) => debug!("Discarding {} frame received before welcome", other.kind()),
                None => {
                    return Err(WatchSyncError::Signaling {
                        reason: "connection closed before welcome".to_string(),
                    })
                }
            }
        };
        if let Some(expected) = &self.connection_id {
            if *expected != assigned {
                return Err(WatchSyncError::InvalidState {
                    expected: expected.clone(),
                    actual: assigned,
                });
            }
        }
        info!("Server assigned connection ID {}", assigned);
        self.connection_id = Some(assigned);

        let (session, transport_events) = self.assemble(Arc::new(client))?;
        Ok((
            session,
            SessionStreams {
                inbound,
                transport_events,
            },
        ))
    }

    fn assemble(
        self,
        signaling: Arc<dyn SignalingSink>,
    ) -> Result<(RoomSession, mpsc::UnboundedReceiver<TransportEvent>), WatchSyncError> {
        let connection_id = self.connection_id.ok_or_else(|| missing("connection_id"))?;
        let connector = self.connector.ok_or_else(|| missing("connector"))?;
        let capture = self.capture.ok_or_else(|| missing("capture"))?;
        let player = self.player.ok_or_else(|| missing("player"))?;

        let config = SessionConfig {
            room_code: self.room_code,
            connection_id,
            signaling_url: self.signaling_url,
            reconnect: self.reconnect,
            mesh: self.mesh,
            sync: self.sync,
        };
        let (events, event_stream) = EventEmitter::channel();
        let (mesh, transport_events) = MeshCoordinator::new(
            config.connection_id.clone(),
            config.mesh.clone(),
            connector,
            capture,
            signaling.clone(),
            events.clone(),
        );
        let sync = Arc::new(SyncCorrectionHandler::new(
            config.sync.clone(),
            player,
            signaling.clone(),
            events.clone(),
        ));
        info!(
            "Session for room {} ready as {}",
            config.room_code, config.connection_id
        );
        Ok((
            RoomSession {
                config: RwLock::new(config),
                mesh,
                sync,
                signaling,
                events,
                event_stream: Mutex::new(Some(event_stream)),
            },
            transport_events,
        ))
    }
}

fn missing(field: &str) -> WatchSyncError {
    WatchSyncError::MissingConfiguration {
        field: field.to_string(),
    }
}

/// One participant's membership in a room
///
/// Owns the mesh coordinator and the sync handler and routes every inbound
/// frame to the right one.
pub struct RoomSession {
    config: RwLock<SessionConfig>,
    mesh: MeshCoordinator,
    sync: Arc<SyncCorrectionHandler>,
    signaling: Arc<dyn SignalingSink>,
    events: EventEmitter,
    event_stream: Mutex<Option<EventStream>>,
}

impl RoomSession {
    /// Snapshot of the session configuration
    pub fn config(&self) -> SessionConfig {
        self.config.read().clone()
    }

    /// Room code
    pub fn room_code(&self) -> String {
        self.config.read().room_code.clone()
    }

    /// Own connection ID; changes when a reconnect brings a new `welcome`
    pub fn connection_id(&self) -> String {
        self.config.read().connection_id.clone()
    }

    /// Peer mesh coordinator
    pub fn mesh(&self) -> &MeshCoordinator {
        &self.mesh
    }

    /// Sync correction handler
    pub fn sync(&self) -> &SyncCorrectionHandler {
        &self.sync
    }

    /// Take the event stream; only the first call gets it
    pub fn take_events(&self) -> Option<EventStream> {
        self.event_stream.lock().take()
    }

    /// Process one inbound frame to completion
    pub async fn dispatch(&self, message: InboundMessage) -> Result<(), WatchSyncError> {
        debug!("Dispatching {} frame", message.kind());
        match message {
            InboundMessage::Welcome(welcome) => self.on_welcome(&welcome.connection_id).await,
            InboundMessage::Roster(roster) => {
                self.mesh.update_roster(roster).await;
                Ok(())
            }
            InboundMessage::CameraState(camera_state) => {
                self.mesh.update_camera_state(&camera_state).await;
                Ok(())
            }
            InboundMessage::Signal(envelope) => self.mesh.handle_signal(envelope).await,
            InboundMessage::SyncCorrection(correction) => {
                self.sync.apply_correction(&correction).map(|_| ())
            }
            InboundMessage::RoomState(room_state) => {
                self.sync.apply_room_state(room_state);
                Ok(())
            }
            InboundMessage::ConnectionLost => {
                warn!("Signaling connection lost; waiting for reconnect");
                self.events.emit(Event::SignalingDisconnected);
                Ok(())
            }
            InboundMessage::Reconnected { attempts } => {
                info!("Signaling connection restored");
                self.events.emit(Event::SignalingReconnected { attempts });
                Ok(())
            }
        }
    }

    /// Process one transport notification
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        self.mesh.handle_transport_event(event).await;
    }

    /// Event loop over signaling frames and transport events
    ///
    /// Signals are handled by one worker per sending peer, so each peer's
    /// envelopes are processed in arrival order while different peers
    /// negotiate concurrently. A dropped signaling socket does not end the
    /// loop; the client reconnects and its `welcome` rebuilds the mesh. Once
    /// the inbound channel closes, queued work is finished and the session
    /// leaves the room.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut workers = SignalWorkers::new(self.mesh.clone());
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    let Some(message) = message else {
                        info!("Signaling channel closed");
                        break;
                    };
                    self.route(message, &mut workers, &mut tasks).await;
                }
                Some(event) = transport_events.recv() => {
                    self.mesh.handle_transport_event(event).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Session task failed: {}", e);
                    }
                }
            }
        }

        drop(workers);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Session task failed: {}", e);
            }
        }
        self.leave().await;
    }

    async fn route(
        &self,
        message: InboundMessage,
        workers: &mut SignalWorkers,
        tasks: &mut JoinSet<()>,
    ) {
        match message {
            InboundMessage::Signal(envelope) => {
                let sender = match envelope.sender() {
                    Ok(sender) => sender.to_string(),
                    Err(e) => {
                        warn!("Dropping signal: {}", e);
                        return;
                    }
                };
                workers.submit(sender, envelope, tasks);
            }
            InboundMessage::Roster(roster) => {
                workers.prune(&roster);
                self.mesh.set_roster(roster);
                let mesh = self.mesh.clone();
                tasks.spawn(async move { mesh.reconcile().await });
            }
            InboundMessage::CameraState(camera_state) => {
                if self.mesh.apply_camera_state(&camera_state) {
                    let mesh = self.mesh.clone();
                    tasks.spawn(async move { mesh.reconcile().await });
                }
            }
            other => {
                if let Err(e) = self.dispatch(other).await {
                    warn!("Failed to handle inbound frame: {}", e);
                }
            }
        }
    }

    /// A `welcome` after bootstrap means the client reconnected and the
    /// server knows this participant under a new ID
    async fn on_welcome(&self, connection_id: &str) -> Result<(), WatchSyncError> {
        let previous = self.connection_id();
        if connection_id == previous {
            debug!("Repeated welcome for {}", connection_id);
            return Ok(());
        }
        info!(
            "Server reassigned connection ID {} -> {}",
            previous, connection_id
        );
        self.config.write().connection_id = connection_id.to_string();
        if let Err(e) = self.mesh.rejoin(connection_id).await {
            warn!("Failed to restart local media after rejoining: {}", e);
        }
        self.events.emit(Event::ConnectionIdChanged {
            previous,
            current: connection_id.to_string(),
        });
        self.request_sync().await
    }

    /// Ask the server for a fresh authoritative room state
    pub async fn request_sync(&self) -> Result<(), WatchSyncError> {
        self.signaling.send(OutboundMessage::RequestSync).await
    }

    /// Stop local media, close every link and stop reporting
    pub async fn leave(&self) {
        info!("Leaving room {}", self.room_code());
        self.mesh.stop().await;
        self.sync.leave();
    }
}

/// Per-peer signal workers of one [`RoomSession::run`]
struct SignalWorkers {
    mesh: MeshCoordinator,
    workers: HashMap<String, SignalWorker>,
}

struct SignalWorker {
    tx: mpsc::UnboundedSender<SignalEnvelope>,
    /// Envelopes queued or being handled
    pending: Arc<AtomicUsize>,
}

impl SignalWorkers {
    fn new(mesh: MeshCoordinator) -> Self {
        Self {
            mesh,
            workers: HashMap::new(),
        }
    }

    /// Queue `envelope` behind every earlier envelope from `sender`
    fn submit(&mut self, sender: String, envelope: SignalEnvelope, tasks: &mut JoinSet<()>) {
        let mesh = &self.mesh;
        let worker = self.workers.entry(sender).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let pending = Arc::new(AtomicUsize::new(0));
            tasks.spawn(signal_worker(mesh.clone(), rx, pending.clone()));
            SignalWorker { tx, pending }
        });
        worker.pending.fetch_add(1, Ordering::AcqRel);
        if worker.tx.send(envelope).is_err() {
            worker.pending.fetch_sub(1, Ordering::AcqRel);
            warn!("Signal worker gone; dropping envelope");
        }
    }

    /// Retire idle workers of departed peers
    ///
    /// A busy worker is kept until a later roster finds it idle, so a peer
    /// never has two workers at once.
    fn prune(&mut self, roster: &[ParticipantRecord]) {
        self.workers.retain(|id, worker| {
            roster.iter().any(|p| p.connection_id == *id)
                || worker.pending.load(Ordering::Acquire) > 0
        });
    }
}

async fn signal_worker(
    mesh: MeshCoordinator,
    mut rx: mpsc::UnboundedReceiver<SignalEnvelope>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = mesh.handle_signal(envelope).await {
            warn!("Failed to handle signal: {}", e);
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use watchsync_core::{LinkEventSender, PeerTransport};
    use watchsync_media::VirtualCapture;
    use watchsync_signaling::ChannelSink;

    struct RefusingConnector;

    #[async_trait]
    impl PeerConnector for RefusingConnector {
        async fn connect(
            &self,
            connection_id: &str,
            _events: LinkEventSender,
        ) -> Result<Arc<dyn PeerTransport>, WatchSyncError> {
            tokio::task::yield_now().await;
            Err(WatchSyncError::negotiation(connection_id, "connect refused"))
        }
    }

    fn mesh() -> MeshCoordinator {
        let (sink, _rx) = ChannelSink::new();
        MeshCoordinator::new(
            "a",
            MeshConfig::default(),
            Arc::new(RefusingConnector),
            Arc::new(VirtualCapture::new()),
            Arc::new(sink),
            EventEmitter::detached(),
        )
        .0
    }

    fn pending(workers: &SignalWorkers, peer: &str) -> Option<usize> {
        workers
            .workers
            .get(peer)
            .map(|worker| worker.pending.load(Ordering::Acquire))
    }

    #[tokio::test]
    async fn test_busy_worker_survives_departure_until_idle() {
        let mut workers = SignalWorkers::new(mesh());
        let mut tasks = JoinSet::new();
        let offer = SignalEnvelope::offer("a", "offer-from-c").from_sender("c");

        workers.submit("c".to_string(), offer, &mut tasks);
        assert_eq!(pending(&workers, "c"), Some(1));

        // c left while its offer is still queued
        workers.prune(&[]);
        assert_eq!(pending(&workers, "c"), Some(1));

        for _ in 0..100 {
            if pending(&workers, "c") == Some(0) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pending(&workers, "c"), Some(0));

        workers.prune(&[]);
        assert!(workers.workers.is_empty());
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }

    #[tokio::test]
    async fn test_workers_of_listed_peers_are_kept() {
        let mut workers = SignalWorkers::new(mesh());
        let mut tasks = JoinSet::new();
        workers.submit(
            "b".to_string(),
            SignalEnvelope::answer("a", "answer-from-b").from_sender("b"),
            &mut tasks,
        );
        workers.prune(&[ParticipantRecord::new("b", "Bob")]);
        assert!(workers.workers.contains_key("b"));
    }
}
