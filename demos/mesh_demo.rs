//! Mesh Demo
//!
//! Two participants in one process, connected through an in-memory signaling
//! relay and loopback transports. Shows link creation, camera-state driven
//! remote streams and teardown.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use watchsync::{
    init_logging, ChannelSink, EventEmitter, EventStream, IceCandidate, LinkConnectionState,
    LinkEventSender, LocalMedia, MeshConfig, MeshCoordinator, OutboundMessage, ParticipantRecord,
    PeerConnector, PeerTransport, RemoteTrackInfo, SdpKind, TrackKind, TransportEvent,
    VirtualCapture, WatchSyncError,
};

/// Transport that succeeds immediately and reports itself connected
struct LoopbackTransport {
    events: LinkEventSender,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn attach_local_tracks(&self, _media: &LocalMedia) -> Result<(), WatchSyncError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, WatchSyncError> {
        self.events
            .local_candidate(IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 9 typ host"));
        Ok(format!("loopback offer to {}", self.events.connection_id()))
    }

    async fn create_answer(&self) -> Result<String, WatchSyncError> {
        self.events
            .local_candidate(IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 9 typ host"));
        Ok(format!("loopback answer to {}", self.events.connection_id()))
    }

    async fn set_remote_description(&self, _kind: SdpKind, _sdp: &str) -> Result<(), WatchSyncError> {
        let remote = self.events.connection_id();
        self.events.state_changed(LinkConnectionState::Connected);
        self.events.track_added(RemoteTrackInfo {
            track_id: format!("{}-cam", remote),
            kind: TrackKind::Video,
            stream_id: format!("{}-stream", remote),
        });
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), WatchSyncError> {
        Ok(())
    }

    async fn close(&self) {}
}

struct LoopbackConnector;

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(
        &self,
        _connection_id: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerTransport>, WatchSyncError> {
        Ok(Arc::new(LoopbackTransport { events }))
    }
}

struct Participant {
    mesh: MeshCoordinator,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    events: EventStream,
}

impl Participant {
    fn new(id: &str) -> Self {
        let (sink, outbound) = ChannelSink::new();
        let (emitter, events) = EventEmitter::channel();
        let (mesh, transport_events) = MeshCoordinator::new(
            id,
            MeshConfig::default(),
            Arc::new(LoopbackConnector),
            Arc::new(VirtualCapture::new()),
            Arc::new(sink),
            emitter,
        );
        Self {
            mesh,
            outbound,
            transport_events,
            events,
        }
    }

    fn report(&self) {
        println!("   {}:", self.mesh.self_id());
        for link in self.mesh.links() {
            println!("     link to {} ({}): {:?}", link.connection_id, link.nickname, link.state);
        }
        for stream in self.mesh.remote_streams() {
            println!(
                "     watching {} with {} track(s)",
                stream.nickname,
                stream.tracks.len()
            );
        }
    }
}

/// Deliver everything `from` has produced; returns the number of messages moved
async fn relay(from: &mut Participant, to: &Participant) -> usize {
    let mut moved = 0;
    while let Ok(event) = from.transport_events.try_recv() {
        from.mesh.handle_transport_event(event).await;
        moved += 1;
    }
    let sender = from.mesh.self_id().to_string();
    while let Ok(message) = from.outbound.try_recv() {
        moved += 1;
        match message {
            OutboundMessage::Signal(envelope) => {
                if let Err(e) = to.mesh.handle_signal(envelope.from_sender(&sender)).await {
                    println!("   ⚠️  signal rejected: {}", e);
                }
            }
            OutboundMessage::CameraState(state) => to.mesh.update_camera_state(&state).await,
            _ => {}
        }
    }
    moved
}

async fn settle(alice: &mut Participant, bob: &mut Participant) {
    loop {
        let moved = relay(alice, bob).await + relay(bob, alice).await;
        if moved == 0 {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    println!("🕸️  Mesh Demo");
    println!("=============");

    let mut alice = Participant::new("alice");
    let mut bob = Participant::new("bob");
    let roster = vec![
        ParticipantRecord::new("alice", "Alice"),
        ParticipantRecord::new("bob", "Bob"),
    ];
    alice.mesh.update_roster(roster.clone()).await;
    bob.mesh.update_roster(roster).await;

    println!("\n📷 Both participants turn their cameras on");
    alice.mesh.start().await?;
    bob.mesh.start().await?;
    settle(&mut alice, &mut bob).await;
    alice.report();
    bob.report();

    println!("\n🔇 Alice mutes; no renegotiation happens");
    let mic_on = alice.mesh.toggle_mic()?;
    println!("   alice microphone on: {}", mic_on);
    settle(&mut alice, &mut bob).await;

    println!("\n🛑 Bob stops his media");
    bob.mesh.stop().await;
    settle(&mut alice, &mut bob).await;
    alice.report();
    bob.report();

    println!("\n📊 Events seen by alice");
    for event in alice.events.drain() {
        println!("   {}", event.event_type());
    }
    bob.events.close();
    Ok(())
}
