//! In-memory collaborators shared by the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use watchsync::{
    ChannelSink, EventEmitter, EventStream, IceCandidate, LinkEventSender, LocalMedia, MeshConfig,
    MeshCoordinator, OutboundMessage, ParticipantRecord, PeerConnector, PeerTransport,
    PlayerControl, SdpKind, SignalEnvelope, SignalType, TransportEvent, VirtualCapture,
    WatchSyncError,
};

/// One recorded transport call
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Connect,
    AttachTracks,
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
    /// A candidate reached the transport before any remote description
    CandidateTooEarly(String),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub peer: String,
    pub epoch: u64,
    pub op: Op,
}

#[derive(Default)]
struct NetworkState {
    calls: Vec<Call>,
    senders: HashMap<String, LinkEventSender>,
    failing_candidates: HashSet<String>,
    failing_descriptions: HashSet<String>,
    failing_connects: HashSet<String>,
    connect_delay: Option<Duration>,
}

/// Shared call log and failure script for every mock transport
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, peer: &str, epoch: u64, op: Op) {
        self.state.lock().calls.push(Call {
            peer: peer.to_string(),
            epoch,
            op,
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Operations recorded for `peer`, in order
    pub fn ops(&self, peer: &str) -> Vec<Op> {
        self.calls()
            .into_iter()
            .filter(|call| call.peer == peer)
            .map(|call| call.op)
            .collect()
    }

    pub fn count(&self, peer: &str, op: &Op) -> usize {
        self.ops(peer).iter().filter(|o| *o == op).count()
    }

    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }

    /// Event sender of the latest transport created for `peer`
    pub fn sender(&self, peer: &str) -> LinkEventSender {
        self.state
            .lock()
            .senders
            .get(peer)
            .cloned()
            .expect("no transport for peer")
    }

    pub fn fail_candidate(&self, candidate: &str) {
        self.state
            .lock()
            .failing_candidates
            .insert(candidate.to_string());
    }

    pub fn fail_remote_description(&self, peer: &str) {
        self.state
            .lock()
            .failing_descriptions
            .insert(peer.to_string());
    }

    pub fn fail_connect(&self, peer: &str) {
        self.state.lock().failing_connects.insert(peer.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }
}

/// Connector handing out [`MockTransport`]s
pub struct MockConnector {
    pub network: MockNetwork,
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        connection_id: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerTransport>, WatchSyncError> {
        let epoch = events.link_epoch();
        self.network.record(connection_id, epoch, Op::Connect);
        let delay = self.network.state.lock().connect_delay;
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        if self
            .network
            .state
            .lock()
            .failing_connects
            .contains(connection_id)
        {
            return Err(WatchSyncError::negotiation(connection_id, "connect refused"));
        }
        self.network
            .state
            .lock()
            .senders
            .insert(connection_id.to_string(), events);
        Ok(Arc::new(MockTransport {
            peer: connection_id.to_string(),
            epoch,
            network: self.network.clone(),
            has_remote: Mutex::new(false),
        }))
    }
}

/// Transport recording every call into the shared [`MockNetwork`]
pub struct MockTransport {
    peer: String,
    epoch: u64,
    network: MockNetwork,
    has_remote: Mutex<bool>,
}

impl MockTransport {
    fn record(&self, op: Op) {
        self.network.record(&self.peer, self.epoch, op);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn attach_local_tracks(&self, _media: &LocalMedia) -> Result<(), WatchSyncError> {
        self.record(Op::AttachTracks);
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, WatchSyncError> {
        self.record(Op::CreateOffer);
        tokio::task::yield_now().await;
        Ok(format!("offer-to-{}-{}", self.peer, self.epoch))
    }

    async fn create_answer(&self) -> Result<String, WatchSyncError> {
        self.record(Op::CreateAnswer);
        tokio::task::yield_now().await;
        Ok(format!("answer-to-{}-{}", self.peer, self.epoch))
    }

    async fn set_remote_description(&self, kind: SdpKind, _sdp: &str) -> Result<(), WatchSyncError> {
        self.record(Op::SetRemote(kind));
        tokio::task::yield_now().await;
        if self
            .network
            .state
            .lock()
            .failing_descriptions
            .contains(&self.peer)
        {
            return Err(WatchSyncError::negotiation(&self.peer, "malformed description"));
        }
        *self.has_remote.lock() = true;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), WatchSyncError> {
        if !*self.has_remote.lock() {
            self.record(Op::CandidateTooEarly(candidate.candidate.clone()));
        }
        self.record(Op::AddCandidate(candidate.candidate.clone()));
        tokio::task::yield_now().await;
        if self
            .network
            .state
            .lock()
            .failing_candidates
            .contains(&candidate.candidate)
        {
            return Err(WatchSyncError::IceApplication {
                connection_id: self.peer.clone(),
                reason: "unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        self.record(Op::Close);
    }
}

/// Player recording rate and seek calls
#[derive(Default)]
pub struct MockPlayer {
    pub rates: Mutex<Vec<f64>>,
    pub seeks: Mutex<Vec<f64>>,
    pub position: Mutex<f64>,
}

impl MockPlayer {
    pub fn last_rate(&self) -> Option<f64> {
        self.rates.lock().last().copied()
    }
}

impl PlayerControl for MockPlayer {
    fn set_playback_rate(&self, rate: f64) {
        self.rates.lock().push(rate);
    }

    fn seek_to(&self, seconds: f64) {
        self.seeks.lock().push(seconds);
        *self.position.lock() = seconds;
    }

    fn current_time(&self) -> f64 {
        *self.position.lock()
    }
}

/// A coordinator wired to mocks, with every observable channel exposed
pub struct TestMesh {
    pub mesh: MeshCoordinator,
    pub network: MockNetwork,
    pub capture: VirtualCapture,
    pub outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub events: EventStream,
}

pub fn create_test_mesh(self_id: &str) -> TestMesh {
    create_test_mesh_with(self_id, MeshConfig::default(), VirtualCapture::new())
}

pub fn create_test_mesh_with(
    self_id: &str,
    config: MeshConfig,
    capture: VirtualCapture,
) -> TestMesh {
    let network = MockNetwork::new();
    let (sink, outbound) = ChannelSink::new();
    let (emitter, events) = EventEmitter::channel();
    let (mesh, transport_events) = MeshCoordinator::new(
        self_id,
        config,
        Arc::new(MockConnector {
            network: network.clone(),
        }),
        Arc::new(capture.clone()),
        Arc::new(sink),
        emitter,
    );
    TestMesh {
        mesh,
        network,
        capture,
        outbound,
        transport_events,
        events,
    }
}

impl TestMesh {
    /// Everything sent to the signaling server so far
    pub fn drain_outbound(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Signals sent so far, in order
    pub fn drain_signals(&mut self) -> Vec<SignalEnvelope> {
        self.drain_outbound()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Signal(envelope) => Some(envelope),
                _ => None,
            })
            .collect()
    }

    /// Feed every queued transport event back into the coordinator
    pub async fn pump_transport_events(&mut self) {
        while let Ok(event) = self.transport_events.try_recv() {
            self.mesh.handle_transport_event(event).await;
        }
    }
}

pub fn roster(ids: &[&str]) -> Vec<ParticipantRecord> {
    ids.iter()
        .map(|id| ParticipantRecord::new(*id, format!("nick-{}", id)))
        .collect()
}

pub fn candidate(text: &str) -> IceCandidate {
    IceCandidate {
        candidate: text.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

pub fn offer_from(from: &str, to: &str) -> SignalEnvelope {
    SignalEnvelope::offer(to, format!("offer-from-{}", from)).from_sender(from)
}

pub fn answer_from(from: &str, to: &str) -> SignalEnvelope {
    SignalEnvelope::answer(to, format!("answer-from-{}", from)).from_sender(from)
}

pub fn candidate_from(from: &str, to: &str, text: &str) -> SignalEnvelope {
    SignalEnvelope::ice_candidate(to, &candidate(text)).from_sender(from)
}

/// Deliver every signal `source` has sent to `target` into `target`
pub async fn relay_signals(source: &mut TestMesh, target: &TestMesh) -> usize {
    let from = source.mesh.self_id().to_string();
    let mut delivered = 0;
    for envelope in source.drain_signals() {
        if envelope.target_connection_id.as_deref() != Some(target.mesh.self_id().as_str()) {
            continue;
        }
        let envelope = envelope.from_sender(&from);
        target.mesh.handle_signal(envelope).await.unwrap();
        delivered += 1;
    }
    delivered
}

pub fn is_offer(envelope: &SignalEnvelope) -> bool {
    envelope.signal_type == SignalType::Offer
}
