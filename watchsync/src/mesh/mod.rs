//! Peer mesh coordinator
//!
//! Owns one [`PeerLink`] per remote participant and drives every link
//! through offer/answer/candidate exchange. All per-peer state sits behind a
//! single `parking_lot` mutex that is never held across an `.await`; every
//! operation on a link additionally holds that link's operation lock for its
//! whole duration, so two operations never interleave on the same peer while
//! different peers proceed concurrently.
//!
//! Asynchronous steps re-check liveness (same link, same epoch) before
//! applying their results. A link that was closed, or whose transport was
//! replaced, turns every in-flight step into a no-op.

mod link;
pub mod reconcile;

pub(crate) use link::PeerLink;
pub use link::{NegotiationState, PeerLinkInfo};

use crate::config::MeshConfig;
use crate::event::{Event, EventEmitter, GlareOutcome};
use crate::participant::{find_participant, CameraStateMap, RemoteStream, UNKNOWN_NICKNAME};
use futures::future::join_all;
use parking_lot::Mutex;
use reconcile::{plan_links, remote_streams, LinkSummary};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as OpLock, OwnedMutexGuard};
use tracing::{debug, info, warn};
use watchsync_core::{
    IceCandidate, LinkConnectionState, LinkEventSender, LocalMedia, LocalTrack, PeerConnector,
    PeerTransport, SdpKind, TrackKind, TransportEvent, TransportEventKind, WatchSyncError,
};
use watchsync_media::MediaCapture;
use watchsync_signaling::{
    CameraStateMessage, OutboundMessage, ParticipantRecord, SignalEnvelope, SignalType,
    SignalingSink,
};

type OpGuard = OwnedMutexGuard<()>;

/// Why a negotiation step stopped early
enum StepError {
    /// The link was closed or its transport replaced
    Gone,
    /// The step failed; the link must be torn down
    Failed(WatchSyncError),
}

impl StepError {
    fn failed(connection_id: &str, error: WatchSyncError) -> Self {
        StepError::Failed(link_error(connection_id, error))
    }
}

type Step<T> = Result<T, StepError>;

fn link_error(connection_id: &str, error: WatchSyncError) -> WatchSyncError {
    if error.is_link_scoped() {
        error
    } else {
        WatchSyncError::negotiation(connection_id, error)
    }
}

enum Admission {
    Existing(Arc<OpLock<()>>),
    Fresh {
        epoch: u64,
        guard: Option<OpGuard>,
        media: Option<LocalMedia>,
    },
    Refused(usize),
}

enum OfferDecision {
    KeepLocal,
    Swap {
        epoch: u64,
        stale: Option<Arc<dyn PeerTransport>>,
    },
    Accept {
        epoch: u64,
    },
}

#[derive(Default)]
struct MeshState {
    /// Own connection ID; replaced when the server reassigns it
    self_id: String,
    /// Bumped by every `stop()`
    generation: u64,
    next_epoch: u64,
    starting: bool,
    local_media: Option<LocalMedia>,
    media_error: Option<String>,
    roster: Vec<ParticipantRecord>,
    camera_states: CameraStateMap,
    links: HashMap<String, PeerLink>,
    orphan_candidates: HashMap<String, VecDeque<IceCandidate>>,
}

impl MeshState {
    fn allocate_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn live_link(&mut self, connection_id: &str, epoch: u64) -> Option<&mut PeerLink> {
        self.links
            .get_mut(connection_id)
            .filter(|link| link.epoch == epoch)
    }

    /// Reserve a link, returning its epoch and its already-held operation lock
    fn insert_link(&mut self, connection_id: &str) -> (u64, Option<OpGuard>) {
        let epoch = self.allocate_epoch();
        let nickname = find_participant(&self.roster, connection_id)
            .map(|p| p.nickname.clone())
            .unwrap_or_else(|| UNKNOWN_NICKNAME.to_string());
        let pending = self
            .orphan_candidates
            .remove(connection_id)
            .unwrap_or_default();
        let link = PeerLink::new(connection_id, nickname, epoch, pending);
        let guard = link.op_lock.clone().try_lock_owned().ok();
        self.links.insert(connection_id.to_string(), link);
        (epoch, guard)
    }

    /// Forget orphan candidates of peers no longer in the roster
    fn prune_orphans(&mut self) {
        let roster = &self.roster;
        let before = self.orphan_candidates.len();
        self.orphan_candidates
            .retain(|id, _| find_participant(roster, id).is_some());
        let dropped = before - self.orphan_candidates.len();
        if dropped > 0 {
            debug!("Dropped buffered candidates of {} departed peers", dropped);
        }
    }

    fn buffer_orphan(&mut self, connection_id: &str, candidate: IceCandidate, limit: usize) {
        let queue = self
            .orphan_candidates
            .entry(connection_id.to_string())
            .or_default();
        if queue.len() >= limit {
            warn!(
                "Dropping candidate from {}: {} already buffered",
                connection_id, limit
            );
            return;
        }
        queue.push_back(candidate);
        debug!(
            "Buffered candidate from {} ahead of its link ({} pending)",
            connection_id,
            queue.len()
        );
    }
}

/// Full-mesh peer connection coordinator
#[derive(Clone)]
pub struct MeshCoordinator {
    inner: Arc<MeshInner>,
}

struct MeshInner {
    config: MeshConfig,
    connector: Arc<dyn PeerConnector>,
    capture: Arc<dyn MediaCapture>,
    signaling: Arc<dyn SignalingSink>,
    events: EventEmitter,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    streams: watch::Sender<Vec<RemoteStream>>,
    state: Mutex<MeshState>,
}

impl MeshCoordinator {
    /// Create a coordinator for the local participant `self_id`
    ///
    /// The returned receiver carries transport events; feed each one to
    /// [`MeshCoordinator::handle_transport_event`].
    pub fn new(
        self_id: impl Into<String>,
        config: MeshConfig,
        connector: Arc<dyn PeerConnector>,
        capture: Arc<dyn MediaCapture>,
        signaling: Arc<dyn SignalingSink>,
        events: EventEmitter,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (streams, _) = watch::channel(Vec::new());
        let inner = MeshInner {
            config,
            connector,
            capture,
            signaling,
            events,
            transport_tx,
            streams,
            state: Mutex::new(MeshState {
                self_id: self_id.into(),
                ..MeshState::default()
            }),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            transport_rx,
        )
    }

    /// Own connection ID
    pub fn self_id(&self) -> String {
        self.inner.self_id()
    }

    /// Mesh configuration
    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    /// Acquire local media, announce it and connect to the current roster
    ///
    /// On failure nothing is left behind: no media, no links. A `stop()`
    /// issued while media is being acquired makes this return `Cancelled`
    /// and releases whatever was acquired.
    pub async fn start(&self) -> Result<(), WatchSyncError> {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.local_media.is_some() {
                debug!("Local media already active");
                return Ok(());
            }
            if state.starting {
                return Err(WatchSyncError::InvalidState {
                    expected: "inactive".to_string(),
                    actual: "starting".to_string(),
                });
            }
            state.starting = true;
            state.media_error = None;
            state.generation
        };

        let acquired = self.inner.capture.acquire(&self.inner.config.media).await;

        let media = {
            let mut state = self.inner.state.lock();
            let current = state.generation == generation;
            if current {
                state.starting = false;
            }
            match acquired {
                Err(error) => {
                    let error = WatchSyncError::from(error);
                    let reason = match &error {
                        WatchSyncError::MediaAccess { reason } => reason.clone(),
                        other => other.to_string(),
                    };
                    if current {
                        state.media_error = Some(reason.clone());
                    }
                    drop(state);
                    warn!("Failed to start local media: {}", reason);
                    self.inner.events.emit(Event::MediaAccessFailed { reason });
                    return Err(error);
                }
                Ok(media) if !current => {
                    drop(state);
                    info!("Local media acquired after stop(); releasing it");
                    media.stop();
                    return Err(WatchSyncError::Cancelled {
                        operation: "start".to_string(),
                    });
                }
                Ok(media) => {
                    state.local_media = Some(media.clone());
                    media
                }
            }
        };

        info!("Local media started (stream {})", media.stream_id());
        self.inner.events.emit(Event::LocalMediaStarted {
            stream_id: media.stream_id().to_string(),
        });
        self.inner.announce_camera_state(true).await;
        self.reconcile().await;
        Ok(())
    }

    /// Close every link, release local media and clear derived state
    ///
    /// Safe to call at any time, including when never started. All state is
    /// detached before the first suspension point, so in-flight negotiation
    /// steps find their links gone.
    pub async fn stop(&self) {
        let (links, media, was_active) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            let was_active = state.local_media.is_some() || state.starting;
            state.starting = false;
            state.media_error = None;
            state.orphan_candidates.clear();
            let links: Vec<PeerLink> = state.links.drain().map(|(_, link)| link).collect();
            let media = state.local_media.take();
            self.inner.publish_streams(&state);
            (links, media, was_active)
        };

        if let Some(media) = &media {
            media.stop();
        }
        if !links.is_empty() {
            info!("Closing {} peer links", links.len());
        }
        join_all(
            links
                .iter()
                .filter_map(|link| link.transport.clone())
                .map(|transport| async move { transport.close().await }),
        )
        .await;
        for link in links {
            self.inner.events.emit(Event::PeerLinkClosed {
                connection_id: link.connection_id,
                reason: "local media stopped".to_string(),
            });
        }

        if was_active {
            self.inner.announce_camera_state(false).await;
        }
        if media.is_some() {
            info!("Local media stopped");
            self.inner.events.emit(Event::LocalMediaStopped);
        }
    }

    /// Flip the camera track and re-announce camera state, returning the new state
    pub async fn toggle_camera(&self) -> Result<bool, WatchSyncError> {
        let track = self.local_track(TrackKind::Video)?;
        let enabled = track.toggle();
        info!("Camera {}", if enabled { "enabled" } else { "disabled" });
        self.inner.events.emit(Event::CameraToggled { enabled });
        self.inner.announce_camera_state(enabled).await;
        Ok(enabled)
    }

    /// Flip the microphone track, returning the new state
    pub fn toggle_mic(&self) -> Result<bool, WatchSyncError> {
        let track = self.local_track(TrackKind::Audio)?;
        let enabled = track.toggle();
        info!("Microphone {}", if enabled { "enabled" } else { "disabled" });
        self.inner.events.emit(Event::MicrophoneToggled { enabled });
        Ok(enabled)
    }

    fn local_track(&self, kind: TrackKind) -> Result<Arc<LocalTrack>, WatchSyncError> {
        let state = self.inner.state.lock();
        let media = state
            .local_media
            .as_ref()
            .ok_or_else(|| WatchSyncError::InvalidState {
                expected: "local media active".to_string(),
                actual: "inactive".to_string(),
            })?;
        media
            .track(kind)
            .cloned()
            .ok_or_else(|| WatchSyncError::MediaAccess {
                reason: format!("no {} track was captured", kind),
            })
    }

    /// Replace the roster; call [`MeshCoordinator::reconcile`] afterwards
    ///
    /// Camera states and buffered candidates of departed peers are dropped.
    pub fn set_roster(&self, roster: Vec<ParticipantRecord>) {
        let mut state = self.inner.state.lock();
        if state.camera_states.retain_present(&roster) {
            debug!("Dropped camera state of departed participants");
        }
        state.roster = roster;
        state.prune_orphans();
    }

    /// Replace the roster and reconcile
    pub async fn update_roster(&self, roster: Vec<ParticipantRecord>) {
        self.set_roster(roster);
        self.reconcile().await;
    }

    /// Record a camera-state announcement, returning whether anything changed
    ///
    /// Announcements about the local participant are ignored.
    pub fn apply_camera_state(&self, message: &CameraStateMessage) -> bool {
        let mut state = self.inner.state.lock();
        if message.connection_id == state.self_id {
            debug!("Ignoring camera state announcement about self");
            return false;
        }
        state.camera_states.apply(message)
    }

    /// Record a camera-state announcement and reconcile if it changed anything
    pub async fn update_camera_state(&self, message: &CameraStateMessage) {
        if self.apply_camera_state(message) {
            self.reconcile().await;
        }
    }

    /// Continue under a connection ID newly assigned by the server
    ///
    /// Every link belongs to the old identity, so the mesh is stopped first.
    /// The old ID is dropped from the roster, local media is restarted if it
    /// was active and the mesh is reconciled under the new ID.
    pub async fn rejoin(&self, connection_id: impl Into<String>) -> Result<(), WatchSyncError> {
        let connection_id = connection_id.into();
        let was_active = {
            let state = self.inner.state.lock();
            state.local_media.is_some() || state.starting
        };
        self.stop().await;

        let previous = {
            let mut state = self.inner.state.lock();
            let previous = std::mem::replace(&mut state.self_id, connection_id.clone());
            state.roster.retain(|p| p.connection_id != previous);
            previous
        };
        info!("Rejoining mesh as {} (was {})", connection_id, previous);

        if was_active {
            self.start().await
        } else {
            self.reconcile().await;
            Ok(())
        }
    }

    /// Bring the set of links in line with the roster and local media state
    pub async fn reconcile(&self) {
        let inner = &self.inner;
        let (closed, created, renegotiated, media) = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            let media = state.local_media.clone();

            let existing: Vec<LinkSummary> = state
                .links
                .values()
                .map(|link| LinkSummary {
                    connection_id: &link.connection_id,
                    has_local_tracks_attached: link.has_local_tracks_attached,
                })
                .collect();
            let plan = plan_links(
                &state.self_id,
                &state.roster,
                &existing,
                media.is_some(),
                inner.config.max_remote_links(),
            );
            if !plan.is_empty() {
                debug!(
                    "Reconcile plan: close {:?}, create {:?}, renegotiate {:?}",
                    plan.close, plan.create, plan.renegotiate
                );
            }

            for participant in &state.roster {
                if let Some(link) = state.links.get_mut(&participant.connection_id) {
                    link.nickname = participant.nickname.clone();
                }
            }

            let closed: Vec<PeerLink> = plan
                .close
                .iter()
                .filter_map(|id| state.links.remove(id))
                .collect();
            let created: Vec<(String, u64, Option<OpGuard>)> = plan
                .create
                .iter()
                .map(|id| {
                    let (epoch, guard) = state.insert_link(id);
                    (id.clone(), epoch, guard)
                })
                .collect();
            let renegotiated: Vec<(String, u64, Arc<OpLock<()>>)> = plan
                .renegotiate
                .iter()
                .filter_map(|id| {
                    state
                        .links
                        .get(id)
                        .map(|link| (id.clone(), link.epoch, link.op_lock.clone()))
                })
                .collect();

            inner.publish_streams(state);
            (closed, created, renegotiated, media)
        };

        for link in &closed {
            info!("Closing link to {}: left the roster", link.connection_id);
        }
        join_all(
            closed
                .iter()
                .filter_map(|link| link.transport.clone())
                .map(|transport| async move { transport.close().await }),
        )
        .await;
        for link in closed {
            inner.events.emit(Event::PeerLinkClosed {
                connection_id: link.connection_id,
                reason: "left the roster".to_string(),
            });
        }

        let Some(media) = media else {
            return;
        };
        let creations = created
            .into_iter()
            .map(|(id, epoch, guard)| inner.initiate(id, epoch, guard, media.clone()));
        let renegotiations = renegotiated
            .into_iter()
            .map(|(id, epoch, op_lock)| inner.renegotiate(id, epoch, op_lock, media.clone()));
        futures::join!(join_all(creations), join_all(renegotiations));
    }

    /// Process one relayed offer, answer or candidate
    ///
    /// Only malformed envelopes produce an error; failures scoped to one
    /// link are logged and absorbed.
    pub async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<(), WatchSyncError> {
        let from = envelope.sender()?.to_string();
        if from == self.inner.self_id() {
            debug!("Ignoring {} from self", envelope.signal_type);
            return Ok(());
        }
        match envelope.signal_type {
            SignalType::Offer => {
                let (_, sdp) = envelope.description()?;
                self.inner.handle_offer(&from, sdp).await;
            }
            SignalType::Answer => {
                let (_, sdp) = envelope.description()?;
                self.inner.handle_answer(&from, sdp).await;
            }
            SignalType::IceCandidate => {
                let candidate = envelope.to_candidate()?;
                self.inner.handle_remote_candidate(&from, candidate).await;
            }
        }
        Ok(())
    }

    /// Process one notification raised by a link's transport
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        let TransportEvent {
            connection_id,
            link_epoch,
            kind,
        } = event;
        let inner = &self.inner;
        match kind {
            TransportEventKind::LocalCandidate(candidate) => {
                if !inner.is_live(&connection_id, link_epoch) {
                    debug!("Dropping local candidate of stale link to {}", connection_id);
                    return;
                }
                inner
                    .send_signal(SignalEnvelope::ice_candidate(&connection_id, &candidate))
                    .await;
            }
            TransportEventKind::StateChanged(connection_state) => {
                inner
                    .on_connection_state(&connection_id, link_epoch, connection_state)
                    .await;
            }
            TransportEventKind::TrackAdded(track) => {
                let mut state = inner.state.lock();
                let added = state
                    .live_link(&connection_id, link_epoch)
                    .map(|link| link.add_remote_track(track));
                match added {
                    Some(true) => {
                        debug!("Remote track from {}", connection_id);
                        inner.publish_streams(&state);
                    }
                    Some(false) => {}
                    None => debug!("Ignoring track of stale link to {}", connection_id),
                }
            }
        }
    }

    /// Whether local media is active
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().local_media.is_some()
    }

    /// Whether the camera track is currently sending
    pub fn is_camera_on(&self) -> bool {
        self.track_enabled(TrackKind::Video)
    }

    /// Whether the microphone track is currently sending
    pub fn is_mic_on(&self) -> bool {
        self.track_enabled(TrackKind::Audio)
    }

    fn track_enabled(&self, kind: TrackKind) -> bool {
        self.inner
            .state
            .lock()
            .local_media
            .as_ref()
            .and_then(|media| media.track(kind).map(|track| track.is_enabled()))
            .unwrap_or(false)
    }

    /// Local media handle, if active
    pub fn local_media(&self) -> Option<LocalMedia> {
        self.inner.state.lock().local_media.clone()
    }

    /// Reason the last `start()` failed, cleared by the next attempt
    pub fn media_error(&self) -> Option<String> {
        self.inner.state.lock().media_error.clone()
    }

    /// Current aggregated remote-stream list
    pub fn remote_streams(&self) -> Vec<RemoteStream> {
        self.inner.streams.borrow().clone()
    }

    /// Watch the aggregated remote-stream list
    pub fn subscribe_remote_streams(&self) -> watch::Receiver<Vec<RemoteStream>> {
        self.inner.streams.subscribe()
    }

    /// Snapshot of every link, ordered by connection ID
    pub fn links(&self) -> Vec<PeerLinkInfo> {
        let state = self.inner.state.lock();
        let mut links: Vec<PeerLinkInfo> = state.links.values().map(PeerLink::info).collect();
        links.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        links
    }

    /// Snapshot of one link
    pub fn link(&self, connection_id: &str) -> Option<PeerLinkInfo> {
        self.inner
            .state
            .lock()
            .links
            .get(connection_id)
            .map(PeerLink::info)
    }

    /// Number of open links
    pub fn link_count(&self) -> usize {
        self.inner.state.lock().links.len()
    }

    /// Current roster
    pub fn roster(&self) -> Vec<ParticipantRecord> {
        self.inner.state.lock().roster.clone()
    }

    /// Current camera-state map
    pub fn camera_states(&self) -> CameraStateMap {
        self.inner.state.lock().camera_states.clone()
    }

    /// Candidates buffered for a peer that has no link yet
    pub fn orphan_candidate_count(&self, connection_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .orphan_candidates
            .get(connection_id)
            .map_or(0, VecDeque::len)
    }
}

impl MeshInner {
    fn is_live(&self, connection_id: &str, epoch: u64) -> bool {
        self.state.lock().live_link(connection_id, epoch).is_some()
    }

    fn live<R>(
        &self,
        connection_id: &str,
        epoch: u64,
        f: impl FnOnce(&mut PeerLink) -> R,
    ) -> Step<R> {
        let mut state = self.state.lock();
        state
            .live_link(connection_id, epoch)
            .map(f)
            .ok_or(StepError::Gone)
    }

    fn publish_streams(&self, state: &MeshState) {
        let streams = remote_streams(state.links.values(), &state.camera_states);
        let changed = self.streams.send_if_modified(|current| {
            if *current == streams {
                return false;
            }
            *current = streams.clone();
            true
        });
        if changed {
            self.events.emit(Event::RemoteStreamsChanged {
                peers: streams.into_iter().map(|s| s.connection_id).collect(),
            });
        }
    }

    fn self_id(&self) -> String {
        self.state.lock().self_id.clone()
    }

    async fn announce_camera_state(&self, enabled: bool) {
        let message = OutboundMessage::CameraState(CameraStateMessage {
            connection_id: self.self_id(),
            enabled,
        });
        if let Err(e) = self.signaling.send(message).await {
            warn!("Failed to announce camera state: {}", e);
        }
    }

    async fn send_signal(&self, envelope: SignalEnvelope) {
        let signal_type = envelope.signal_type;
        if let Err(e) = self.signaling.send(OutboundMessage::Signal(envelope)).await {
            warn!("Failed to send {}: {}", signal_type, e);
        }
    }

    async fn finish(&self, connection_id: &str, epoch: u64, result: Step<()>) {
        match result {
            Ok(()) => {}
            Err(StepError::Gone) => {
                debug!(
                    "Link to {} closed or replaced; discarding in-flight result",
                    connection_id
                );
            }
            Err(StepError::Failed(error)) => self.fail_link(connection_id, epoch, error).await,
        }
    }

    /// Tear down one link after a link-scoped failure
    async fn fail_link(&self, connection_id: &str, epoch: u64, error: WatchSyncError) {
        let removed = {
            let mut state = self.state.lock();
            if state.live_link(connection_id, epoch).is_none() {
                return;
            }
            let removed = state.links.remove(connection_id);
            self.publish_streams(&state);
            removed
        };
        let Some(mut link) = removed else {
            return;
        };
        warn!("{} [{}]", error, error.error_code());
        link.state = NegotiationState::Closed;
        if let Some(transport) = link.transport.take() {
            transport.close().await;
        }
        self.events.emit(Event::PeerLinkClosed {
            connection_id: link.connection_id,
            reason: error.to_string(),
        });
    }

    /// Create the transport of a reserved link
    async fn open_transport(
        &self,
        connection_id: &str,
        epoch: u64,
        initiator: bool,
    ) -> Step<Arc<dyn PeerTransport>> {
        let events = LinkEventSender::new(connection_id, epoch, self.transport_tx.clone());
        let transport = self
            .connector
            .connect(connection_id, events)
            .await
            .map_err(|e| StepError::failed(connection_id, e))?;

        let stored = self.live(connection_id, epoch, |link| {
            link.transport = Some(transport.clone());
        });
        if stored.is_err() {
            transport.close().await;
            return Err(StepError::Gone);
        }
        info!(
            "Opened link to {} ({})",
            connection_id,
            if initiator { "initiator" } else { "answerer" }
        );
        self.events.emit(Event::PeerLinkOpened {
            connection_id: connection_id.to_string(),
            initiator,
        });
        Ok(transport)
    }

    async fn attach_tracks(
        &self,
        connection_id: &str,
        epoch: u64,
        transport: &Arc<dyn PeerTransport>,
        media: &LocalMedia,
    ) -> Step<()> {
        transport
            .attach_local_tracks(media)
            .await
            .map_err(|e| StepError::failed(connection_id, e))?;
        self.live(connection_id, epoch, |link| {
            link.has_local_tracks_attached = true;
        })
    }

    async fn send_offer(
        &self,
        connection_id: &str,
        epoch: u64,
        transport: &Arc<dyn PeerTransport>,
    ) -> Step<()> {
        let sdp = transport
            .create_offer()
            .await
            .map_err(|e| StepError::failed(connection_id, e))?;
        self.live(connection_id, epoch, |link| {
            link.state = NegotiationState::OfferSent;
        })?;
        info!("Sending offer to {}", connection_id);
        self.send_signal(SignalEnvelope::offer(connection_id, sdp))
            .await;
        Ok(())
    }

    async fn initiate(
        &self,
        connection_id: String,
        epoch: u64,
        guard: Option<OpGuard>,
        media: LocalMedia,
    ) {
        let _guard = match guard {
            Some(guard) => guard,
            None => {
                let op_lock = self
                    .state
                    .lock()
                    .live_link(&connection_id, epoch)
                    .map(|link| link.op_lock.clone());
                match op_lock {
                    Some(op_lock) => op_lock.lock_owned().await,
                    None => return,
                }
            }
        };
        let result = async {
            let transport = self.open_transport(&connection_id, epoch, true).await?;
            self.attach_tracks(&connection_id, epoch, &transport, &media)
                .await?;
            self.send_offer(&connection_id, epoch, &transport).await
        }
        .await;
        self.finish(&connection_id, epoch, result).await;
    }

    async fn renegotiate(
        &self,
        connection_id: String,
        epoch: u64,
        op_lock: Arc<OpLock<()>>,
        media: LocalMedia,
    ) {
        let _guard = op_lock.lock_owned().await;
        let result = async {
            let transport = self.live(&connection_id, epoch, |link| {
                let settled = matches!(
                    link.state,
                    NegotiationState::AnswerSent | NegotiationState::Connected
                );
                if settled && !link.has_local_tracks_attached {
                    link.transport.clone()
                } else {
                    None
                }
            })?;
            let Some(transport) = transport else {
                debug!("No renegotiation needed for {}", connection_id);
                return Ok(());
            };
            info!("Renegotiating with {} to send local media", connection_id);
            self.attach_tracks(&connection_id, epoch, &transport, &media)
                .await?;
            self.send_offer(&connection_id, epoch, &transport).await
        }
        .await;
        self.finish(&connection_id, epoch, result).await;
    }

    async fn handle_offer(&self, from: &str, sdp: &str) {
        loop {
            let admission = {
                let mut state = self.state.lock();
                if let Some(link) = state.links.get(from) {
                    Admission::Existing(link.op_lock.clone())
                } else if state.links.len() >= self.config.max_remote_links() {
                    Admission::Refused(state.links.len())
                } else {
                    let (epoch, guard) = state.insert_link(from);
                    Admission::Fresh {
                        epoch,
                        guard,
                        media: state.local_media.clone(),
                    }
                }
            };

            let op_lock = match admission {
                Admission::Refused(count) => {
                    warn!(
                        "Ignoring offer from {}: mesh already has {} links",
                        from, count
                    );
                    self.state.lock().orphan_candidates.remove(from);
                    return;
                }
                Admission::Fresh {
                    epoch,
                    guard: Some(_guard),
                    media,
                } => {
                    let result = self.accept_offer(from, epoch, sdp, media.as_ref()).await;
                    self.finish(from, epoch, result).await;
                    return;
                }
                Admission::Fresh { guard: None, .. } => continue,
                Admission::Existing(op_lock) => op_lock,
            };

            let _guard = op_lock.clone().lock_owned().await;
            let (decision, media) = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let current = state
                    .links
                    .get(from)
                    .filter(|link| Arc::ptr_eq(&link.op_lock, &op_lock))
                    .map(|link| (link.epoch, link.state));
                let decision = match current {
                    None => None,
                    Some((_, NegotiationState::OfferSent)) if state.self_id.as_str() < from => {
                        Some(OfferDecision::KeepLocal)
                    }
                    Some((_, NegotiationState::OfferSent)) => {
                        let epoch = state.allocate_epoch();
                        let stale = state
                            .links
                            .get_mut(from)
                            .and_then(|link| link.replace_transport(epoch));
                        Some(OfferDecision::Swap { epoch, stale })
                    }
                    Some((epoch, _)) => Some(OfferDecision::Accept { epoch }),
                };
                (decision, state.local_media.clone())
            };
            let Some(decision) = decision else {
                continue;
            };

            let epoch = match decision {
                OfferDecision::KeepLocal => {
                    info!("Glare with {}: keeping own offer, ignoring theirs", from);
                    self.events.emit(Event::GlareResolved {
                        connection_id: from.to_string(),
                        outcome: GlareOutcome::KeptLocal,
                    });
                    return;
                }
                OfferDecision::Swap { epoch, stale } => {
                    info!("Glare with {}: discarding own offer, accepting theirs", from);
                    if let Some(transport) = stale {
                        transport.close().await;
                    }
                    self.events.emit(Event::GlareResolved {
                        connection_id: from.to_string(),
                        outcome: GlareOutcome::AcceptedRemote,
                    });
                    epoch
                }
                OfferDecision::Accept { epoch } => epoch,
            };
            let result = self.accept_offer(from, epoch, sdp, media.as_ref()).await;
            self.finish(from, epoch, result).await;
            return;
        }
    }

    /// Apply a remote offer and answer it; caller holds the link's operation lock
    async fn accept_offer(
        &self,
        from: &str,
        epoch: u64,
        sdp: &str,
        media: Option<&LocalMedia>,
    ) -> Step<()> {
        let existing = self.live(from, epoch, |link| link.transport.clone())?;
        let transport = match existing {
            Some(transport) => transport,
            None => self.open_transport(from, epoch, false).await?,
        };

        if let Some(media) = media {
            let attached = self.live(from, epoch, |link| link.has_local_tracks_attached)?;
            if !attached {
                self.attach_tracks(from, epoch, &transport, media).await?;
            }
        }

        transport
            .set_remote_description(SdpKind::Offer, sdp)
            .await
            .map_err(|e| StepError::failed(from, e))?;
        self.flush_candidates(from, epoch, &transport).await?;

        let answer = transport
            .create_answer()
            .await
            .map_err(|e| StepError::failed(from, e))?;
        self.live(from, epoch, |link| {
            link.state = if link.transport_connected {
                NegotiationState::Connected
            } else {
                NegotiationState::AnswerSent
            };
        })?;
        info!("Sending answer to {}", from);
        self.send_signal(SignalEnvelope::answer(from, answer)).await;
        Ok(())
    }

    async fn handle_answer(&self, from: &str, sdp: &str) {
        let handle = self
            .state
            .lock()
            .links
            .get(from)
            .map(|link| (link.epoch, link.op_lock.clone()));
        let Some((epoch, op_lock)) = handle else {
            debug!("Ignoring answer from {}: no link", from);
            return;
        };
        let _guard = op_lock.lock_owned().await;
        let result = async {
            let transport = self.live(from, epoch, |link| {
                if link.state == NegotiationState::OfferSent {
                    link.transport.clone()
                } else {
                    None
                }
            })?;
            let Some(transport) = transport else {
                warn!("Dropping answer from {}: no offer outstanding", from);
                return Ok(());
            };
            transport
                .set_remote_description(SdpKind::Answer, sdp)
                .await
                .map_err(|e| StepError::failed(from, e))?;
            self.live(from, epoch, |link| {
                link.state = NegotiationState::Connected;
            })?;
            info!("Applied answer from {}", from);
            self.flush_candidates(from, epoch, &transport).await
        }
        .await;
        self.finish(from, epoch, result).await;
    }

    /// Mark the remote description applied and apply buffered candidates in arrival order
    async fn flush_candidates(
        &self,
        connection_id: &str,
        epoch: u64,
        transport: &Arc<dyn PeerTransport>,
    ) -> Step<()> {
        let pending = self.live(connection_id, epoch, PeerLink::remote_description_applied)?;
        if !pending.is_empty() {
            debug!(
                "Flushing {} buffered candidates for {}",
                pending.len(),
                connection_id
            );
        }
        for candidate in pending {
            if !self.is_live(connection_id, epoch) {
                return Err(StepError::Gone);
            }
            self.apply_candidate(connection_id, transport, &candidate)
                .await;
        }
        Ok(())
    }

    async fn apply_candidate(
        &self,
        connection_id: &str,
        transport: &Arc<dyn PeerTransport>,
        candidate: &IceCandidate,
    ) {
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            let error = match e {
                e @ WatchSyncError::IceApplication { .. } => e,
                other => WatchSyncError::IceApplication {
                    connection_id: connection_id.to_string(),
                    reason: other.to_string(),
                },
            };
            warn!("{}", error);
        }
    }

    async fn handle_remote_candidate(&self, from: &str, candidate: IceCandidate) {
        let limit = self.config.max_buffered_candidates;
        loop {
            let op_lock = {
                let mut state = self.state.lock();
                match state.links.get(from) {
                    Some(link) => link.op_lock.clone(),
                    None => {
                        state.buffer_orphan(from, candidate, limit);
                        return;
                    }
                }
            };

            let _guard = op_lock.clone().lock_owned().await;
            let transport = {
                let mut state = self.state.lock();
                let Some(link) = state
                    .links
                    .get_mut(from)
                    .filter(|link| Arc::ptr_eq(&link.op_lock, &op_lock))
                else {
                    continue;
                };
                match (&link.transport, link.has_remote_description) {
                    (Some(transport), true) => Some(transport.clone()),
                    _ => {
                        if link.buffer_candidate(candidate.clone(), limit) {
                            debug!("Buffered candidate from {} until its remote description", from);
                        } else {
                            warn!("Dropping candidate from {}: {} already buffered", from, limit);
                        }
                        None
                    }
                }
            };
            if let Some(transport) = transport {
                self.apply_candidate(from, &transport, &candidate).await;
            }
            return;
        }
    }

    async fn on_connection_state(
        &self,
        connection_id: &str,
        epoch: u64,
        connection_state: LinkConnectionState,
    ) {
        if connection_state.is_terminal() {
            if !self.is_live(connection_id, epoch) {
                debug!("Ignoring {} of stale link to {}", connection_state, connection_id);
                return;
            }
            info!("Transport to {} reported {}", connection_id, connection_state);
            self.fail_link(
                connection_id,
                epoch,
                WatchSyncError::TransportClosed {
                    connection_id: connection_id.to_string(),
                },
            )
            .await;
            return;
        }

        let mut state = self.state.lock();
        let Some(link) = state.live_link(connection_id, epoch) else {
            debug!("Ignoring {} of stale link to {}", connection_state, connection_id);
            return;
        };
        debug!("Transport to {} is {}", connection_id, connection_state);
        if connection_state == LinkConnectionState::Connected {
            link.transport_connected = true;
            if link.state == NegotiationState::AnswerSent {
                link.state = NegotiationState::Connected;
            }
        }
    }
}
