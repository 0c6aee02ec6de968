//! One WebRTC peer connection behind the [`PeerTransport`] trait

use crate::fanout::TrackFanout;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use watchsync_core::{
    IceCandidate, LinkConnectionState, LinkEventSender, LocalMedia, PeerTransport,
    RemoteTrackInfo, SdpKind, TrackKind, WatchSyncError,
};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Peer connection to one remote participant
pub struct WebRtcPeer {
    connection_id: String,
    pc: Arc<RTCPeerConnection>,
    fanout: TrackFanout,
    attached: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    pub(crate) fn new(
        connection_id: &str,
        pc: Arc<RTCPeerConnection>,
        fanout: TrackFanout,
        events: LinkEventSender,
    ) -> Self {
        wire_events(&pc, events);
        Self {
            connection_id: connection_id.to_string(),
            pc,
            fanout,
            attached: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Remote connection ID
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Underlying peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    fn ensure_open(&self) -> Result<(), WatchSyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WatchSyncError::TransportClosed {
                connection_id: self.connection_id.clone(),
            });
        }
        Ok(())
    }

    fn negotiation_error(&self, what: &str, error: webrtc::Error) -> WatchSyncError {
        WatchSyncError::negotiation(&self.connection_id, format!("{}: {}", what, error))
    }
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(LinkConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkConnectionState::Closed),
        _ => None,
    }
}

fn wire_events(pc: &RTCPeerConnection, events: LinkEventSender) {
    let candidates = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidates.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => events.local_candidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                }),
                Err(e) => warn!(
                    "Failed to serialize local candidate for {}: {}",
                    events.connection_id(),
                    e
                ),
            }
        })
    }));

    let states = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = states.clone();
        Box::pin(async move {
            debug!("Peer connection to {} is {}", events.connection_id(), state);
            if let Some(state) = link_state(state) {
                events.state_changed(state);
            }
        })
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let events = events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Audio => TrackKind::Audio,
                    other => {
                        warn!("Ignoring remote track of kind {:?}", other);
                        return;
                    }
                };
                events.track_added(RemoteTrackInfo {
                    track_id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                });
            })
        },
    ));
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn attach_local_tracks(&self, media: &LocalMedia) -> Result<(), WatchSyncError> {
        self.ensure_open()?;
        for track in media.tracks() {
            if !self.attached.lock().insert(track.id().to_string()) {
                continue;
            }
            let shared = self.fanout.track_for(&track, media.stream_id());
            let added = self
                .pc
                .add_track(shared.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await;
            let sender = match added {
                Ok(sender) => sender,
                Err(e) => {
                    self.attached.lock().remove(track.id());
                    return Err(self.negotiation_error(&format!("add {} track", track.kind()), e));
                }
            };
            debug!("Attached {} track {} to {}", track.kind(), track.id(), self.connection_id);

            // RTCP has to be drained for the interceptors to run
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, WatchSyncError> {
        self.ensure_open()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| self.negotiation_error("create offer", e))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| self.negotiation_error("set local offer", e))?;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, WatchSyncError> {
        self.ensure_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| self.negotiation_error("create answer", e))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| self.negotiation_error("set local answer", e))?;
        Ok(sdp)
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), WatchSyncError> {
        self.ensure_open()?;
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| self.negotiation_error(&format!("parse remote {}", kind), e))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| self.negotiation_error(&format!("apply remote {}", kind), e))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), WatchSyncError> {
        self.ensure_open()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| WatchSyncError::IceApplication {
                connection_id: self.connection_id.clone(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            warn!("Closing peer connection to {} failed: {}", self.connection_id, e);
        }
        self.fanout.prune();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            link_state(RTCPeerConnectionState::Connected),
            Some(LinkConnectionState::Connected)
        );
        assert_eq!(
            link_state(RTCPeerConnectionState::Failed),
            Some(LinkConnectionState::Failed)
        );
        assert_eq!(link_state(RTCPeerConnectionState::Unspecified), None);
    }
}
