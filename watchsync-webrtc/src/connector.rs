//! Peer connection factory

use crate::fanout::TrackFanout;
use crate::peer::WebRtcPeer;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use watchsync_core::{LinkEventSender, PeerConnector, PeerTransport, WatchSyncError};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// Creates one [`WebRtcPeer`] per remote participant
///
/// All peers share one API instance and one [`TrackFanout`], so each local
/// track is encoded once no matter how many links carry it.
pub struct WebRtcConnector {
    api: API,
    config: RTCConfiguration,
    fanout: TrackFanout,
}

impl WebRtcConnector {
    /// Build a connector using the given STUN/TURN server URLs
    pub fn new(ice_servers: &[String]) -> Result<Self, WatchSyncError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WatchSyncError::Initialization {
                reason: format!("failed to register codecs: {}", e),
            })?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| WatchSyncError::Initialization {
                reason: format!("failed to register interceptors: {}", e),
            })?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        info!("WebRTC connector ready with {} ICE servers", ice_servers.len());

        Ok(Self {
            api,
            config,
            fanout: TrackFanout::new(),
        })
    }

    /// Shared outbound tracks; encoders write samples here
    pub fn fanout(&self) -> &TrackFanout {
        &self.fanout
    }

    /// Configured ICE server URLs
    pub fn ice_servers(&self) -> Vec<String> {
        self.config
            .ice_servers
            .iter()
            .flat_map(|server| server.urls.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        connection_id: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerTransport>, WatchSyncError> {
        let pc = self
            .api
            .new_peer_connection(self.config.clone())
            .await
            .map_err(|e| {
                WatchSyncError::negotiation(
                    connection_id,
                    format!("failed to create peer connection: {}", e),
                )
            })?;
        debug!(
            "Created peer connection to {} (epoch {})",
            connection_id,
            events.link_epoch()
        );
        Ok(Arc::new(WebRtcPeer::new(
            connection_id,
            Arc::new(pc),
            self.fanout.clone(),
            events,
        )))
    }
}
