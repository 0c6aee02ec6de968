//! Signaling protocol messages
//!
//! Every frame on the wire is a JSON object `{"kind": ..., "payload": ...}`.
//! Payload field names are camelCase, matching the room server.

use serde::{Deserialize, Serialize};
use std::fmt;
use watchsync_core::{IceCandidate, SdpKind, WatchSyncError};

/// One member of the room roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    /// Opaque connection ID, unique within the room
    pub connection_id: String,
    /// Display name
    pub nickname: String,
    /// Whether this participant controls the room
    #[serde(default)]
    pub is_host: bool,
}

impl ParticipantRecord {
    /// Non-host participant
    pub fn new(connection_id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            nickname: nickname.into(),
            is_host: false,
        }
    }
}

/// Kind of WebRTC signal carried by a [`SignalEnvelope`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    /// Session description offer
    Offer,
    /// Session description answer
    Answer,
    /// Trickled ICE candidate
    IceCandidate,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalType::Offer => write!(f, "offer"),
            SignalType::Answer => write!(f, "answer"),
            SignalType::IceCandidate => write!(f, "ice-candidate"),
        }
    }
}

/// WebRTC signaling payload relayed between two participants
///
/// Outbound envelopes carry `targetConnectionId`; the relay stamps
/// `fromConnectionId` on delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    /// Signal kind
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    /// Sender connection ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_connection_id: Option<String>,
    /// Recipient connection ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_connection_id: Option<String>,
    /// Session description, for offers and answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    /// Candidate attribute line, for ICE candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    /// Media stream identification tag
    #[serde(default, rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl SignalEnvelope {
    fn blank(signal_type: SignalType, target: &str) -> Self {
        Self {
            signal_type,
            from_connection_id: None,
            target_connection_id: Some(target.to_string()),
            sdp: None,
            candidate: None,
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    /// Offer addressed to `target`
    pub fn offer(target: &str, sdp: impl Into<String>) -> Self {
        Self {
            sdp: Some(sdp.into()),
            ..Self::blank(SignalType::Offer, target)
        }
    }

    /// Answer addressed to `target`
    pub fn answer(target: &str, sdp: impl Into<String>) -> Self {
        Self {
            sdp: Some(sdp.into()),
            ..Self::blank(SignalType::Answer, target)
        }
    }

    /// Candidate addressed to `target`
    pub fn ice_candidate(target: &str, candidate: &IceCandidate) -> Self {
        Self {
            candidate: Some(candidate.candidate.clone()),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            ..Self::blank(SignalType::IceCandidate, target)
        }
    }

    /// Stamp the sender, as the relay does on delivery
    pub fn from_sender(mut self, sender: &str) -> Self {
        self.from_connection_id = Some(sender.to_string());
        self
    }

    /// Sender connection ID, required on inbound envelopes
    pub fn sender(&self) -> Result<&str, WatchSyncError> {
        self.from_connection_id
            .as_deref()
            .ok_or_else(|| self.malformed("missing fromConnectionId"))
    }

    /// Session description kind and text of an offer or answer
    pub fn description(&self) -> Result<(SdpKind, &str), WatchSyncError> {
        let kind = match self.signal_type {
            SignalType::Offer => SdpKind::Offer,
            SignalType::Answer => SdpKind::Answer,
            SignalType::IceCandidate => {
                return Err(self.malformed("ice-candidate carries no session description"))
            }
        };
        let sdp = self
            .sdp
            .as_deref()
            .ok_or_else(|| self.malformed("missing sdp"))?;
        Ok((kind, sdp))
    }

    /// Candidate carried by an ice-candidate envelope
    pub fn to_candidate(&self) -> Result<IceCandidate, WatchSyncError> {
        if self.signal_type != SignalType::IceCandidate {
            return Err(self.malformed("not an ice-candidate"));
        }
        let candidate = self
            .candidate
            .clone()
            .ok_or_else(|| self.malformed("missing candidate"))?;
        Ok(IceCandidate {
            candidate,
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
        })
    }

    fn malformed(&self, reason: &str) -> WatchSyncError {
        WatchSyncError::InvalidMessage {
            message: format!("{} envelope", self.signal_type),
            source: reason.to_string().into(),
        }
    }
}

/// Camera/microphone broadcast state of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraStateMessage {
    /// Announcing participant
    pub connection_id: String,
    /// Whether the participant is broadcasting
    pub enabled: bool,
}

/// How a [`SyncCorrection`] must be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrectionType {
    /// Play at a corrected rate to re-converge
    RateAdjust,
    /// Jump to an absolute position
    Seek,
    /// Return to normal speed
    RateReset,
}

impl fmt::Display for CorrectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrectionType::RateAdjust => write!(f, "RATE_ADJUST"),
            CorrectionType::Seek => write!(f, "SEEK"),
            CorrectionType::RateReset => write!(f, "RATE_RESET"),
        }
    }
}

/// Server-issued directive to correct local playback drift
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCorrection {
    /// Reference position in seconds
    pub target_time_seconds: f64,
    /// Playback rate to apply
    pub playback_rate: f64,
    /// How to apply the correction
    pub correction_type: CorrectionType,
}

impl SyncCorrection {
    /// Play at `rate` until further notice
    pub fn rate_adjust(target_time_seconds: f64, rate: f64) -> Self {
        Self {
            target_time_seconds,
            playback_rate: rate,
            correction_type: CorrectionType::RateAdjust,
        }
    }

    /// Jump to `target_time_seconds` at normal speed
    pub fn seek(target_time_seconds: f64) -> Self {
        Self {
            target_time_seconds,
            playback_rate: 1.0,
            correction_type: CorrectionType::Seek,
        }
    }

    /// Return to normal speed
    pub fn rate_reset() -> Self {
        Self {
            target_time_seconds: 0.0,
            playback_rate: 1.0,
            correction_type: CorrectionType::RateReset,
        }
    }

    /// Check the value constraints: finite target >= 0, finite rate > 0
    pub fn validate(&self) -> Result<(), WatchSyncError> {
        if !self.target_time_seconds.is_finite() || self.target_time_seconds < 0.0 {
            return Err(WatchSyncError::InvalidCorrection {
                reason: format!("target time {} is negative", self.target_time_seconds),
            });
        }
        if !self.playback_rate.is_finite() || self.playback_rate <= 0.0 {
            return Err(WatchSyncError::InvalidCorrection {
                reason: format!("playback rate {} is not positive", self.playback_rate),
            });
        }
        Ok(())
    }
}

/// Periodic local position report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReport {
    /// Local player position in seconds
    pub current_time_seconds: f64,
}

/// Authoritative playback state of the room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPlaybackState {
    /// Room code
    pub room_code: String,
    /// Video being watched, if any
    #[serde(default)]
    pub current_video_url: Option<String>,
    /// Reference position in seconds
    pub current_time_seconds: f64,
    /// Whether the room is playing
    pub is_playing: bool,
}

/// Connection ID assigned by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    /// Own connection ID
    pub connection_id: String,
}

/// Frames received from the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum InboundMessage {
    /// Own connection ID
    Welcome(Welcome),
    /// Full current membership
    Roster(Vec<ParticipantRecord>),
    /// Camera state announcement
    CameraState(CameraStateMessage),
    /// Relayed WebRTC signal
    Signal(SignalEnvelope),
    /// Drift correction for this participant
    SyncCorrection(SyncCorrection),
    /// Authoritative playback state
    RoomState(RoomPlaybackState),
    /// The socket dropped; raised by the client, never sent by the server
    #[serde(skip)]
    ConnectionLost,
    /// The socket is open again; raised by the client, never sent by the server
    #[serde(skip)]
    Reconnected {
        /// Connection attempts it took
        attempts: u32,
    },
}

impl InboundMessage {
    /// Decode one JSON frame
    pub fn from_json(text: &str) -> Result<Self, WatchSyncError> {
        serde_json::from_str(text).map_err(|e| WatchSyncError::InvalidMessage {
            message: text.to_string(),
            source: e.into(),
        })
    }

    /// Frame kind, as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Welcome(_) => "welcome",
            InboundMessage::Roster(_) => "roster",
            InboundMessage::CameraState(_) => "camera-state",
            InboundMessage::Signal(_) => "signal",
            InboundMessage::SyncCorrection(_) => "sync-correction",
            InboundMessage::RoomState(_) => "room-state",
            InboundMessage::ConnectionLost => "connection-lost",
            InboundMessage::Reconnected { .. } => "reconnected",
        }
    }
}

/// Frames sent to the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum OutboundMessage {
    /// WebRTC signal to relay
    Signal(SignalEnvelope),
    /// Own camera state
    CameraState(CameraStateMessage),
    /// Own playback position
    PositionReport(PositionReport),
    /// Ask for a fresh authoritative room state
    RequestSync,
}

impl OutboundMessage {
    /// Encode as one JSON frame
    pub fn to_json(&self) -> Result<String, WatchSyncError> {
        serde_json::to_string(self).map_err(|e| WatchSyncError::Signaling {
            reason: format!("failed to encode frame: {}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let envelope = SignalEnvelope::ice_candidate("peer-b", &candidate);
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["targetConnectionId"], "peer-b");
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("fromConnectionId").is_none());
    }

    #[test]
    fn test_inbound_envelope_from_relay() {
        let text = r#"{"kind":"signal","payload":{"type":"offer","fromConnectionId":"peer-a","sdp":"v=0","candidate":null,"sdpMid":null,"sdpMLineIndex":null}}"#;
        let message = InboundMessage::from_json(text).unwrap();
        let InboundMessage::Signal(envelope) = message else {
            panic!("Expected signal frame");
        };
        assert_eq!(envelope.sender().unwrap(), "peer-a");
        assert_eq!(envelope.description().unwrap(), (SdpKind::Offer, "v=0"));
        assert!(envelope.to_candidate().is_err());
    }

    #[test]
    fn test_envelope_missing_fields() {
        let mut envelope = SignalEnvelope::answer("peer-b", "v=0");
        envelope.sdp = None;
        assert_eq!(
            envelope.description().unwrap_err().error_code(),
            "INVALID_MESSAGE"
        );
        assert!(envelope.sender().is_err());
    }

    #[test]
    fn test_correction_wire_format() {
        let text = r#"{"targetTimeSeconds":42.5,"playbackRate":1.05,"correctionType":"RATE_ADJUST"}"#;
        let correction: SyncCorrection = serde_json::from_str(text).unwrap();
        assert_eq!(correction, SyncCorrection::rate_adjust(42.5, 1.05));
        assert!(correction.validate().is_ok());

        let reset = serde_json::to_value(SyncCorrection::rate_reset()).unwrap();
        assert_eq!(reset["correctionType"], "RATE_RESET");
        assert_eq!(reset["playbackRate"], 1.0);
    }

    #[test]
    fn test_correction_validation() {
        assert!(SyncCorrection::seek(-1.0).validate().is_err());
        assert!(SyncCorrection::rate_adjust(10.0, 0.0).validate().is_err());
        assert!(SyncCorrection::rate_adjust(10.0, f64::NAN).validate().is_err());
        assert!(SyncCorrection::seek(0.0).validate().is_ok());
    }

    #[test]
    fn test_outbound_frames() {
        let json = OutboundMessage::RequestSync.to_json().unwrap();
        assert_eq!(json, r#"{"kind":"request-sync"}"#);

        let json = OutboundMessage::PositionReport(PositionReport {
            current_time_seconds: 12.0,
        })
        .to_json()
        .unwrap();
        assert_eq!(
            json,
            r#"{"kind":"position-report","payload":{"currentTimeSeconds":12.0}}"#
        );
    }

    #[test]
    fn test_roster_frame() {
        let text = r#"{"kind":"roster","payload":[{"connectionId":"a","nickname":"Ann","isHost":true},{"connectionId":"b","nickname":"Bob"}]}"#;
        let InboundMessage::Roster(roster) = InboundMessage::from_json(text).unwrap() else {
            panic!("Expected roster frame");
        };
        assert_eq!(roster.len(), 2);
        assert!(roster[0].is_host);
        assert_eq!(roster[1], ParticipantRecord::new("b", "Bob"));
    }

    #[test]
    fn test_malformed_frame() {
        let error = InboundMessage::from_json(r#"{"kind":"unknown"}"#).unwrap_err();
        assert_eq!(error.error_code(), "INVALID_MESSAGE");
    }

    #[test]
    fn test_connection_notices_are_not_wire_frames() {
        assert!(InboundMessage::from_json(r#"{"kind":"connection-lost"}"#).is_err());
        assert!(
            InboundMessage::from_json(r#"{"kind":"reconnected","payload":{"attempts":1}}"#)
                .is_err()
        );
        assert_eq!(InboundMessage::ConnectionLost.kind(), "connection-lost");
    }
}
