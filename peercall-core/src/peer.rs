//! Peer connection abstraction
//!
//! The session manager drives ICE, DTLS and SRTP through this trait and never
//! touches an engine directly. The `engine` module provides the `webrtc`
//! crate implementation; tests provide their own.

use crate::config::CallConfig;
use crate::media::LocalTrack;
use crate::types::TrackKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    /// Engine could not be created
    #[error("Failed to create peer connection: {0}")]
    Create(String),

    /// SDP could not be created or applied
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// ICE candidate rejected
    #[error("ICE candidate error: {0}")]
    Candidate(String),

    /// Track could not be attached or replaced
    #[error("Track error: {0}")]
    Track(String),

    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,
}

/// SDP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
    /// Provisional answer
    Pranswer,
    /// Rollback
    Rollback,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    /// Candidate line
    pub candidate: String,
    /// Media stream id
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Engine-reported connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerConnectionState {
    /// Not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media path established
    Connected,
    /// Connectivity lost
    Disconnected,
    /// ICE or DTLS failed
    Failed,
    /// Closed locally
    Closed,
}

/// Callbacks from the engine, delivered as events
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate was gathered
    LocalCandidate(IceCandidateInit),
    /// A remote track arrived
    RemoteTrack {
        /// Stream the track belongs to
        stream_id: String,
        /// Track id
        track_id: String,
        /// Track kind
        kind: TrackKind,
    },
    /// Engine connection state changed
    ConnectionStateChanged(PeerConnectionState),
}

/// One peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach a local track as a new outgoing sender
    async fn add_local_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError>;

    /// Swap the track feeding the outgoing video sender without renegotiating
    async fn replace_video_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError>;

    /// Create an SDP offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an SDP answer for the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply the local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply the remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Add a remote candidate; requires the remote description
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError>;

    /// Close the connection, aborting ICE gathering
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer connections for sessions
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection whose callbacks are delivered on `events`
    async fn create(
        &self,
        config: &CallConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_description_matches_browser_shape() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn test_candidate_field_names() {
        let json = r#"{"candidate":"candidate:1 1 UDP 2122260223 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidateInit = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());

        let back = serde_json::to_string(&candidate).unwrap();
        assert!(back.contains("\"sdpMLineIndex\":0"));
    }
}
