//! Call session types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the signaling room a call lives in
///
/// Supplied by the application (typically the booked mentorship session id)
/// and never changed for the lifetime of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a session id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which side of the call sends the initial offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Sends the SDP offer once local media is attached
    Initiator,
    /// Waits for an incoming offer and answers it
    Responder,
}

/// Connection state of a call session
///
/// ```text
///   Idle ─► AcquiringMedia ─► SignalingConnecting ─► Negotiating ─► Connected ─► Disconnected
///                │                    │                   │             │
///                └────────────────────┴─────────┬─────────┴─────────────┘
///                                               ▼
///                                             Failed
/// ```
///
/// `Disconnected` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Constructed, `start` not called yet
    Idle,
    /// Waiting for camera and microphone
    AcquiringMedia,
    /// Media attached, waiting for the signaling channel to open
    SignalingConnecting,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Engine connected and remote media bound
    Connected,
    /// Call ended or peer left
    Disconnected,
    /// Call failed
    Failed,
}

impl ConnectionState {
    /// Terminal states never transition again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AcquiringMedia => "acquiring-media",
            Self::SignalingConnecting => "signaling-connecting",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera or screen video
    Video,
}

/// One line of the in-call chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    /// Local identifier
    pub id: Uuid,
    /// Display label of the sender
    pub sender_label: String,
    /// Message text
    pub text: String,
    /// When the entry was appended locally
    pub timestamp: DateTime<Utc>,
    /// Whether this side sent it
    pub local: bool,
}

impl ChatEntry {
    /// Create an entry stamped with the current time
    pub fn new(sender_label: impl Into<String>, text: impl Into<String>, local: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_label: sender_label.into(),
            text: text.into(),
            timestamp: Utc::now(),
            local,
        }
    }
}

/// A remote track as reported by the peer connection engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrackInfo {
    /// Track id
    pub id: String,
    /// Track kind
    pub kind: TrackKind,
}

/// Remote media stream
///
/// The engine owns the media; the session only keeps this reference for
/// display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    /// Stream id
    pub id: String,
    /// Tracks received on this stream so far
    pub tracks: Vec<RemoteTrackInfo>,
}

impl RemoteStream {
    /// Create an empty stream
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Record a track, ignoring duplicates
    pub fn add_track(&mut self, id: impl Into<String>, kind: TrackKind) {
        let id = id.into();
        if !self.tracks.iter().any(|t| t.id == id) {
            self.tracks.push(RemoteTrackInfo { id, kind });
        }
    }

    /// Check whether the stream carries a track of the given kind
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Error categories reported to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallErrorKind {
    /// Camera/microphone denied or busy
    MediaAcquisitionFailed,
    /// User declined the screen-share prompt
    ScreenShareDenied,
    /// Signaling channel failed before negotiation completed
    SignalingChannelError,
    /// ICE/DTLS failure reported by the engine
    PeerConnectionFailed,
}

impl CallErrorKind {
    /// Terminal errors end the session in `Failed`
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::ScreenShareDenied)
    }
}

/// Events emitted by the session manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// Connection state changed
    ConnectionStateChanged {
        /// New state
        state: ConnectionState,
    },
    /// Chat message received from the peer
    ChatMessageReceived {
        /// The appended entry
        entry: ChatEntry,
    },
    /// Remote media became available
    RemoteStreamAvailable {
        /// The remote stream
        stream: RemoteStream,
    },
    /// The other participant joined the room
    PeerJoined {
        /// Username reported by the relay, if any
        username: Option<String>,
    },
    /// Outgoing video switched between camera and screen
    ScreenShareChanged {
        /// Whether the screen is being shared
        active: bool,
    },
    /// An error occurred
    Error {
        /// Error category
        kind: CallErrorKind,
        /// Human readable detail
        detail: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(!ConnectionState::Idle.is_terminal());
    }

    #[test]
    fn test_remote_stream_dedup() {
        let mut stream = RemoteStream::new("remote");
        stream.add_track("a1", TrackKind::Audio);
        stream.add_track("a1", TrackKind::Audio);
        stream.add_track("v1", TrackKind::Video);
        assert_eq!(stream.tracks.len(), 2);
        assert!(stream.has_kind(TrackKind::Video));
    }

    #[test]
    fn test_error_kind_terminality() {
        assert!(!CallErrorKind::ScreenShareDenied.is_terminal());
        assert!(CallErrorKind::MediaAcquisitionFailed.is_terminal());
        assert!(CallErrorKind::SignalingChannelError.is_terminal());
        assert!(CallErrorKind::PeerConnectionFailed.is_terminal());
    }

    #[test]
    fn test_session_id_serializes_as_string() {
        let id = SessionId::new("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        assert_eq!(id.to_string(), "abc");
    }
}
