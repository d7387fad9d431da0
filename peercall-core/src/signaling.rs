//! Call signaling protocol
//!
//! Carries SDP offers/answers, ICE candidates, chat and presence between the
//! two participants of a session. One channel serves exactly one session.

use crate::peer::{IceCandidateInit, SessionDescription};
use crate::types::SessionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Channel has not been opened
    #[error("Signaling channel is not open")]
    NotOpen,

    /// Channel was closed
    #[error("Signaling channel closed")]
    Closed,

    /// Connecting to the relay failed
    #[error("Connect error: {0}")]
    Connect(String),

    /// Message could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Signaling message schema
///
/// Serialized as JSON objects discriminated by `type`. Presence messages
/// produced by the relay may omit `sessionId`, so it defaults to empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// SDP offer
    Offer {
        /// Session ID
        #[serde(rename = "sessionId", default)]
        session_id: String,
        /// Offer description
        offer: SessionDescription,
    },

    /// SDP answer
    Answer {
        /// Session ID
        #[serde(rename = "sessionId", default)]
        session_id: String,
        /// Answer description
        answer: SessionDescription,
    },

    /// ICE candidate
    IceCandidate {
        /// Session ID
        #[serde(rename = "sessionId", default)]
        session_id: String,
        /// Candidate
        candidate: IceCandidateInit,
    },

    /// Chat line
    Chat {
        /// Session ID
        #[serde(rename = "sessionId", default)]
        session_id: String,
        /// Message text
        message: String,
        /// Sender label
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },

    /// Another participant joined the room
    UserJoined {
        /// Session ID
        #[serde(rename = "sessionId", default)]
        session_id: String,
        /// Username, when the relay provides one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },

    /// Another participant left the room
    UserLeft {
        /// Session ID
        #[serde(rename = "sessionId", default)]
        session_id: String,
        /// Username, when the relay provides one
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
}

impl SignalingMessage {
    /// Get the session ID
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Offer { session_id, .. }
            | Self::Answer { session_id, .. }
            | Self::IceCandidate { session_id, .. }
            | Self::Chat { session_id, .. }
            | Self::UserJoined { session_id, .. }
            | Self::UserLeft { session_id, .. } => session_id,
        }
    }

    /// Return the message with its session ID replaced
    #[must_use]
    pub fn stamped(mut self, id: &SessionId) -> Self {
        match &mut self {
            Self::Offer { session_id, .. }
            | Self::Answer { session_id, .. }
            | Self::IceCandidate { session_id, .. }
            | Self::Chat { session_id, .. }
            | Self::UserJoined { session_id, .. }
            | Self::UserLeft { session_id, .. } => *session_id = id.as_str().to_string(),
        }
        self
    }

    /// Whether the message belongs to the given session
    ///
    /// Messages without a session ID are accepted; the channel is already
    /// scoped to one room.
    #[must_use]
    pub fn is_for(&self, id: &SessionId) -> bool {
        let sid = self.session_id();
        sid.is_empty() || sid == id.as_str()
    }

    /// Wire name of the message type
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Chat { .. } => "chat",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
        }
    }

    /// Encode as a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a known message
    pub fn from_json(s: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Inbound side of an open channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Message from the other participant or the relay
    Message(SignalingMessage),
    /// Channel ended
    Closed {
        /// Why the channel ended, if known
        reason: Option<String>,
    },
}

/// Signaling channel scoped to one session
///
/// `open` resolves once the channel is usable and hands back the inbound
/// event queue. Messages that arrive before the session reads the queue stay
/// buffered in it.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Open the channel for a session
    async fn open(
        &self,
        session_id: &SessionId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError>;

    /// Queue a message for delivery
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Close the channel; safe to call more than once
    fn close(&self);

    /// Whether the channel is open
    fn is_open(&self) -> bool;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalingMessage::Offer {
            session_id: "abc".to_string(),
            offer: SessionDescription::offer("v=0\r\n"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "offer",
                "sessionId": "abc",
                "offer": {"type": "offer", "sdp": "v=0\r\n"}
            })
        );
    }

    #[test]
    fn test_ice_candidate_tag() {
        let msg = SignalingMessage::IceCandidate {
            session_id: "abc".to_string(),
            candidate: IceCandidateInit {
                candidate: "candidate:1".to_string(),
                ..Default::default()
            },
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"ice-candidate\""));
        assert_eq!(SignalingMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_relay_presence_without_session_id() {
        let msg = SignalingMessage::from_json(
            r#"{"type":"user-left","user_id":7,"username":"mentor"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SignalingMessage::UserLeft {
                session_id: String::new(),
                username: Some("mentor".to_string()),
            }
        );
        assert!(msg.is_for(&SessionId::new("any")));
    }

    #[test]
    fn test_chat_without_sender() {
        let msg =
            SignalingMessage::from_json(r#"{"type":"chat","sessionId":"s","message":"hi"}"#)
                .unwrap();
        assert!(matches!(msg, SignalingMessage::Chat { sender: None, .. }));
    }

    #[test]
    fn test_stamp_and_scope() {
        let msg = SignalingMessage::Chat {
            session_id: String::new(),
            message: "hello".to_string(),
            sender: Some("You".to_string()),
        }
        .stamped(&SessionId::new("room-1"));
        assert_eq!(msg.session_id(), "room-1");
        assert!(msg.is_for(&SessionId::new("room-1")));
        assert!(!msg.is_for(&SessionId::new("room-2")));
        assert_eq!(msg.message_type(), "chat");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = SignalingMessage::from_json(r#"{"type":"hangup","sessionId":"s"}"#);
        assert!(matches!(err, Err(SignalingError::Encode(_))));
    }
}
