//! PeerCall - one-to-one video calls over WebRTC
//!
//! This library manages the lifecycle of a single peer-to-peer call:
//!
//! - **Session state machine**: `Idle` through `Connected`, ending in
//!   `Disconnected` or `Failed`
//! - **Relay signaling**: SDP and ICE exchange over a session-scoped channel
//!   (WebSocket or in-process)
//! - **Media controls**: mute, camera toggle, screen share with automatic
//!   fallback to the camera
//! - **In-call chat**: optimistic local echo, history per session
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let backends = CallBackends {
//!     signaling: Arc::new(WebSocketChannel::new("ws://localhost:8000")),
//!     media: Arc::new(SyntheticDevices::new()),
//!     peers: Arc::new(WebRtcEngineFactory::new()),
//! };
//! let session = CallSessionManager::new(
//!     SessionId::new("abc"),
//!     CallRole::Initiator,
//!     CallConfig::default(),
//!     backends,
//! );
//! let controller = session.controller();
//! let mut events = session.subscribe_events();
//!
//! tokio::spawn(session.run());
//! while let Ok(event) = events.recv().await {
//!     if let CallEvent::ConnectionStateChanged { state } = event {
//!         if state == ConnectionState::Connected {
//!             controller.send_chat("hello");
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and events
pub mod types;

/// Call configuration
pub mod config;

/// Signaling protocol and channel trait
pub mod signaling;

/// In-process signaling relay
pub mod room;

/// Local media acquisition
pub mod media;

/// Peer connection abstraction
pub mod peer;

/// Call session state machine
pub mod session;

/// Control overlay visibility
pub mod controls;

/// `webrtc` crate engine (requires webrtc-engine feature)
#[cfg(feature = "webrtc-engine")]
pub mod engine;

/// WebSocket signaling client (requires websocket feature)
#[cfg(feature = "websocket")]
pub mod websocket;

// Re-export main types at crate root
pub use config::{AudioConstraints, CallConfig, ConfigError, IceServer, VideoConstraints};
pub use controls::ControlsAutoHide;
#[cfg(feature = "webrtc-engine")]
pub use engine::{SampleTrack, SyntheticDevices, WebRtcEngineFactory};
pub use media::{LocalMedia, LocalTrack, MediaDevices, MediaError, ScreenCapture, UserMediaRequest};
pub use peer::{
    IceCandidateInit, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerError,
    PeerEvent, SdpType, SessionDescription,
};
pub use room::{RoomChannel, SignalingHub};
pub use session::{
    is_valid_transition, CallBackends, CallCommand, CallController, CallError, CallSessionManager,
};
pub use signaling::{SignalingChannel, SignalingError, SignalingEvent, SignalingMessage};
pub use types::*;
#[cfg(feature = "websocket")]
pub use websocket::{video_call_url, WebSocketChannel};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{CallConfig, IceServer};
    #[cfg(feature = "webrtc-engine")]
    pub use crate::engine::{SyntheticDevices, WebRtcEngineFactory};
    pub use crate::room::SignalingHub;
    pub use crate::session::{CallBackends, CallCommand, CallController, CallSessionManager};
    pub use crate::signaling::{SignalingChannel, SignalingMessage};
    pub use crate::types::{
        CallErrorKind, CallEvent, CallRole, ChatEntry, ConnectionState, SessionId,
    };
    #[cfg(feature = "websocket")]
    pub use crate::websocket::WebSocketChannel;
}
