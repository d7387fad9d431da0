//! Call session management
//!
//! A [`CallSessionManager`] owns exactly one peer-to-peer call: the local
//! media, the peer connection, the signaling channel and the chat log. It is
//! driven from a single task; signaling messages, engine callbacks and UI
//! commands are handled one at a time in arrival order.
//!
//! # State machine
//!
//! ```text
//!     Idle
//!       │ start
//!       ▼
//!  AcquiringMedia ──────────────┐
//!       │ media attached        │
//!       ▼                       │
//!  SignalingConnecting ─────────┤
//!       │ offer sent/received   │
//!       ▼                       ▼
//!   Negotiating ──────────────► Failed
//!       │ engine connected
//!       │ + remote stream
//!       ▼
//!   Connected ────────────────► Disconnected
//! ```
//!
//! `Disconnected` and `Failed` are terminal. A failed session is never
//! restarted; the application constructs a new one.

use crate::config::CallConfig;
use crate::media::{LocalMedia, LocalTrack, MediaDevices, UserMediaRequest};
use crate::peer::{
    IceCandidateInit, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent,
    SessionDescription,
};
use crate::signaling::{SignalingChannel, SignalingError, SignalingEvent, SignalingMessage};
use crate::types::{
    CallErrorKind, CallEvent, CallRole, ChatEntry, ConnectionState, RemoteStream, SessionId,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Call session errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Camera/microphone could not be captured
    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(String),

    /// User declined screen capture
    #[error("Screen share denied: {0}")]
    ScreenShareDenied(String),

    /// Signaling channel failed before negotiation completed
    #[error("Signaling channel error: {0}")]
    SignalingChannelError(String),

    /// Engine reported ICE/DTLS failure or rejected negotiation
    #[error("Peer connection failed: {0}")]
    PeerConnectionFailed(String),

    /// Outgoing video track could not be swapped
    #[error("Track replacement failed: {0}")]
    TrackReplacement(String),

    /// Operation not allowed in the current state
    #[error("Invalid call state: {0}")]
    InvalidState(ConnectionState),

    /// `end` was requested while starting
    #[error("Call cancelled")]
    Cancelled,
}

impl CallError {
    /// Category reported to the UI, if this error is one
    #[must_use]
    pub fn kind(&self) -> Option<CallErrorKind> {
        match self {
            Self::MediaAcquisitionFailed(_) => Some(CallErrorKind::MediaAcquisitionFailed),
            Self::ScreenShareDenied(_) => Some(CallErrorKind::ScreenShareDenied),
            Self::SignalingChannelError(_) => Some(CallErrorKind::SignalingChannelError),
            Self::PeerConnectionFailed(_) => Some(CallErrorKind::PeerConnectionFailed),
            Self::TrackReplacement(_) | Self::InvalidState(_) | Self::Cancelled => None,
        }
    }
}

/// External collaborators of a session
#[derive(Clone)]
pub struct CallBackends {
    /// Signaling channel, used for this session only
    pub signaling: Arc<dyn SignalingChannel>,
    /// Capture devices
    pub media: Arc<dyn MediaDevices>,
    /// Peer connection engine
    pub peers: Arc<dyn PeerConnectionFactory>,
}

/// User control actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCommand {
    /// Mute or unmute the microphone
    ToggleAudio,
    /// Turn the camera on or off
    ToggleVideo,
    /// Start or stop screen sharing
    ToggleScreenShare,
    /// Send a chat line
    SendChat(String),
    /// Hang up
    End,
}

/// Cloneable UI handle for a session driven by [`CallSessionManager::run`]
#[derive(Clone)]
pub struct CallController {
    commands: mpsc::UnboundedSender<CallCommand>,
    cancel: Arc<watch::Sender<bool>>,
}

impl CallController {
    /// Queue a command; returns false once the session is gone
    pub fn send(&self, command: CallCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Toggle the microphone
    pub fn toggle_audio(&self) -> bool {
        self.send(CallCommand::ToggleAudio)
    }

    /// Toggle the camera
    pub fn toggle_video(&self) -> bool {
        self.send(CallCommand::ToggleVideo)
    }

    /// Toggle screen sharing
    pub fn toggle_screen_share(&self) -> bool {
        self.send(CallCommand::ToggleScreenShare)
    }

    /// Send a chat line
    pub fn send_chat(&self, text: impl Into<String>) -> bool {
        self.send(CallCommand::SendChat(text.into()))
    }

    /// Hang up, aborting a start that is still acquiring media
    pub fn end(&self) {
        self.cancel.send_replace(true);
        let _ = self.commands.send(CallCommand::End);
    }
}

enum SessionInput {
    Signaling(Option<SignalingEvent>),
    Peer(Option<PeerEvent>),
    ScreenShareEnded,
}

/// Check a state transition against the call state machine
#[must_use]
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::{
        AcquiringMedia, Connected, Disconnected, Failed, Idle, Negotiating, SignalingConnecting,
    };
    matches!(
        (from, to),
        (Idle, AcquiringMedia)
            | (AcquiringMedia, SignalingConnecting)
            | (SignalingConnecting, Negotiating)
            | (Negotiating, Connected)
            | (AcquiringMedia | SignalingConnecting | Negotiating | Connected, Failed)
            | (
                Idle | AcquiringMedia | SignalingConnecting | Negotiating | Connected,
                Disconnected
            )
    )
}

/// Owner of one peer-to-peer call
pub struct CallSessionManager {
    session_id: SessionId,
    role: CallRole,
    config: CallConfig,
    backends: CallBackends,
    state: ConnectionState,
    peer: Option<Arc<dyn PeerConnection>>,
    local: Option<LocalMedia>,
    screen: Option<Arc<dyn LocalTrack>>,
    screen_ended: Option<oneshot::Receiver<()>>,
    remote_stream: Option<RemoteStream>,
    engine_connected: bool,
    awaiting_answer: bool,
    local_offer: Option<SessionDescription>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidateInit>,
    chat_log: Vec<ChatEntry>,
    signaling_rx: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    peer_rx: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    event_sender: broadcast::Sender<CallEvent>,
    commands_tx: mpsc::UnboundedSender<CallCommand>,
    commands_rx: Option<mpsc::UnboundedReceiver<CallCommand>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
    released: bool,
}

impl CallSessionManager {
    /// Create a session in `Idle`
    pub fn new(
        session_id: SessionId,
        role: CallRole,
        config: CallConfig,
        backends: CallBackends,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(256);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            session_id,
            role,
            config,
            backends,
            state: ConnectionState::Idle,
            peer: None,
            local: None,
            screen: None,
            screen_ended: None,
            remote_stream: None,
            engine_connected: false,
            awaiting_answer: false,
            local_offer: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            chat_log: Vec::new(),
            signaling_rx: None,
            peer_rx: None,
            event_sender,
            commands_tx,
            commands_rx: Some(commands_rx),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            on_complete: None,
            released: false,
        }
    }

    /// Register the callback invoked once when the call ends
    pub fn on_complete(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_complete = Some(Box::new(callback));
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.event_sender.subscribe()
    }

    /// UI handle for [`run`](Self::run)
    #[must_use]
    pub fn controller(&self) -> CallController {
        CallController {
            commands: self.commands_tx.clone(),
            cancel: Arc::clone(&self.cancel_tx),
        }
    }

    /// Session id
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Role in the call
    #[must_use]
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Configuration the session was built with
    #[must_use]
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Local camera and microphone, once acquired
    #[must_use]
    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local.as_ref()
    }

    /// Remote stream, once received
    #[must_use]
    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    /// Chat history for this session
    #[must_use]
    pub fn chat_log(&self) -> &[ChatEntry] {
        &self.chat_log
    }

    /// Whether the microphone is enabled
    #[must_use]
    pub fn is_audio_enabled(&self) -> bool {
        self.local.as_ref().is_some_and(|m| m.audio.is_enabled())
    }

    /// Whether the camera is enabled
    #[must_use]
    pub fn is_video_enabled(&self) -> bool {
        self.local.as_ref().is_some_and(|m| m.video.is_enabled())
    }

    /// Whether the screen replaces the camera
    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Acquire media, open signaling and, as initiator, send the offer
    ///
    /// # Errors
    ///
    /// Returns a terminal error (the session is then `Failed`), `Cancelled`
    /// if the call was ended meanwhile, or `InvalidState` if the session was
    /// already started.
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id, role = ?self.role))]
    pub async fn start(&mut self) -> Result<(), CallError> {
        if self.state != ConnectionState::Idle {
            tracing::warn!(state = ?self.state, "Session already started");
            return Err(CallError::InvalidState(self.state));
        }
        self.transition(ConnectionState::AcquiringMedia);

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peers = Arc::clone(&self.backends.peers);
        let peer = match peers.create(&self.config, peer_tx).await {
            Ok(peer) => peer,
            Err(e) => {
                return Err(self
                    .fail(CallError::PeerConnectionFailed(e.to_string()))
                    .await)
            }
        };
        self.peer = Some(Arc::clone(&peer));
        self.peer_rx = Some(peer_rx);

        let signaling = Arc::clone(&self.backends.signaling);
        let media = Arc::clone(&self.backends.media);
        let session_id = self.session_id.clone();
        let request = UserMediaRequest::from(&self.config);
        let mut cancel = self.cancel_rx.clone();

        let mut open = signaling.open(&session_id);
        let mut acquire = media.acquire_user_media(&request);
        let mut opened = None;

        tracing::debug!("Requesting camera and microphone");
        let acquired = loop {
            tokio::select! {
                result = &mut acquire => break Some(result),
                result = &mut open, if opened.is_none() => opened = Some(result),
                () = wait_cancelled(&mut cancel) => break None,
            }
        };
        drop(acquire);

        let local = match acquired {
            None => {
                drop(open);
                tracing::info!("Call ended while acquiring media");
                self.end().await;
                return Err(CallError::Cancelled);
            }
            Some(Err(e)) => {
                drop(open);
                return Err(self
                    .fail(CallError::MediaAcquisitionFailed(e.to_string()))
                    .await);
            }
            Some(Ok(local)) => local,
        };

        tracing::info!(
            audio = local.audio.id(),
            video = local.video.id(),
            "Local media acquired"
        );
        self.local = Some(local.clone());

        for track in [&local.audio, &local.video] {
            if let Err(e) = peer.add_local_track(Arc::clone(track)).await {
                drop(open);
                return Err(self
                    .fail(CallError::PeerConnectionFailed(format!(
                        "failed to attach {:?} track: {e}",
                        track.kind()
                    )))
                    .await);
            }
        }
        self.transition(ConnectionState::SignalingConnecting);

        let opened = match opened {
            Some(result) => result,
            None => {
                tokio::select! {
                    result = &mut open => result,
                    () = wait_cancelled(&mut cancel) => {
                        drop(open);
                        tracing::info!("Call ended while connecting signaling");
                        self.end().await;
                        return Err(CallError::Cancelled);
                    }
                }
            }
        };
        drop(open);

        match opened {
            Ok(rx) => self.signaling_rx = Some(rx),
            Err(e) => {
                return Err(self
                    .fail(CallError::SignalingChannelError(e.to_string()))
                    .await)
            }
        }
        tracing::debug!("Signaling channel open");

        if self.role == CallRole::Initiator {
            self.send_offer(&peer).await?;
        }
        Ok(())
    }

    async fn send_offer(&mut self, peer: &Arc<dyn PeerConnection>) -> Result<(), CallError> {
        let offer = match peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                return Err(self
                    .fail(CallError::PeerConnectionFailed(e.to_string()))
                    .await)
            }
        };
        if let Err(e) = peer.set_local_description(offer.clone()).await {
            return Err(self
                .fail(CallError::PeerConnectionFailed(e.to_string()))
                .await);
        }
        self.local_offer = Some(offer.clone());
        if let Err(e) = self.send_signal(SignalingMessage::Offer {
            session_id: String::new(),
            offer,
        }) {
            return Err(self
                .fail(CallError::SignalingChannelError(e.to_string()))
                .await);
        }
        self.awaiting_answer = true;
        self.transition(ConnectionState::Negotiating);
        Ok(())
    }

    /// Flip the microphone's `enabled` flag; returns the new value
    pub fn toggle_audio(&mut self) -> Option<bool> {
        let track = &self.local.as_ref()?.audio;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!(session_id = %self.session_id, enabled, "Audio toggled");
        Some(enabled)
    }

    /// Flip the camera's `enabled` flag; returns the new value
    pub fn toggle_video(&mut self) -> Option<bool> {
        let track = &self.local.as_ref()?.video;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!(session_id = %self.session_id, enabled, "Video toggled");
        Some(enabled)
    }

    /// Swap the outgoing video between camera and screen
    ///
    /// Returns whether the screen is shared afterwards.
    ///
    /// # Errors
    ///
    /// `ScreenShareDenied` if capture was refused (state unchanged),
    /// `TrackReplacement` if the engine rejected the swap, `InvalidState`
    /// before media is attached or after the call ended.
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn toggle_screen_share(&mut self) -> Result<bool, CallError> {
        if self.state.is_terminal() {
            return Err(CallError::InvalidState(self.state));
        }
        if self.screen.is_some() {
            self.stop_screen_share().await?;
            return Ok(false);
        }
        let Some(peer) = self.peer.clone().filter(|_| self.local.is_some()) else {
            return Err(CallError::InvalidState(self.state));
        };

        let media = Arc::clone(&self.backends.media);
        let capture = match media.acquire_display_media().await {
            Ok(capture) => capture,
            Err(e) => {
                let detail = e.to_string();
                tracing::warn!(error = %detail, "Screen share not started");
                self.emit(CallEvent::Error {
                    kind: CallErrorKind::ScreenShareDenied,
                    detail: detail.clone(),
                });
                return Err(CallError::ScreenShareDenied(detail));
            }
        };

        if let Err(e) = peer.replace_video_track(Arc::clone(&capture.track)).await {
            capture.track.stop();
            tracing::warn!(error = %e, "Failed to substitute screen track");
            return Err(CallError::TrackReplacement(e.to_string()));
        }

        tracing::info!(track = capture.track.id(), "Screen share started");
        self.screen = Some(capture.track);
        self.screen_ended = Some(capture.ended);
        self.emit(CallEvent::ScreenShareChanged { active: true });
        Ok(true)
    }

    async fn stop_screen_share(&mut self) -> Result<(), CallError> {
        let Some(screen) = self.screen.take() else {
            return Ok(());
        };
        self.screen_ended = None;

        if let (Some(peer), Some(local)) = (self.peer.clone(), self.local.clone()) {
            if let Err(e) = peer.replace_video_track(Arc::clone(&local.video)).await {
                tracing::warn!(error = %e, "Failed to restore camera track");
                self.screen = Some(screen);
                return Err(CallError::TrackReplacement(e.to_string()));
            }
        }
        screen.stop();
        tracing::info!("Screen share stopped, camera restored");
        self.emit(CallEvent::ScreenShareChanged { active: false });
        Ok(())
    }

    /// Send a chat line and append it to the log without waiting for delivery
    ///
    /// Blank text is ignored. Returns the appended entry.
    pub fn send_chat(&mut self, text: &str) -> Option<ChatEntry> {
        if text.trim().is_empty() {
            return None;
        }
        if self.signaling_rx.is_none() || self.state.is_terminal() {
            tracing::warn!(session_id = %self.session_id, state = ?self.state, "Chat dropped, signaling not open");
            return None;
        }
        let message = SignalingMessage::Chat {
            session_id: String::new(),
            message: text.to_string(),
            sender: Some(self.config.local_label.clone()),
        };
        if let Err(e) = self.send_signal(message) {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to send chat");
            return None;
        }
        let entry = ChatEntry::new(self.config.local_label.clone(), text, true);
        self.chat_log.push(entry.clone());
        Some(entry)
    }

    /// Hang up
    ///
    /// Stops every local track, closes the peer connection and the signaling
    /// channel, and invokes the completion callback. Safe to call in any
    /// state and more than once; the callback runs only the first time.
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn end(&mut self) {
        self.cancel_tx.send_replace(true);
        if !self.state.is_terminal() {
            self.transition(ConnectionState::Disconnected);
        }
        self.release_resources().await;
        if let Some(callback) = self.on_complete.take() {
            tracing::info!(state = ?self.state, "Call ended");
            callback();
        }
    }

    /// Handle every input that is ready right now; returns how many
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(input) = self.try_next_input() {
            self.handle_input(input).await;
            handled += 1;
        }
        handled
    }

    /// Drive the session until it reaches a terminal state
    ///
    /// Starts the session if needed, then handles signaling, engine events
    /// and [`CallController`] commands until the call ends.
    pub async fn run(mut self) -> ConnectionState {
        let Some(mut commands) = self.commands_rx.take() else {
            tracing::warn!(session_id = %self.session_id, "Session is already running");
            return self.state;
        };

        if self.state == ConnectionState::Idle {
            if let Err(e) = self.start().await {
                tracing::debug!(session_id = %self.session_id, error = %e, "Start did not complete");
            }
        }

        while !self.state.is_terminal() {
            tokio::select! {
                Some(command) = commands.recv() => self.apply(command).await,
                input = self.next_input() => self.handle_input(input).await,
            }
        }

        self.end().await;
        self.state
    }

    async fn apply(&mut self, command: CallCommand) {
        match command {
            CallCommand::ToggleAudio => {
                self.toggle_audio();
            }
            CallCommand::ToggleVideo => {
                self.toggle_video();
            }
            CallCommand::ToggleScreenShare => {
                if let Err(e) = self.toggle_screen_share().await {
                    tracing::debug!(error = %e, "Screen share toggle failed");
                }
            }
            CallCommand::SendChat(text) => {
                self.send_chat(&text);
            }
            CallCommand::End => self.end().await,
        }
    }

    fn try_next_input(&mut self) -> Option<SessionInput> {
        if let Some(rx) = self.signaling_rx.as_mut() {
            match rx.try_recv() {
                Ok(event) => return Some(SessionInput::Signaling(Some(event))),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Some(SessionInput::Signaling(None))
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
        }
        if let Some(rx) = self.peer_rx.as_mut() {
            match rx.try_recv() {
                Ok(event) => return Some(SessionInput::Peer(Some(event))),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Some(SessionInput::Peer(None))
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
        }
        if let Some(rx) = self.screen_ended.as_mut() {
            match rx.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => {
                    return Some(SessionInput::ScreenShareEnded)
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }
        None
    }

    async fn next_input(&mut self) -> SessionInput {
        let Self {
            signaling_rx,
            peer_rx,
            screen_ended,
            ..
        } = self;
        tokio::select! {
            biased;
            event = recv_or_pending(signaling_rx) => SessionInput::Signaling(event),
            event = recv_or_pending(peer_rx) => SessionInput::Peer(event),
            () = ended_or_pending(screen_ended) => SessionInput::ScreenShareEnded,
        }
    }

    async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Signaling(Some(SignalingEvent::Message(message))) => {
                self.handle_signaling(message).await;
            }
            SessionInput::Signaling(Some(SignalingEvent::Closed { reason })) => {
                self.handle_signaling_closed(reason).await;
            }
            SessionInput::Signaling(None) => self.handle_signaling_closed(None).await,
            SessionInput::Peer(Some(event)) => self.handle_peer_event(event).await,
            SessionInput::Peer(None) => {
                tracing::debug!(session_id = %self.session_id, "Peer event stream ended");
                self.peer_rx = None;
            }
            SessionInput::ScreenShareEnded => {
                self.screen_ended = None;
                tracing::info!(session_id = %self.session_id, "Screen capture ended by the system");
                if let Err(e) = self.stop_screen_share().await {
                    tracing::warn!(error = %e, "Could not return to camera");
                }
            }
        }
    }

    #[tracing::instrument(skip(self, message), fields(session_id = %self.session_id, message_type = message.message_type()))]
    async fn handle_signaling(&mut self, message: SignalingMessage) {
        if self.state.is_terminal() {
            tracing::trace!("Ignoring signaling after call end");
            return;
        }
        if !message.is_for(&self.session_id) {
            tracing::warn!(
                other_session = message.session_id(),
                "Dropping message for another session"
            );
            return;
        }
        tracing::debug!("Received signaling message");

        match message {
            SignalingMessage::Offer { offer, .. } => self.handle_offer(offer).await,
            SignalingMessage::Answer { answer, .. } => self.handle_answer(answer).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.handle_remote_candidate(candidate).await;
            }
            SignalingMessage::Chat {
                message, sender, ..
            } => {
                // Peers label their own lines with the same local label we use
                let label = sender
                    .filter(|s| !s.trim().is_empty() && *s != self.config.local_label)
                    .unwrap_or_else(|| self.config.remote_label.clone());
                let entry = ChatEntry::new(label, message, false);
                self.chat_log.push(entry.clone());
                self.emit(CallEvent::ChatMessageReceived { entry });
            }
            SignalingMessage::UserJoined { username, .. } => {
                tracing::info!(username = ?username, "Peer joined the call");
                self.emit(CallEvent::PeerJoined { username });
                self.resend_offer();
            }
            SignalingMessage::UserLeft { username, .. } => {
                tracing::info!(username = ?username, "Peer left the call");
                self.transition(ConnectionState::Disconnected);
                self.release_resources().await;
            }
        }
    }

    /// The relay does not hold messages for members that join later
    fn resend_offer(&self) {
        if self.role != CallRole::Initiator || !self.awaiting_answer {
            return;
        }
        let Some(offer) = self.local_offer.clone() else {
            return;
        };
        tracing::debug!("Resending offer to the joined peer");
        if let Err(e) = self.send_signal(SignalingMessage::Offer {
            session_id: String::new(),
            offer,
        }) {
            tracing::warn!(error = %e, "Failed to resend offer");
        }
    }

    async fn handle_offer(&mut self, offer: SessionDescription) {
        if self.role == CallRole::Initiator {
            tracing::warn!("Initiator ignoring remote offer");
            return;
        }
        if self.remote_description_set {
            tracing::debug!("Ignoring repeated offer");
            return;
        }
        let Some(peer) = self.peer.clone() else {
            tracing::warn!("Offer received without a peer connection");
            return;
        };
        if self.state == ConnectionState::SignalingConnecting {
            self.transition(ConnectionState::Negotiating);
        }

        if let Err(e) = peer.set_remote_description(offer).await {
            self.record_failure(&CallError::PeerConnectionFailed(e.to_string())).await;
            return;
        }
        self.remote_description_set = true;
        self.flush_candidates(&peer).await;

        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.record_failure(&CallError::PeerConnectionFailed(e.to_string())).await;
                return;
            }
        };
        if let Err(e) = peer.set_local_description(answer.clone()).await {
            self.record_failure(&CallError::PeerConnectionFailed(e.to_string())).await;
            return;
        }
        if let Err(e) = self.send_signal(SignalingMessage::Answer {
            session_id: String::new(),
            answer,
        }) {
            self.record_failure(&CallError::SignalingChannelError(e.to_string())).await;
        }
    }

    async fn handle_answer(&mut self, answer: SessionDescription) {
        if self.role != CallRole::Initiator || !self.awaiting_answer {
            tracing::warn!(role = ?self.role, "Ignoring unexpected answer");
            return;
        }
        let Some(peer) = self.peer.clone() else {
            return;
        };
        if let Err(e) = peer.set_remote_description(answer).await {
            self.record_failure(&CallError::PeerConnectionFailed(e.to_string())).await;
            return;
        }
        self.awaiting_answer = false;
        self.remote_description_set = true;
        self.flush_candidates(&peer).await;
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidateInit) {
        if !self.remote_description_set {
            tracing::debug!(
                buffered = self.pending_candidates.len() + 1,
                "Buffering ICE candidate until remote description is set"
            );
            self.pending_candidates.push(candidate);
            return;
        }
        let Some(peer) = self.peer.clone() else {
            return;
        };
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            tracing::warn!(error = %e, "Failed to add ICE candidate");
        }
    }

    async fn flush_candidates(&mut self, peer: &Arc<dyn PeerConnection>) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let buffered = std::mem::take(&mut self.pending_candidates);
        tracing::debug!(count = buffered.len(), "Applying buffered ICE candidates");
        for candidate in buffered {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!(error = %e, "Failed to add buffered ICE candidate");
            }
        }
    }

    async fn handle_signaling_closed(&mut self, reason: Option<String>) {
        self.signaling_rx = None;
        if self.state.is_terminal() {
            return;
        }
        let detail = reason.unwrap_or_else(|| "signaling channel closed".to_string());
        if self.state == ConnectionState::Connected {
            tracing::warn!(session_id = %self.session_id, reason = %detail, "Signaling closed, media path continues");
            return;
        }
        self.record_failure(&CallError::SignalingChannelError(detail)).await;
    }

    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.state.is_terminal() {
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.send_signal(SignalingMessage::IceCandidate {
                    session_id: String::new(),
                    candidate,
                }) {
                    tracing::warn!(error = %e, "Failed to send local ICE candidate");
                }
            }
            PeerEvent::RemoteTrack {
                stream_id,
                track_id,
                kind,
            } => {
                tracing::info!(stream_id = %stream_id, track_id = %track_id, kind = ?kind, "Remote track received");
                match self.remote_stream.as_mut() {
                    Some(stream) if stream.id == stream_id => stream.add_track(track_id, kind),
                    _ => {
                        let mut stream = RemoteStream::new(stream_id);
                        stream.add_track(track_id, kind);
                        self.remote_stream = Some(stream.clone());
                        self.emit(CallEvent::RemoteStreamAvailable { stream });
                    }
                }
                self.maybe_connected();
            }
            PeerEvent::ConnectionStateChanged(state) => {
                tracing::debug!(peer_state = ?state, "Peer connection state changed");
                match state {
                    PeerConnectionState::Connected => {
                        self.engine_connected = true;
                        self.maybe_connected();
                    }
                    PeerConnectionState::Disconnected => {
                        self.engine_connected = false;
                        tracing::info!("Peer connection lost");
                        self.transition(ConnectionState::Disconnected);
                        self.release_resources().await;
                    }
                    PeerConnectionState::Failed => {
                        self.engine_connected = false;
                        self.record_failure(&CallError::PeerConnectionFailed(
                                "ICE/DTLS negotiation failed".to_string(),
                            )).await;
                    }
                    PeerConnectionState::New
                    | PeerConnectionState::Connecting
                    | PeerConnectionState::Closed => {}
                }
            }
        }
    }

    fn maybe_connected(&mut self) {
        if self.engine_connected
            && self.remote_stream.is_some()
            && self.state == ConnectionState::Negotiating
        {
            self.transition(ConnectionState::Connected);
        }
    }

    fn send_signal(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let message = message.stamped(&self.session_id);
        tracing::debug!(
            session_id = %self.session_id,
            message_type = message.message_type(),
            "Sending signaling message"
        );
        self.backends.signaling.send(message)
    }

    fn transition(&mut self, to: ConnectionState) -> bool {
        let from = self.state;
        if from == to {
            return false;
        }
        if !is_valid_transition(from, to) {
            tracing::warn!(
                session_id = %self.session_id,
                old_state = ?from,
                new_state = ?to,
                "Refusing invalid state transition"
            );
            return false;
        }
        self.state = to;
        tracing::debug!(
            session_id = %self.session_id,
            old_state = ?from,
            new_state = ?to,
            "Call state transition"
        );
        self.emit(CallEvent::ConnectionStateChanged { state: to });
        true
    }

    async fn fail(&mut self, error: CallError) -> CallError {
        self.record_failure(&error).await;
        error
    }

    async fn record_failure(&mut self, error: &CallError) {
        if let Some(kind) = error.kind().filter(|k| k.is_terminal()) {
            if !self.state.is_terminal() {
                tracing::error!(session_id = %self.session_id, error = %error, "Call failed");
                self.transition(ConnectionState::Failed);
                self.emit(CallEvent::Error {
                    kind,
                    detail: error.to_string(),
                });
            }
        }
        self.release_resources().await;
    }

    async fn release_resources(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        self.screen_ended = None;
        if let Some(local) = &self.local {
            local.stop_all();
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to close peer connection");
            }
        }
        self.backends.signaling.close();
        self.signaling_rx = None;
        self.peer_rx = None;
        self.pending_candidates.clear();
        tracing::debug!(session_id = %self.session_id, "Call resources released");
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_sender.send(event);
    }
}

impl Drop for CallSessionManager {
    fn drop(&mut self) {
        if self.released || self.state == ConnectionState::Idle {
            return;
        }
        tracing::warn!(session_id = %self.session_id, "Call session dropped without end()");
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        if let Some(local) = &self.local {
            local.stop_all();
        }
        self.backends.signaling.close();
        if let Some(peer) = self.peer.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = peer.close().await;
                });
            }
        }
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn ended_or_pending(rx: &mut Option<oneshot::Receiver<()>>) {
    match rx {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
