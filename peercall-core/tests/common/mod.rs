//! Mock collaborators shared by the session tests

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peercall_core::{
    CallBackends, CallConfig, CallEvent, CallRole, CallSessionManager, IceCandidateInit,
    LocalMedia, LocalTrack, MediaDevices, MediaError, PeerConnection, PeerConnectionFactory,
    PeerError, PeerEvent, ScreenCapture, SessionDescription, SessionId, SignalingChannel,
    SignalingError, SignalingEvent, SignalingMessage, TrackKind, UserMediaRequest,
};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

#[derive(Debug)]
pub struct MockTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }
}

impl LocalTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct MockDevices {
    fail_user_media: bool,
    deny_screen: bool,
    acquire_delay: Option<Duration>,
    issued: Mutex<Vec<Arc<MockTrack>>>,
    screen_ended: Mutex<Vec<oneshot::Sender<()>>>,
    screens: AtomicUsize,
}

impl MockDevices {
    /// Camera and microphone access is refused
    pub fn failing() -> Self {
        Self {
            fail_user_media: true,
            ..Self::default()
        }
    }

    /// The screen-share prompt is declined
    pub fn denying_screen() -> Self {
        Self {
            deny_screen: true,
            ..Self::default()
        }
    }

    /// Camera and microphone take `delay` to open
    pub fn slow(delay: Duration) -> Self {
        Self {
            acquire_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn issued(&self) -> Vec<Arc<MockTrack>> {
        self.issued.lock().clone()
    }

    /// Simulate the OS "stop sharing" control
    pub fn end_screen_capture(&self) {
        if let Some(tx) = self.screen_ended.lock().pop() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn acquire_user_media(
        &self,
        _request: &UserMediaRequest,
    ) -> Result<LocalMedia, MediaError> {
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_user_media {
            return Err(MediaError::PermissionDenied("camera blocked".to_string()));
        }
        let audio = MockTrack::new("mic", TrackKind::Audio);
        let video = MockTrack::new("camera", TrackKind::Video);
        self.issued.lock().extend([Arc::clone(&audio), Arc::clone(&video)]);
        Ok(LocalMedia { audio, video })
    }

    async fn acquire_display_media(&self) -> Result<ScreenCapture, MediaError> {
        if self.deny_screen {
            return Err(MediaError::PermissionDenied("user cancelled".to_string()));
        }
        let n = self.screens.fetch_add(1, Ordering::SeqCst);
        let track = MockTrack::new(&format!("screen-{n}"), TrackKind::Video);
        let (tx, ended) = oneshot::channel();
        self.issued.lock().push(Arc::clone(&track));
        self.screen_ended.lock().push(tx);
        Ok(ScreenCapture { track, ended })
    }
}

#[derive(Default)]
pub struct MockPeer {
    fail_remote_description: bool,
    log: Mutex<Vec<String>>,
    video_tracks: Mutex<Vec<String>>,
    remote_set: AtomicBool,
    closed: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

impl MockPeer {
    /// Every remote description is rejected
    pub fn rejecting_remote_description() -> Self {
        Self {
            fail_remote_description: true,
            ..Self::default()
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Ids of the tracks currently feeding the outgoing video sender
    pub fn video_tracks(&self) -> Vec<String> {
        self.video_tracks.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: PeerEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn emit_remote_track(&self) {
        self.emit(PeerEvent::RemoteTrack {
            stream_id: "remote-stream".to_string(),
            track_id: "remote-video".to_string(),
            kind: TrackKind::Video,
        });
    }

    pub fn emit_connected(&self) {
        self.emit(PeerEvent::ConnectionStateChanged(
            peercall_core::PeerConnectionState::Connected,
        ));
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn add_local_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
        self.log.lock().push(format!("add:{}", track.id()));
        if track.kind() == TrackKind::Video {
            self.video_tracks.lock().push(track.id().to_string());
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
        self.log.lock().push(format!("replace:{}", track.id()));
        let mut video = self.video_tracks.lock();
        if video.is_empty() {
            return Err(PeerError::Track("no video sender".to_string()));
        }
        *video = vec![track.id().to_string()];
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.log.lock().push("create-offer".to_string());
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.log.lock().push("create-answer".to_string());
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.log.lock().push(format!("local:{:?}", desc.sdp_type));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.log.lock().push(format!("remote:{:?}", desc.sdp_type));
        if self.fail_remote_description {
            return Err(PeerError::Negotiation("bad sdp".to_string()));
        }
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(PeerError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        self.log.lock().push(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockPeerFactory {
    pub peer: Arc<MockPeer>,
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        _config: &CallConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        *self.peer.events.lock() = Some(events);
        Ok(Arc::clone(&self.peer) as Arc<dyn PeerConnection>)
    }
}

#[derive(Default)]
pub struct MockSignaling {
    fail_open: bool,
    sent: Mutex<Vec<SignalingMessage>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<SignalingEvent>>>,
    open: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockSignaling {
    /// The relay refuses the connection
    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_of_type(&self, message_type: &str) -> Vec<SignalingMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.message_type() == message_type)
            .collect()
    }

    pub fn deliver(&self, message: SignalingMessage) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(SignalingEvent::Message(message));
        }
    }

    pub fn deliver_closed(&self) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(SignalingEvent::Closed {
                reason: Some("server went away".to_string()),
            });
        }
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for MockSignaling {
    async fn open(
        &self,
        _session_id: &SessionId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        if self.fail_open {
            return Err(SignalingError::Connect("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        self.open.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SignalingError::NotOpen);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub session: CallSessionManager,
    pub signaling: Arc<MockSignaling>,
    pub devices: Arc<MockDevices>,
    pub peer: Arc<MockPeer>,
    pub events: broadcast::Receiver<CallEvent>,
}

impl Harness {
    pub fn new(role: CallRole) -> Self {
        Self::with(role, MockSignaling::default(), MockDevices::default(), MockPeer::default())
    }

    pub fn with(
        role: CallRole,
        signaling: MockSignaling,
        devices: MockDevices,
        peer: MockPeer,
    ) -> Self {
        let signaling = Arc::new(signaling);
        let devices = Arc::new(devices);
        let peer = Arc::new(peer);
        let backends = CallBackends {
            signaling: Arc::clone(&signaling) as Arc<dyn SignalingChannel>,
            media: Arc::clone(&devices) as Arc<dyn MediaDevices>,
            peers: Arc::new(MockPeerFactory {
                peer: Arc::clone(&peer),
            }),
        };
        let session = CallSessionManager::new(
            SessionId::new("abc"),
            role,
            CallConfig::default(),
            backends,
        );
        let events = session.subscribe_events();
        Self {
            session,
            signaling,
            devices,
            peer,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn answer() -> SignalingMessage {
    SignalingMessage::Answer {
        session_id: "abc".to_string(),
        answer: SessionDescription::answer("v=0 remote-answer"),
    }
}

pub fn offer() -> SignalingMessage {
    SignalingMessage::Offer {
        session_id: "abc".to_string(),
        offer: SessionDescription::offer("v=0 remote-offer"),
    }
}

pub fn candidate(line: &str) -> SignalingMessage {
    SignalingMessage::IceCandidate {
        session_id: "abc".to_string(),
        candidate: IceCandidateInit {
            candidate: line.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        },
    }
}
