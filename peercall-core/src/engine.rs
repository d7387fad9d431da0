//! Peer connection engine backed by the `webrtc` crate
//!
//! [`WebRtcEngineFactory`] builds one `RTCPeerConnection` per session with the
//! configured ICE servers and forwards its callbacks as [`PeerEvent`]s.
//! Local tracks must be [`SampleTrack`]s; [`SyntheticDevices`] produces them
//! for headless calls.

use crate::config::CallConfig;
use crate::media::{LocalMedia, LocalTrack, MediaDevices, MediaError, ScreenCapture, UserMediaRequest};
use crate::peer::{
    IceCandidateInit, PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerError,
    PeerEvent, SdpType, SessionDescription,
};
use crate::types::TrackKind;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Local track that writes media samples into the engine
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl SampleTrack {
    /// Create a track; `stream_id` groups tracks of one capture
    pub fn new(id: impl Into<String>, kind: TrackKind, stream_id: impl Into<String>) -> Self {
        let id = id.into();
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(codec, id.clone(), stream_id.into()));
        Self {
            id,
            kind,
            rtc,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Engine track
    #[must_use]
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Write one media sample; muted or stopped tracks drop it
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the sample
    pub async fn write(&self, data: Bytes, duration: Duration) -> Result<(), MediaError> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.rtc
            .write_sample(&sample)
            .await
            .map_err(|e| MediaError::Capture(e.to_string()))
    }
}

impl fmt::Debug for SampleTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!(track = %self.id, "Track stopped");
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn rtc_track(track: &Arc<dyn LocalTrack>) -> Result<Arc<dyn TrackLocal + Send + Sync>, PeerError> {
    track
        .as_any()
        .downcast_ref::<SampleTrack>()
        .map(|t| t.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
        .ok_or_else(|| PeerError::Track(format!("track {} is not a sample track", track.id())))
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(PeerError::Negotiation(
                "rollback descriptions are not supported".to_string(),
            ))
        }
    };
    result.map_err(|e| PeerError::Negotiation(e.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerError::Negotiation("unspecified SDP type".to_string()))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

impl From<RTCIceCandidateInit> for IceCandidateInit {
    fn from(c: RTCIceCandidateInit) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

impl From<IceCandidateInit> for RTCIceCandidateInit {
    fn from(c: IceCandidateInit) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

fn peer_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Creates `RTCPeerConnection`s
#[derive(Debug, Default, Clone)]
pub struct WebRtcEngineFactory;

impl WebRtcEngineFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        config: &CallConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Create(format!("codec registration failed: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::Create(format!("interceptor registration failed: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| PeerError::Create(e.to_string()))?,
        );
        tracing::debug!(ice_servers = config.ice_servers.len(), "Peer connection created");

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::trace!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Unspecified => return,
                };
                let _ = tx.send(PeerEvent::RemoteTrack {
                    stream_id: track.stream_id(),
                    track_id: track.id(),
                    kind,
                });
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                });
            })
        }));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(state) = peer_state(state) {
                    let _ = tx.send(PeerEvent::ConnectionStateChanged(state));
                }
            })
        }));

        Ok(Arc::new(WebRtcPeer {
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
        let rtc = rtc_track(&track)?;
        let sender = self
            .pc
            .add_track(rtc)
            .await
            .map_err(|e| PeerError::Track(e.to_string()))?;

        // Drain RTCP so interceptors keep running
        let rtcp = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().insert(track.kind(), sender);
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
        let rtc = rtc_track(&track)?;
        let sender = self
            .senders
            .lock()
            .get(&TrackKind::Video)
            .cloned()
            .ok_or_else(|| PeerError::Track("no video sender".to_string()))?;
        sender
            .replace_track(Some(rtc))
            .await
            .map_err(|e| PeerError::Track(e.to_string()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.senders.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }
}

/// Capture devices producing silent audio and blank video
///
/// Used for headless calls and loopback testing.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDevices {
    deny_screen: bool,
    screen_duration: Option<Duration>,
}

impl SyntheticDevices {
    /// Devices that grant every request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse screen capture requests
    #[must_use]
    pub fn deny_screen_share(mut self) -> Self {
        self.deny_screen = true;
        self
    }

    /// End screen captures after `duration`, as if the user stopped sharing
    #[must_use]
    pub fn with_screen_duration(mut self, duration: Duration) -> Self {
        self.screen_duration = Some(duration);
        self
    }

    fn track(kind: TrackKind, label: &str, stream_id: &str) -> Arc<SampleTrack> {
        let track = Arc::new(SampleTrack::new(
            format!("{label}-{}", uuid::Uuid::new_v4()),
            kind,
            stream_id,
        ));
        spawn_pump(Arc::clone(&track));
        track
    }
}

fn spawn_pump(track: Arc<SampleTrack>) {
    tokio::spawn(async move {
        let payload = Bytes::from_static(&[0u8; 160]);
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        while !track.is_stopped() {
            ticker.tick().await;
            if let Err(e) = track.write(payload.clone(), FRAME_INTERVAL).await {
                tracing::trace!(track = %track.id(), error = %e, "Sample dropped");
            }
        }
    });
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire_user_media(
        &self,
        request: &UserMediaRequest,
    ) -> Result<LocalMedia, MediaError> {
        if request.video.width == 0 || request.video.height == 0 {
            return Err(MediaError::Capture("empty video resolution".to_string()));
        }
        let stream_id = format!("camera-{}", uuid::Uuid::new_v4());
        tracing::debug!(
            width = request.video.width,
            height = request.video.height,
            facing_mode = %request.video.facing_mode,
            "Synthetic camera and microphone opened"
        );
        Ok(LocalMedia {
            audio: Self::track(TrackKind::Audio, "mic", &stream_id),
            video: Self::track(TrackKind::Video, "camera", &stream_id),
        })
    }

    async fn acquire_display_media(&self) -> Result<ScreenCapture, MediaError> {
        if self.deny_screen {
            return Err(MediaError::PermissionDenied(
                "screen capture declined".to_string(),
            ));
        }
        let stream_id = format!("screen-{}", uuid::Uuid::new_v4());
        let track = Self::track(TrackKind::Video, "screen", &stream_id);
        let (ended_tx, ended) = oneshot::channel();

        let watched = Arc::clone(&track);
        let duration = self.screen_duration;
        tokio::spawn(async move {
            if let Some(duration) = duration {
                tokio::time::sleep(duration).await;
                if !watched.is_stopped() {
                    watched.stop();
                    let _ = ended_tx.send(());
                }
            } else {
                // Keep the signal open until the session stops the track
                while !watched.is_stopped() {
                    tokio::time::sleep(FRAME_INTERVAL * 5).await;
                }
                drop(ended_tx);
            }
        });

        Ok(ScreenCapture { track, ended })
    }
}
