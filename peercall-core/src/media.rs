//! Local media acquisition
//!
//! The session owns every local track it acquires. Tracks are handed to the
//! peer connection by reference but only the session stops them.

use crate::config::{AudioConstraints, CallConfig, VideoConstraints};
use crate::types::TrackKind;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// User or platform refused access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device in use by another application
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Any other capture failure
    #[error("Capture error: {0}")]
    Capture(String),
}

/// A local capture track
///
/// `enabled` mutes a track without detaching it; `stop` releases the capture
/// device for good.
pub trait LocalTrack: Send + Sync + fmt::Debug {
    /// Track id
    fn id(&self) -> &str;

    /// Track kind
    fn kind(&self) -> TrackKind;

    /// Whether media flows
    fn is_enabled(&self) -> bool;

    /// Enable or mute the track
    fn set_enabled(&self, enabled: bool);

    /// Release the capture device
    fn stop(&self);

    /// Whether `stop` was called
    fn is_stopped(&self) -> bool;

    /// Downcast hook for engines that need their concrete track type
    fn as_any(&self) -> &dyn Any;
}

/// Camera and microphone captured for a call
#[derive(Debug, Clone)]
pub struct LocalMedia {
    /// Microphone track
    pub audio: Arc<dyn LocalTrack>,
    /// Camera track
    pub video: Arc<dyn LocalTrack>,
}

impl LocalMedia {
    /// Stop both tracks
    pub fn stop_all(&self) {
        self.audio.stop();
        self.video.stop();
    }
}

/// A screen-capture track and its end-of-capture signal
#[derive(Debug)]
pub struct ScreenCapture {
    /// Screen video track
    pub track: Arc<dyn LocalTrack>,
    /// Fires when capture ends outside the session's control
    pub ended: oneshot::Receiver<()>,
}

/// Camera and microphone request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMediaRequest {
    /// Camera hints
    pub video: VideoConstraints,
    /// Microphone hints
    pub audio: AudioConstraints,
}

impl From<&CallConfig> for UserMediaRequest {
    fn from(config: &CallConfig) -> Self {
        Self {
            video: config.video.clone(),
            audio: config.audio.clone(),
        }
    }
}

/// Capture devices
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture camera and microphone together
    async fn acquire_user_media(&self, request: &UserMediaRequest)
        -> Result<LocalMedia, MediaError>;

    /// Capture the screen; the user may decline
    async fn acquire_display_media(&self) -> Result<ScreenCapture, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_config() {
        let config = CallConfig::default();
        let request = UserMediaRequest::from(&config);
        assert_eq!(request.video.width, 1280);
        assert!(request.audio.echo_cancellation);
    }
}
