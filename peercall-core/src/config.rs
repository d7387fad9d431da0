//! Call configuration
//!
//! All options are fixed at construction time; a running session is never
//! reconfigured.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// Path that was read
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// Invalid JSON or field types
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Semantically invalid values
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:` or `turn:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// TURN server with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Public STUN servers used when nothing else is configured
    pub fn default_stun() -> Vec<Self> {
        vec![
            Self::stun("stun:stun.l.google.com:19302"),
            Self::stun("stun:stun1.l.google.com:19302"),
        ]
    }
}

/// Camera capture hints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConstraints {
    /// Ideal width in pixels
    pub width: u32,
    /// Ideal height in pixels
    pub height: u32,
    /// Preferred camera (`user` or `environment`)
    pub facing_mode: String,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            facing_mode: "user".to_string(),
        }
    }
}

/// Microphone processing hints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Call session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// STUN/TURN servers handed to the peer connection engine
    pub ice_servers: Vec<IceServer>,
    /// Camera hints
    pub video: VideoConstraints,
    /// Microphone hints
    pub audio: AudioConstraints,
    /// Idle time before in-call controls hide, in milliseconds
    pub controls_auto_hide_ms: u64,
    /// Sender label for chat messages sent from this side
    pub local_label: String,
    /// Fallback label for inbound chat messages without a sender
    pub remote_label: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::default_stun(),
            video: VideoConstraints::default(),
            audio: AudioConstraints::default(),
            controls_auto_hide_ms: 3000,
            local_label: "You".to_string(),
            remote_label: "Remote".to_string(),
        }
    }
}

impl CallConfig {
    /// Parse a JSON document; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or values are invalid
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        tracing::debug!(path = %path.display(), ice_servers = config.ice_servers.len(), "Loaded call config");
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.video.width == 0 || self.video.height == 0 {
            return Err(ConfigError::Invalid(
                "video resolution must be non-zero".to_string(),
            ));
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::Invalid("ICE server without urls".to_string()));
            }
            for url in &server.urls {
                if !(url.starts_with("stun:")
                    || url.starts_with("stuns:")
                    || url.starts_with("turn:")
                    || url.starts_with("turns:"))
                {
                    return Err(ConfigError::Invalid(format!("unsupported ICE url: {url}")));
                }
            }
        }
        Ok(())
    }

    /// Auto-hide timeout as a duration
    #[must_use]
    pub fn controls_auto_hide(&self) -> Duration {
        Duration::from_millis(self.controls_auto_hide_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.video.width, 1280);
        assert_eq!(config.video.height, 720);
        assert_eq!(config.controls_auto_hide(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CallConfig::from_json_str(
            r#"{"ice_servers":[{"urls":["turn:turn.example.org:3478"],"username":"u","credential":"p"}],
                "video":{"width":640}}"#,
        )
        .unwrap();
        assert_eq!(
            config.ice_servers,
            vec![IceServer::turn("turn:turn.example.org:3478", "u", "p")]
        );
        assert_eq!(config.video.width, 640);
        assert_eq!(config.video.height, 720);
        assert_eq!(config.local_label, "You");
    }

    #[test]
    fn test_rejects_bad_ice_url() {
        let err = CallConfig::from_json_str(r#"{"ice_servers":[{"urls":["http://nope"]}]}"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("call.json");
        std::fs::write(&path, r#"{"controls_auto_hide_ms": 5000}"#).unwrap();
        let config = CallConfig::load(&path).unwrap();
        assert_eq!(config.controls_auto_hide_ms, 5000);

        let missing = CallConfig::load(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
