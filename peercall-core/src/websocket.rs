//! WebSocket signaling client
//!
//! Connects to the video-call relay at `<base>/ws/video-call/<session>/` and
//! exchanges one JSON text frame per [`SignalingMessage`].

use crate::signaling::{SignalingChannel, SignalingError, SignalingEvent, SignalingMessage};
use crate::types::SessionId;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

enum Outbound {
    Frame(String),
    Close,
}

struct Connection {
    tx: mpsc::UnboundedSender<Outbound>,
    reader: JoinHandle<()>,
}

/// Signaling channel over the relay's WebSocket endpoint
pub struct WebSocketChannel {
    base_url: String,
    connection: Mutex<Option<Connection>>,
}

/// Build the relay URL for a session
///
/// `http(s)` bases are mapped to `ws(s)`.
///
/// # Errors
///
/// Returns error if the base URL has an unsupported scheme
pub fn video_call_url(base_url: &str, session_id: &SessionId) -> Result<String, SignalingError> {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(SignalingError::Connect(format!(
            "unsupported signaling URL: {base_url}"
        )));
    };
    Ok(format!("{base}/ws/video-call/{session_id}/"))
}

impl WebSocketChannel {
    /// Create an unopened channel for a relay base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connection: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SignalingChannel for WebSocketChannel {
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    async fn open(
        &self,
        session_id: &SessionId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        if self.connection.lock().is_some() {
            return Err(SignalingError::Transport("channel already open".to_string()));
        }
        let url = video_call_url(&self.base_url, session_id)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::Connect(format!("{url}: {e}")))?;
        tracing::info!(url = %url, "Signaling WebSocket connected");

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    Outbound::Frame(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::warn!(error = %e, "Signaling write failed");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                        Ok(message) => {
                            if in_tx.send(SignalingEvent::Message(message)).is_err() {
                                return;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Ignoring malformed signaling frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            tracing::debug!(reason = ?reason, "Signaling WebSocket closed");
            let _ = in_tx.send(SignalingEvent::Closed { reason });
        });

        let mut connection = self.connection.lock();
        if connection.is_some() {
            reader.abort();
            let _ = out_tx.send(Outbound::Close);
            return Err(SignalingError::Transport("channel already open".to_string()));
        }
        *connection = Some(Connection { tx: out_tx, reader });
        Ok(in_rx)
    }

    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let text = message.to_json()?;
        let connection = self.connection.lock();
        let connection = connection.as_ref().ok_or(SignalingError::NotOpen)?;
        connection
            .tx
            .send(Outbound::Frame(text))
            .map_err(|_| SignalingError::Closed)
    }

    fn close(&self) {
        if let Some(connection) = self.connection.lock().take() {
            let _ = connection.tx.send(Outbound::Close);
            connection.reader.abort();
            tracing::debug!("Signaling WebSocket closing");
        }
    }

    fn is_open(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| !c.tx.is_closed() && !c.reader.is_finished())
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_video_call_url() {
        let id = SessionId::new("abc");
        assert_eq!(
            video_call_url("ws://localhost:8000", &id).unwrap(),
            "ws://localhost:8000/ws/video-call/abc/"
        );
        assert_eq!(
            video_call_url("https://example.org/", &id).unwrap(),
            "wss://example.org/ws/video-call/abc/"
        );
        assert!(video_call_url("ftp://example.org", &id).is_err());
    }

    #[test]
    fn test_send_before_open() {
        let channel = WebSocketChannel::new("ws://localhost:1");
        assert!(!channel.is_open());
        assert!(matches!(
            channel.send(SignalingMessage::UserJoined {
                session_id: String::new(),
                username: None,
            }),
            Err(SignalingError::NotOpen)
        ));
        channel.close();
    }
}
