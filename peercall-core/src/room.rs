//! In-process signaling relay
//!
//! Behaves like the video-call relay: every member of a room receives the
//! messages the other members send (never its own), a `user-joined` when a
//! member joins after it, and a `user-left` when a member leaves. Used for
//! loopback calls and tests.

use crate::signaling::{SignalingChannel, SignalingError, SignalingEvent, SignalingMessage};
use crate::types::SessionId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Member {
    id: u64,
    username: Option<String>,
    tx: mpsc::UnboundedSender<SignalingEvent>,
}

/// Rooms keyed by session id
#[derive(Default)]
pub struct SignalingHub {
    rooms: Mutex<HashMap<SessionId, Vec<Member>>>,
    next_member: AtomicU64,
}

impl SignalingHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an unopened channel on this hub
    #[must_use]
    pub fn channel(self: &Arc<Self>, username: impl Into<String>) -> RoomChannel {
        RoomChannel {
            hub: Arc::clone(self),
            username: Some(username.into()),
            membership: Mutex::new(None),
        }
    }

    /// Number of members currently in a room
    #[must_use]
    pub fn member_count(&self, session_id: &SessionId) -> usize {
        self.rooms.lock().get(session_id).map_or(0, Vec::len)
    }

    /// Drop every member of a room with a close reason
    pub fn close_room(&self, session_id: &SessionId, reason: &str) {
        let members = self.rooms.lock().remove(session_id).unwrap_or_default();
        tracing::info!(session_id = %session_id, members = members.len(), reason, "Closing room");
        for member in members {
            let _ = member.tx.send(SignalingEvent::Closed {
                reason: Some(reason.to_string()),
            });
        }
    }

    fn join(
        &self,
        session_id: &SessionId,
        username: Option<String>,
    ) -> (u64, mpsc::UnboundedReceiver<SignalingEvent>) {
        let id = self.next_member.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut rooms = self.rooms.lock();
        let room = rooms.entry(session_id.clone()).or_default();
        let joined = SignalingMessage::UserJoined {
            session_id: session_id.as_str().to_string(),
            username: username.clone(),
        };
        for other in room.iter() {
            let _ = other.tx.send(SignalingEvent::Message(joined.clone()));
        }
        room.push(Member { id, username, tx });

        tracing::debug!(session_id = %session_id, member = id, size = room.len(), "Member joined room");
        (id, rx)
    }

    fn relay(&self, session_id: &SessionId, from: u64, message: SignalingMessage) -> bool {
        let rooms = self.rooms.lock();
        let Some(room) = rooms.get(session_id) else {
            return false;
        };
        if !room.iter().any(|m| m.id == from) {
            return false;
        }
        for other in room.iter().filter(|m| m.id != from) {
            let _ = other.tx.send(SignalingEvent::Message(message.clone()));
        }
        true
    }

    fn leave(&self, session_id: &SessionId, member: u64) {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(session_id) else {
            return;
        };
        let Some(pos) = room.iter().position(|m| m.id == member) else {
            return;
        };
        let left = room.remove(pos);
        let notice = SignalingMessage::UserLeft {
            session_id: session_id.as_str().to_string(),
            username: left.username,
        };
        for other in room.iter() {
            let _ = other.tx.send(SignalingEvent::Message(notice.clone()));
        }
        if room.is_empty() {
            rooms.remove(session_id);
        }
        tracing::debug!(session_id = %session_id, member, "Member left room");
    }
}

/// One participant's channel into a hub room
pub struct RoomChannel {
    hub: Arc<SignalingHub>,
    username: Option<String>,
    membership: Mutex<Option<(SessionId, u64)>>,
}

#[async_trait]
impl SignalingChannel for RoomChannel {
    async fn open(
        &self,
        session_id: &SessionId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        let mut membership = self.membership.lock();
        if membership.is_some() {
            return Err(SignalingError::Transport(
                "channel already joined a room".to_string(),
            ));
        }
        let (id, rx) = self.hub.join(session_id, self.username.clone());
        *membership = Some((session_id.clone(), id));
        Ok(rx)
    }

    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let membership = self.membership.lock();
        let (session_id, id) = membership.as_ref().ok_or(SignalingError::NotOpen)?;
        if self.hub.relay(session_id, *id, message) {
            Ok(())
        } else {
            Err(SignalingError::Closed)
        }
    }

    fn close(&self) {
        if let Some((session_id, id)) = self.membership.lock().take() {
            self.hub.leave(&session_id, id);
        }
    }

    fn is_open(&self) -> bool {
        self.membership
            .lock()
            .as_ref()
            .is_some_and(|(session_id, id)| {
                self.hub
                    .rooms
                    .lock()
                    .get(session_id)
                    .is_some_and(|room| room.iter().any(|m| m.id == *id))
            })
    }
}

impl Drop for RoomChannel {
    fn drop(&mut self) {
        self.close();
    }
}
