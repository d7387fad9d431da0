//! Control overlay visibility
//!
//! While a call is connected the controls hide after a period without user
//! activity. Before that they stay visible so the user can always hang up.

use std::time::{Duration, Instant};

/// Auto-hide timer for call controls
#[derive(Debug, Clone)]
pub struct ControlsAutoHide {
    timeout: Duration,
    last_activity: Instant,
}

impl ControlsAutoHide {
    /// Create a timer; controls start visible
    #[must_use]
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_activity: now,
        }
    }

    /// Pointer movement or a control was used
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Whether the controls should be shown
    #[must_use]
    pub fn visible(&self, now: Instant, connected: bool) -> bool {
        !connected || now.saturating_duration_since(self.last_activity) < self.timeout
    }

    /// Time left until the controls hide, if they are counting down
    #[must_use]
    pub fn remaining(&self, now: Instant, connected: bool) -> Option<Duration> {
        if !connected {
            return None;
        }
        Some(
            self.timeout
                .saturating_sub(now.saturating_duration_since(self.last_activity)),
        )
    }
}
