//! Status debouncing
//!
//! Decides when a database status update should run given a stream of insert
//! notifications. Holds no timers itself so it can be driven with any clock.

use std::time::Duration;
use tokio::time::Instant;

/// What to do about an insert notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Update right away
    Now,
    /// Schedule one update after the delay
    After(Duration),
    /// An update is already scheduled
    Skip,
}

#[derive(Debug)]
pub struct StatusDebouncer {
    window: Duration,
    last_update: Option<Instant>,
    pending: bool,
}

impl StatusDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_update: None,
            pending: false,
        }
    }

    pub fn on_event(&mut self, now: Instant) -> Trigger {
        if self.pending {
            return Trigger::Skip;
        }
        let elapsed = match self.last_update {
            Some(last) => now.saturating_duration_since(last),
            None => return Trigger::Now,
        };
        if elapsed >= self.window {
            Trigger::Now
        } else {
            self.pending = true;
            Trigger::After(self.window - elapsed)
        }
    }

    /// An update ran at `now`; clears any pending flag
    pub fn mark_updated(&mut self, now: Instant) {
        self.last_update = Some(now);
        self.pending = false;
    }

    pub fn cancel(&mut self) {
        self.pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }
}
