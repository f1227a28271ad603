//! Starts a revolt when a height and round make no progress in time.

use std::time::{Duration, Instant};

use crate::StatusManager;

/// Default time a round may stall before we revolt.
pub const DEFAULT_REVOLT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RevoltTracker {
    timeout: Duration,
    deadline: Instant,
    height: i64,
    round: i64,
}

impl RevoltTracker {
    pub fn new(timeout: Duration, status: &StatusManager, now: Instant) -> Self {
        let my = status.my_status();
        Self {
            timeout,
            deadline: now + timeout,
            height: my.height,
            round: my.round,
        }
    }

    /// Called once per tick. Returns true if this call started a revolt.
    pub fn update(&mut self, status: &mut StatusManager, now: Instant) -> bool {
        let my = status.my_status();
        if my.height != self.height || my.round != self.round {
            self.height = my.height;
            self.round = my.round;
            self.deadline = now + self.timeout;
            return false;
        }
        if now < self.deadline || my.revolting {
            return false;
        }
        status.on_start_revolting()
    }
}
