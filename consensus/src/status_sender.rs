//! Throttles status gossip.
//!
//! A status goes out as soon as its serial moves past the last one sent, and
//! at least every `max_interval` otherwise so that peers which missed a packet
//! converge.

use std::time::{Duration, Instant};

use strata_types::NodeStatus;

pub const DEFAULT_MAX_STATUS_INTERVAL: Duration = Duration::from_millis(1000);

pub struct StatusSender {
    max_interval: Duration,
    last_serial: i64,
    last_sent: Option<Instant>,
}

impl StatusSender {
    pub fn new(max_interval: Duration) -> Self {
        Self {
            max_interval,
            last_serial: -1,
            last_sent: None,
        }
    }

    /// The status to broadcast now, if any.
    pub fn update(&mut self, my: &NodeStatus, now: Instant) -> Option<NodeStatus> {
        let due = match self.last_sent {
            None => true,
            Some(at) => my.serial > self.last_serial || now.duration_since(at) >= self.max_interval,
        };
        if !due {
            return None;
        }
        self.last_serial = my.serial;
        self.last_sent = Some(now);
        Some(my.clone())
    }
}
