//! Standby status update scheduling.
//!
//! The server terminates a replication connection that stays silent for
//! longer than `wal_sender_timeout`. The scheduler keeps a rolling deadline so
//! that the receive loop sends a status update at a bounded interval no matter
//! how often messages arrive.

use std::time::Duration;

use tokio::time::Instant;

/// Rolling deadline for standby status updates.
#[derive(Debug, Clone)]
pub struct KeepaliveScheduler {
    interval: Duration,
    deadline: Instant,
}

impl KeepaliveScheduler {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            deadline: now + interval,
        }
    }

    /// Returns true when a status update is due, and moves the deadline one
    /// interval past `now`.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now >= self.deadline {
            self.deadline = now + self.interval;
            true
        } else {
            false
        }
    }

    /// Push the deadline out after a status update sent outside the schedule.
    pub fn reset(&mut self, now: Instant) {
        self.deadline = now + self.interval;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
