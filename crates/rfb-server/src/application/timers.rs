//! Deadline timers driven by the event loop.
//!
//! Timers never fire on their own.  The owner asks [`DeadlineTimer::is_expired`]
//! with the current time, and the event loop sleeps until the earliest
//! [`DeadlineTimer::deadline`] of all timers.

use std::time::{Duration, Instant};

/// A one-shot timer with an optional deadline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadlineTimer {
    deadline: Option<Instant>,
    interval: Duration,
}

impl DeadlineTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer to expire `interval` after `now`, replacing any
    /// previous deadline.
    pub fn start(&mut self, now: Instant, interval: Duration) {
        self.deadline = Some(now + interval);
        self.interval = interval;
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_started(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The interval passed to the last [`DeadlineTimer::start`].
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |deadline| now >= deadline)
    }

    /// Time left before expiry; `None` when stopped.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }
}
