//! The frame clock: paces how often accumulated damage is flushed.
//!
//! The clock only knows *when*.  Whether it may run at all (desktop started,
//! updates not blocked, something pending) is decided by the desktop session
//! that owns it.
//!
//! A freshly armed clock first fires after half a frame period.  Damage that
//! arrives at roughly the server's own frame rate would otherwise land right
//! on the clock edge and produce uneven frame pacing.  Once it has fired, the
//! clock is re-armed with the full period.

use std::time::{Duration, Instant};

use super::timers::DeadlineTimer;

/// Lowest accepted frame rate; smaller values are clamped to it.
pub const MIN_FRAME_RATE: u32 = 1;

#[derive(Debug, Clone)]
pub struct FrameClock {
    timer: DeadlineTimer,
    period: Duration,
}

impl FrameClock {
    /// Creates a stopped clock for `frame_rate` frames per second.
    pub fn new(frame_rate: u32) -> Self {
        Self {
            timer: DeadlineTimer::new(),
            period: Duration::from_secs(1) / frame_rate.max(MIN_FRAME_RATE),
        }
    }

    /// One frame interval.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Arms the clock for half a period.  No-op while already running.
    pub fn start(&mut self, now: Instant) {
        if self.timer.is_started() {
            return;
        }
        self.timer.start(now, self.period / 2);
    }

    pub fn stop(&mut self) {
        self.timer.stop();
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_started()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.timer.is_expired(now)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Re-arms after a produced frame.
    ///
    /// Returns `true` if this was the first tick since arming, whose half
    /// interval has now been normalised to a full period.
    pub fn rearm(&mut self, now: Instant) -> bool {
        let first_tick = self.timer.interval() != self.period;
        self.timer.start(now, self.period);
        first_tick
    }

    /// How long until the next frame could go out.
    ///
    /// Half a period while stopped, since that is how long a fresh arm waits.
    pub fn time_to_next_tick(&self, now: Instant) -> Duration {
        self.timer.remaining(now).unwrap_or(self.period / 2)
    }
}
