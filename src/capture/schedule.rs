//! Drift-free capture cadence.
//!
//! The next fire time always advances from the previous target, never from
//! the moment work finished, so per-tick latency cannot accumulate.

use std::time::Duration;

use tokio::time::Instant;

/// Longest single wait, so stop and interval signals are seen promptly.
pub const WAIT_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
pub struct CaptureSchedule {
    next_capture: Instant,
    interval: Duration,
}

impl CaptureSchedule {
    /// First capture fires at `now`.
    pub fn starting_at(now: Instant, interval: Duration) -> Self {
        Self {
            next_capture: now,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_capture(&self) -> Instant {
        self.next_capture
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_capture
    }

    pub fn wait_slice(&self, now: Instant) -> Duration {
        self.next_capture
            .saturating_duration_since(now)
            .min(WAIT_SLICE)
    }

    /// Claims the due tick and moves the target one interval on. Called
    /// before the capture work starts. Returns the claimed target.
    pub fn advance(&mut self) -> Instant {
        let claimed = self.next_capture;
        self.next_capture += self.interval;
        claimed
    }

    /// Drops every tick a slow capture overran so the target lies after
    /// `now`. Returns how many ticks were dropped.
    pub fn skip_missed(&mut self, now: Instant) -> u32 {
        if now < self.next_capture {
            return 0;
        }
        let behind = now.duration_since(self.next_capture);
        let missed = behind.as_nanos() / self.interval.as_nanos().max(1) + 1;
        let missed = u32::try_from(missed).unwrap_or(u32::MAX);
        self.next_capture = match self.interval.checked_mul(missed) {
            Some(offset) => self.next_capture + offset,
            None => now + self.interval,
        };
        missed
    }

    /// Restarts the cadence one new interval after `now`.
    pub fn reanchor(&mut self, now: Instant, interval: Duration) {
        self.interval = interval;
        self.next_capture = now + interval;
    }
}
