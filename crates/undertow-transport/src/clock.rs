//! # Monotonic Microsecond Clock
//!
//! The protocol state machines take explicit `now_us` parameters so a
//! simulation can drive them with a synthetic clock. Real deployments
//! anchor one [`MonotonicClock`] per process and share it between the
//! sender and receiver paths — both endpoints' timestamps are assumed to
//! come from one opaque microsecond clock (no NTP-style synchronization;
//! one-way delays absorb any constant offset).

use quanta::Instant;

/// Monotonic microsecond clock anchored at construction time.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }

    /// Microseconds elapsed since the clock was created.
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
