//! # Rate Shaping Buffer
//!
//! A small FIFO of pending packet sizes sitting between the traffic source
//! and the pacer. It decouples the encoder target rate from the pacing
//! rate: when the buffer starts to build, the encoder target `r_vin` is
//! nudged below the reference rate and the pacing rate `r_send` above it,
//! so the buffer drains without the estimate itself moving. In the common
//! case the buffer oscillates between zero and one packet and both rates
//! equal the reference rate.

use std::collections::VecDeque;
use tracing::warn;

/// Encoder-side rate adjustment weight per buffered bit.
pub const BETA_V: f32 = 1e-5;

/// Pacer-side rate adjustment weight per buffered bit.
pub const BETA_S: f32 = 1e-5;

/// Rate adjustments are capped at this fraction of the reference rate.
const MAX_ADJUST_FRACTION: f32 = 0.05;

/// Sanity bound on buffered bytes; a buffer this deep means the pacer
/// stopped draining.
pub const MAX_BUFFER_BYTES: u64 = 80 * 1000 * 1000;

/// FIFO rate-shaping buffer plus the derived encoder/pacing rates.
#[derive(Debug, Clone)]
pub struct RateShaper {
    /// Pending packet sizes, bytes.
    queue: VecDeque<u32>,
    /// Sum of queued sizes.
    buffered_bytes: u64,
    /// Encoder target rate r_vin, bps.
    encoder_rate_bps: f32,
    /// Pacing rate r_send, bps.
    pacing_rate_bps: f32,
}

impl RateShaper {
    /// Create an empty buffer with both rates at the given initial value.
    pub fn new(initial_bps: f32) -> Self {
        RateShaper {
            queue: VecDeque::new(),
            buffered_bytes: 0,
            encoder_rate_bps: initial_bps,
            pacing_rate_bps: initial_bps,
        }
    }

    /// Queue one packet of `size` bytes for pacing.
    pub fn push(&mut self, size: u32) -> bool {
        if self.buffered_bytes + u64::from(size) > MAX_BUFFER_BYTES {
            warn!(
                buffered = self.buffered_bytes,
                "rate shaping buffer overflow, packet dropped"
            );
            return false;
        }
        self.queue.push_back(size);
        self.buffered_bytes += u64::from(size);
        true
    }

    /// Dequeue the next packet size for transmission.
    pub fn pop(&mut self) -> Option<u32> {
        let size = self.queue.pop_front()?;
        debug_assert!(self.buffered_bytes >= u64::from(size));
        self.buffered_bytes -= u64::from(size);
        Some(size)
    }

    /// Packets currently buffered.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Bytes currently buffered.
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    /// Drop all buffered packets (flow pause).
    pub fn clear(&mut self) {
        self.queue.clear();
        self.buffered_bytes = 0;
    }

    /// Encoder target rate r_vin, bps.
    pub fn encoder_rate_bps(&self) -> f32 {
        self.encoder_rate_bps
    }

    /// Pacing rate r_send, bps.
    pub fn pacing_rate_bps(&self) -> f32 {
        self.pacing_rate_bps
    }

    /// Set both rates to the reference rate (shaping disabled, or flow
    /// resume).
    pub fn set_rates(&mut self, r_ref_bps: f32) {
        self.encoder_rate_bps = r_ref_bps;
        self.pacing_rate_bps = r_ref_bps;
    }

    /// Derive the encoder and pacing rates from a fresh reference rate.
    ///
    /// A buffer of zero or one packet counts as empty — that is the normal
    /// jitter between enqueue and feedback-driven updates, not a backlog.
    pub fn update_rates(&mut self, r_ref_bps: f32, fps: f32, min_bps: f32, max_bps: f32) {
        let backlog_bytes = if self.queue.len() > 1 {
            self.buffered_bytes as f32
        } else {
            0.0
        };
        let r_diff = 8.0 * backlog_bytes * fps;
        let r_diff_v = (BETA_V * r_diff).min(MAX_ADJUST_FRACTION * r_ref_bps);
        let r_diff_s = (BETA_S * r_diff).min(MAX_ADJUST_FRACTION * r_ref_bps);
        self.encoder_rate_bps = (r_ref_bps - r_diff_v).max(min_bps);
        self.pacing_rate_bps = (r_ref_bps + r_diff_s).min(max_bps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_accounting() {
        let mut shaper = RateShaper::new(150_000.0);
        assert!(shaper.push(100));
        assert!(shaper.push(200));
        assert_eq!(shaper.buffered_bytes(), 300);
        assert_eq!(shaper.pop(), Some(100));
        assert_eq!(shaper.pop(), Some(200));
        assert_eq!(shaper.pop(), None);
        assert_eq!(shaper.buffered_bytes(), 0);
    }

    #[test]
    fn empty_buffer_keeps_rates_at_reference() {
        let mut shaper = RateShaper::new(150_000.0);
        shaper.update_rates(400_000.0, 30.0, 150_000.0, 1_500_000.0);
        assert_eq!(shaper.encoder_rate_bps(), 400_000.0);
        assert_eq!(shaper.pacing_rate_bps(), 400_000.0);
    }

    #[test]
    fn single_packet_counts_as_empty() {
        let mut shaper = RateShaper::new(150_000.0);
        shaper.push(1000);
        shaper.update_rates(400_000.0, 30.0, 150_000.0, 1_500_000.0);
        assert_eq!(shaper.encoder_rate_bps(), 400_000.0);
        assert_eq!(shaper.pacing_rate_bps(), 400_000.0);
    }

    #[test]
    fn backlog_splits_rates() {
        let mut shaper = RateShaper::new(150_000.0);
        for _ in 0..10 {
            shaper.push(1000);
        }
        shaper.update_rates(400_000.0, 30.0, 150_000.0, 1_500_000.0);
        assert!(shaper.encoder_rate_bps() < 400_000.0, "encoder slows down");
        assert!(shaper.pacing_rate_bps() > 400_000.0, "pacer speeds up");
    }

    #[test]
    fn adjustments_are_bounded() {
        let mut shaper = RateShaper::new(150_000.0);
        // An absurd backlog: the 5% cap and the min/max clamps must hold
        for _ in 0..10_000 {
            shaper.push(1400);
        }
        shaper.update_rates(400_000.0, 30.0, 150_000.0, 1_500_000.0);
        assert!(shaper.encoder_rate_bps() >= 0.95 * 400_000.0 - 1.0);
        assert!(shaper.pacing_rate_bps() <= 1.05 * 400_000.0 + 1.0);
    }

    #[test]
    fn clamped_to_flow_bounds() {
        let mut shaper = RateShaper::new(150_000.0);
        for _ in 0..100 {
            shaper.push(1400);
        }
        // Reference right at the floor: encoder rate must not dip below it
        shaper.update_rates(150_000.0, 30.0, 150_000.0, 1_500_000.0);
        assert_eq!(shaper.encoder_rate_bps(), 150_000.0);
    }

    #[test]
    fn overflow_guard_drops() {
        let mut shaper = RateShaper::new(150_000.0);
        // Fill right up to the sanity bound, then one packet more
        while shaper.buffered_bytes() + 10_000_000 <= MAX_BUFFER_BYTES {
            assert!(shaper.push(10_000_000));
        }
        assert!(!shaper.push(10_000_000), "past the sanity bound pushes must fail");
    }

    #[test]
    fn clear_empties_buffer() {
        let mut shaper = RateShaper::new(150_000.0);
        shaper.push(500);
        shaper.push(500);
        shaper.clear();
        assert!(shaper.is_empty());
        assert_eq!(shaper.buffered_bytes(), 0);
    }
}
