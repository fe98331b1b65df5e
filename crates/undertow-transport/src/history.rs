//! # Packet History Estimator
//!
//! Sender-side ledger of in-flight and recently fed-back media packets.
//! Raw feedback (sequence + arrival timestamp) is matched against the send
//! log to produce the aggregate signals congestion controllers consume:
//! one-way queuing delay, round-trip time, receive rate, loss ratio and
//! TFRC-style inter-loss intervals.
//!
//! Records move through two deques ordered by send sequence:
//!
//! - **in-transit** — sent, no feedback yet; bounded by an absolute age
//!   limit so the ledger cannot grow without feedback
//! - **history** — feedback received; bounded by a sliding time window
//!   behind the newest entry
//!
//! Sequence numbers are 16-bit and wrap; timestamps are an opaque monotonic
//! microsecond clock and may wrap too (the sender and receiver clocks are
//! not synchronized, so one-way delays absorb the clock offset and only
//! their *changes* are meaningful). Every ordering predicate here goes
//! through [`SeqOrd`], never plain comparison.

use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::wire::SeqOrd;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Minimum history entries for loss / rate statistics to be meaningful.
pub const MIN_HISTORY_SAMPLES: usize = 5;

/// Maximum interval between fed-back packets before the history window is
/// considered stale, in µs.
pub const MAX_INTER_PACKET_TIME_US: u64 = 500_000;

/// Default sliding window for the history ledger, in µs.
pub const DEFAULT_HISTORY_WINDOW_US: u64 = 500_000;

/// Taps of the minimum filter over recent delay samples.
const DELAY_FILTER_TAPS: usize = 15;

/// Inter-loss intervals tracked for the TFRC-style average.
const MAX_LOSS_INTERVALS: usize = 8;

/// TFRC discount weights, newest interval first (RFC 5348).
const LOSS_INTERVAL_WEIGHTS: [f32; MAX_LOSS_INTERVALS] =
    [1.0, 1.0, 1.0, 1.0, 0.8, 0.6, 0.4, 0.2];

// ─── Records ────────────────────────────────────────────────────────────────

/// One sent packet's ledger entry.
#[derive(Debug, Clone, Copy)]
pub struct PacketRecord {
    /// 16-bit send sequence, wraps.
    pub sequence: u16,
    /// Send timestamp, µs.
    pub tx_timestamp_us: u64,
    /// Payload size in bytes.
    pub size: u32,
    /// One-way delay (arrival − send); includes the clock offset between
    /// endpoints. Zero until feedback arrives.
    pub owd_us: u64,
    /// Round-trip time (feedback processing time − send). Zero until
    /// feedback arrives.
    pub rtt_us: u64,
}

/// Packet loss over the current history window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossInfo {
    /// Packets missing from the covered sequence span.
    pub lost: u32,
    /// Losses per packet over the span.
    pub ratio: f32,
}

/// Aggregated inter-loss interval statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossIntervalStats {
    /// TFRC-weighted average inter-loss interval, in packets.
    pub average: f32,
    /// The still-growing interval since the most recent loss, in packets.
    pub current: u32,
}

/// TFRC-style inter-loss interval tracking: a deque of packets-received
/// counts between consecutive loss events, front = current growing interval.
#[derive(Debug, Clone)]
struct InterLossState {
    intervals: VecDeque<u32>,
    expected_seq: u16,
    /// Set once the first loss has been observed.
    initialized: bool,
}

impl Default for InterLossState {
    fn default() -> Self {
        let mut intervals = VecDeque::new();
        intervals.push_front(0);
        InterLossState {
            intervals,
            expected_seq: 0,
            initialized: false,
        }
    }
}

// ─── Packet History ─────────────────────────────────────────────────────────

/// The estimator. One instance per flow, updated single-threaded in event
/// order: [`on_send`](Self::on_send) at transmit time,
/// [`on_feedback`](Self::on_feedback) per fed-back packet.
#[derive(Debug, Clone)]
pub struct PacketHistory {
    /// True until the first send fixes the sequence base.
    first_send: bool,
    /// Sequence of the last packet sent.
    last_sequence: u16,
    /// Running minimum one-way delay: propagation delay plus the clock
    /// offset between endpoints. Queuing delay is measured against it.
    base_owd_us: u64,
    /// Sent packets awaiting feedback.
    in_transit: VecDeque<PacketRecord>,
    /// Fed-back packets inside the sliding window.
    history: VecDeque<PacketRecord>,
    /// Sum of sizes in `history` (kept incrementally).
    size_sum: u32,
    loss_state: InterLossState,
    window_us: u64,
}

impl PacketHistory {
    pub fn new() -> Self {
        PacketHistory {
            first_send: true,
            last_sequence: 0,
            base_owd_us: 0,
            in_transit: VecDeque::new(),
            history: VecDeque::new(),
            size_sum: 0,
            loss_state: InterLossState::default(),
            window_us: DEFAULT_HISTORY_WINDOW_US,
        }
    }

    /// Return to the freshly-constructed state.
    pub fn reset(&mut self) {
        *self = PacketHistory::new();
    }

    /// Sliding window length for the history ledger, µs.
    pub fn window_us(&self) -> u64 {
        self.window_us
    }

    pub fn set_window_us(&mut self, window_us: u64) {
        self.window_us = window_us;
    }

    /// Entries currently in the history ledger.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Sent packets still awaiting feedback.
    pub fn in_transit_len(&self) -> usize {
        self.in_transit.len()
    }

    /// Log a packet at send time. The sequence must continue the previous
    /// send (wraparound-aware); a discontinuity is logged and the record is
    /// not admitted.
    pub fn on_send(&mut self, tx_timestamp_us: u64, sequence: u16, size: u32) -> bool {
        if self.first_send {
            self.last_sequence = sequence.wrapping_sub(1);
            self.first_send = false;
        }
        let expected = self.last_sequence.wrapping_add(1);
        if sequence != expected {
            warn!(sequence, expected, "send sequence discontinuity, record not admitted");
            return false;
        }
        self.last_sequence = sequence;
        self.in_transit.push_back(PacketRecord {
            sequence,
            tx_timestamp_us,
            size,
            owd_us: 0,
            rtt_us: 0,
        });

        // Memory-safety bound, not a correctness requirement: feedback for
        // an evicted record may still arrive and will count as loss then.
        let age_limit_us = 10 * MAX_INTER_PACKET_TIME_US;
        while let Some(front) = self.in_transit.front() {
            if front
                .tx_timestamp_us
                .wrapping_add(age_limit_us)
                .seq_lt(tx_timestamp_us)
            {
                self.in_transit.pop_front();
            } else {
                break;
            }
        }
        true
    }

    /// Match one fed-back packet against the send log and fold it into the
    /// history ledger.
    ///
    /// Returns false only on invariant violations (sequence from the
    /// future, decreasing send timestamps) — those indicate a broken clock
    /// or corrupted state and abort the flow. Duplicates and reordering are
    /// normal network behavior: logged, tolerated, `true`.
    pub fn on_feedback(
        &mut self,
        now_us: u64,
        sequence: u16,
        rx_timestamp_us: u64,
        _ecn: u8,
    ) -> bool {
        if self.last_sequence.seq_lt(sequence) {
            warn!(
                sequence,
                last_sent = self.last_sequence,
                "feedback for a sequence from the future"
            );
            return false;
        }

        if self.in_transit.is_empty() {
            debug!(sequence, "duplicate or late feedback, nothing in transit");
            return true;
        }
        debug_assert_eq!(
            self.in_transit.back().map(|r| r.sequence),
            Some(self.last_sequence)
        );

        // Everything sent strictly before the fed-back packet is presumed
        // lost on the forward path. (A lost feedback packet on the backward
        // path looks identical from here.)
        while self
            .in_transit
            .front()
            .is_some_and(|r| r.sequence.seq_lt(sequence))
        {
            self.in_transit.pop_front();
        }

        let front_sequence = match self.in_transit.front() {
            Some(r) => r.sequence,
            None => return true,
        };
        if sequence.seq_lt(front_sequence) {
            debug!(sequence, "out-of-order feedback, ignored");
            return true;
        }

        let mut packet = match self.in_transit.pop_front() {
            Some(r) => r,
            None => return true,
        };
        debug_assert_eq!(packet.sequence, sequence);

        if let Some(last) = self.history.back() {
            if packet.tx_timestamp_us.seq_lt(last.tx_timestamp_us) {
                warn!(
                    sequence,
                    tx_timestamp_us = packet.tx_timestamp_us,
                    "fed-back packet has decreasing send timestamp"
                );
                return false;
            }
            if last
                .tx_timestamp_us
                .wrapping_add(MAX_INTER_PACKET_TIME_US)
                .seq_lt(packet.tx_timestamp_us)
            {
                // Too long without feedback: the observation window is
                // disjoint from the previous one, not merely aged.
                self.history.clear();
                self.size_sum = 0;
            }
        }

        // These subtractions wrap across unsynchronized clocks; the base
        // delay filter below absorbs the constant offset.
        packet.owd_us = rx_timestamp_us.wrapping_sub(packet.tx_timestamp_us);
        packet.rtt_us = now_us.wrapping_sub(packet.tx_timestamp_us);

        if self.history.is_empty() || packet.owd_us.seq_lt(self.base_owd_us) {
            self.base_owd_us = packet.owd_us;
        }

        self.update_inter_loss(packet.sequence);

        self.size_sum += packet.size;
        self.history.push_back(packet);

        // Garbage-collect entries that fell out of the window behind the
        // newest send timestamp.
        loop {
            let expired = match (self.history.front(), self.history.back()) {
                (Some(front), Some(back)) => {
                    debug_assert!(front.tx_timestamp_us.seq_le(back.tx_timestamp_us));
                    !back
                        .tx_timestamp_us
                        .seq_lt(front.tx_timestamp_us.wrapping_add(self.window_us))
                }
                _ => false,
            };
            if !expired {
                break;
            }
            if let Some(front) = self.history.pop_front() {
                debug_assert!(self.size_sum >= front.size);
                self.size_sum -= front.size;
            }
        }
        true
    }

    fn update_inter_loss(&mut self, sequence: u16) {
        if self.history.is_empty() {
            self.loss_state = InterLossState::default();
            self.loss_state.expected_seq = sequence;
        }
        let state = &mut self.loss_state;
        if sequence == state.expected_seq {
            if let Some(front) = state.intervals.front_mut() {
                *front += 1;
            }
            state.expected_seq = state.expected_seq.wrapping_add(1);
            return;
        }
        debug_assert!(state.expected_seq.seq_lt(sequence));
        // A gap: close the current interval and start a new one.
        state.intervals.push_front(1);
        if state.intervals.len() > MAX_LOSS_INTERVALS + 1 {
            state.intervals.pop_back();
        }
        state.expected_seq = sequence.wrapping_add(1);
        state.initialized = true;
    }

    /// Current queuing delay: minimum of `owd − base` over the newest
    /// ≤ 15 history entries. The minimum filter rejects spurious spikes
    /// while tracking the lowest achievable delay quickly.
    pub fn queue_delay_us(&self) -> Option<u64> {
        if self.history.is_empty() {
            debug!("cannot compute queuing delay, history empty");
            return None;
        }
        self.history
            .iter()
            .rev()
            .take(DELAY_FILTER_TAPS)
            .map(|r| r.owd_us.wrapping_sub(self.base_owd_us))
            .min()
    }

    /// Current round-trip time: minimum over the newest ≤ 15 entries.
    pub fn rtt_us(&self) -> Option<u64> {
        if self.history.is_empty() {
            debug!("cannot compute rtt, history empty");
            return None;
        }
        self.history
            .iter()
            .rev()
            .take(DELAY_FILTER_TAPS)
            .map(|r| r.rtt_us)
            .min()
    }

    /// Raw queuing-delay samples over the whole history window, oldest
    /// first. Used by controllers that inspect every sample rather than the
    /// filtered minimum.
    pub fn queue_delays(&self) -> impl Iterator<Item = u64> + '_ {
        self.history
            .iter()
            .map(|r| r.owd_us.wrapping_sub(self.base_owd_us))
    }

    /// Packet loss over the history window. Needs at least
    /// [`MIN_HISTORY_SAMPLES`] entries.
    pub fn loss(&self) -> Option<LossInfo> {
        if self.history.len() < MIN_HISTORY_SAMPLES {
            debug!(len = self.history.len(), "history too short for loss stats");
            return None;
        }
        let front = self.history.front()?;
        let back = self.history.back()?;
        let span = u32::from(back.sequence.wrapping_sub(front.sequence)) + 1;
        debug_assert!(span as usize >= self.history.len());
        let lost = span - self.history.len() as u32;
        Some(LossInfo {
            lost,
            ratio: lost as f32 / span as f32,
        })
    }

    /// Rate at which the receiver took delivery over the history window, in
    /// bits per second. The oldest entry marks the start of the measured
    /// interval, so its own bytes are excluded. `None` with fewer than
    /// [`MIN_HISTORY_SAMPLES`] entries or a zero arrival-time span.
    pub fn receive_rate_bps(&self) -> Option<f32> {
        if self.history.len() < MIN_HISTORY_SAMPLES {
            debug!(len = self.history.len(), "history too short for receive rate");
            return None;
        }
        let front = self.history.front()?;
        let back = self.history.back()?;
        let first_rx_us = front.tx_timestamp_us.wrapping_add(front.owd_us);
        let last_rx_us = back.tx_timestamp_us.wrapping_add(back.owd_us);
        debug_assert!(first_rx_us.seq_le(last_rx_us));
        let span_us = last_rx_us.wrapping_sub(first_rx_us);
        if span_us == 0 {
            debug!("all history packets arrived simultaneously");
            return None;
        }
        debug_assert!(front.size <= self.size_sum);
        let bytes = self.size_sum - front.size;
        Some(bytes as f32 * 8.0 * 1_000_000.0 / span_us as f32)
    }

    /// TFRC-weighted average of the tracked inter-loss intervals, plus the
    /// current (still-growing) interval. `None` until a loss has been
    /// observed.
    pub fn loss_interval_stats(&self) -> Option<LossIntervalStats> {
        if !self.loss_state.initialized {
            return None;
        }
        let intervals = &self.loss_state.intervals;
        let k = intervals.len();
        debug_assert!(k >= 2 && k <= MAX_LOSS_INTERVALS + 1);

        // Two overlapping weighted sums — one excluding the newest (still
        // growing) interval, one excluding the oldest — the larger wins, so
        // a short current interval cannot drag the average down (RFC 5348).
        let sum_excl_newest: f32 = intervals
            .iter()
            .take(k - 1)
            .zip(LOSS_INTERVAL_WEIGHTS)
            .map(|(&n, w)| n as f32 * w)
            .sum();
        let sum_excl_oldest: f32 = intervals
            .iter()
            .skip(1)
            .zip(LOSS_INTERVAL_WEIGHTS)
            .map(|(&n, w)| n as f32 * w)
            .sum();
        let weight_sum: f32 = LOSS_INTERVAL_WEIGHTS.iter().take(k - 1).sum();

        Some(LossIntervalStats {
            average: sum_excl_newest.max(sum_excl_oldest) / weight_sum,
            current: intervals.front().copied().unwrap_or(0),
        })
    }
}

impl Default for PacketHistory {
    fn default() -> Self {
        Self::new()
    }
}
