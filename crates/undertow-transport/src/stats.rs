//! # Flow Statistics
//!
//! Per-flow counters and controller snapshots, designed for JSON
//! serialization into test logs and dashboards.

use serde::Serialize;

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Aggregate sender-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderFlowStats {
    /// Media packets emitted.
    pub packets_sent: u64,
    /// Payload bytes emitted.
    pub bytes_sent: u64,
    /// Feedback reports processed.
    pub feedback_reports: u64,
    /// Per-packet feedback entries replayed into the controller.
    pub feedback_entries: u64,
    /// Reports that carried no block for this flow's SSRC.
    pub reports_without_block: u64,
    /// Feedback batches aborted by an invariant violation.
    pub batch_failures: u64,
}

impl SenderFlowStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of sent packets that have been fed back so far.
    pub fn feedback_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.feedback_entries as f64 / self.packets_sent as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Aggregate receiver-side statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverFlowStats {
    /// Media packets received (including duplicates).
    pub packets_received: u64,
    /// Wire bytes received.
    pub bytes_received: u64,
    /// Duplicate arrivals rejected by the report builder.
    pub duplicates: u64,
    /// Packets dropped for carrying an unexpected SSRC.
    pub foreign_ssrc_drops: u64,
    /// Feedback reports sent on the periodic schedule.
    pub reports_sent: u64,
    /// Reports flushed early because the next entry would not fit.
    pub early_flushes: u64,
}

impl ReceiverFlowStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duplicates per received packet.
    pub fn duplicate_ratio(&self) -> f64 {
        if self.packets_received == 0 {
            0.0
        } else {
            self.duplicates as f64 / self.packets_received as f64
        }
    }
}

// ─── Controller Snapshot ────────────────────────────────────────────────────

/// One controller statistics sample, emitted once per rate update.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    /// Algorithm name.
    pub algo: String,
    /// Sample time, ms.
    pub ts_ms: u64,
    /// History ledger length at sample time.
    pub history_len: usize,
    /// Minimum-filtered queuing delay, ms.
    pub qdelay_ms: f32,
    /// Minimum-filtered round-trip time, ms.
    pub rtt_ms: f32,
    /// Packets lost in the current window.
    pub loss_count: u32,
    /// (Smoothed) packet loss ratio.
    pub loss_ratio: f32,
    /// Measured receive rate, bps.
    pub receive_rate_bps: f32,
    /// Controller output rate, bps.
    pub target_rate_bps: f32,
    /// Aggregate congestion signal, ms (adaptive controllers only).
    pub congestion_signal_ms: Option<f32>,
    /// Average inter-loss interval, packets (once losses were seen).
    pub avg_loss_interval: Option<f32>,
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Smoothing factor (0.0 - 1.0). Higher = more responsive.
    alpha: f32,
    /// Current smoothed value.
    value: f32,
    /// Whether the first sample has been applied.
    initialized: bool,
}

impl Ewma {
    /// Create an EWMA that adopts the first sample as its starting value.
    pub fn new(alpha: f32) -> Self {
        debug_assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma {
            alpha,
            value: 0.0,
            initialized: false,
        }
    }

    /// Create an EWMA that filters from a fixed starting value, so early
    /// samples are discounted rather than adopted outright.
    pub fn with_initial(alpha: f32, initial: f32) -> Self {
        debug_assert!((0.0..=1.0).contains(&alpha), "alpha must be in [0, 1]");
        Ewma {
            alpha,
            value: initial,
            initialized: true,
        }
    }

    /// Update with a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f32) -> f32 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value += self.alpha * (sample - self.value);
        }
        self.value
    }

    /// Get the current smoothed value.
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Reset to uninitialized state.
    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}
