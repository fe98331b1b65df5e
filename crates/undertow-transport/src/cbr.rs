//! # Constant-Rate Controller
//!
//! No adaptation: the configured rate is returned unconditionally. The
//! packet history still runs so delay, loss and receive-rate metrics are
//! tracked and logged — useful as a load generator and as a baseline when
//! evaluating adaptive controllers.

use tracing::debug;

use crate::controller::{BandwidthController, RateConstraints};
use crate::history::PacketHistory;
use crate::stats::ControllerSnapshot;
use crate::wire::SeqOrd;

/// Interval between metric refreshes, µs.
const CALC_INTERVAL_US: u64 = 200_000;

/// Fixed-rate sender-based controller.
pub struct CbrController {
    constraints: RateConstraints,
    history: PacketHistory,
    last_calc_us: u64,
    last_calc_valid: bool,

    qdelay_us: u64,
    n_loss: u32,
    loss_ratio: f32,
    recv_rate_bps: f32,
}

impl CbrController {
    pub fn new(constraints: RateConstraints) -> Self {
        CbrController {
            constraints,
            history: PacketHistory::new(),
            last_calc_us: 0,
            last_calc_valid: false,
            qdelay_us: 0,
            n_loss: 0,
            loss_ratio: 0.0,
            recv_rate_bps: 0.0,
        }
    }

    /// Periodic statistics snapshot.
    pub fn snapshot(&self, now_us: u64) -> ControllerSnapshot {
        ControllerSnapshot {
            algo: "cbr".to_string(),
            ts_ms: now_us / 1000,
            history_len: self.history.history_len(),
            qdelay_ms: self.qdelay_us as f32 / 1000.0,
            rtt_ms: 0.0,
            loss_count: self.n_loss,
            loss_ratio: self.loss_ratio,
            receive_rate_bps: self.recv_rate_bps,
            target_rate_bps: self.constraints.init_bps,
            congestion_signal_ms: None,
            avg_loss_interval: None,
        }
    }

    fn update_metrics(&mut self) {
        if let Some(qdelay) = self.history.queue_delay_us() {
            self.qdelay_us = qdelay;
        }
        if let Some(rate) = self.history.receive_rate_bps() {
            self.recv_rate_bps = rate;
        }
        if let Some(loss) = self.history.loss() {
            self.n_loss = loss.lost;
            self.loss_ratio = loss.ratio;
        }
    }

    fn log_stats(&self, now_us: u64) {
        debug!(
            algo = "cbr",
            ts_ms = now_us / 1000,
            loglen = self.history.history_len(),
            qdelay_ms = self.qdelay_us / 1000,
            ploss = self.n_loss,
            plr = self.loss_ratio,
            rrate = self.recv_rate_bps,
            srate = self.constraints.init_bps,
            "metrics"
        );
    }
}

impl BandwidthController for CbrController {
    fn reset(&mut self) {
        self.history.reset();
        self.last_calc_us = 0;
        self.last_calc_valid = false;
        self.qdelay_us = 0;
        self.n_loss = 0;
        self.loss_ratio = 0.0;
        self.recv_rate_bps = 0.0;
    }

    fn on_send_packet(&mut self, now_us: u64, sequence: u16, size: u32) -> bool {
        self.history.on_send(now_us, sequence, size)
    }

    fn on_feedback(&mut self, now_us: u64, sequence: u16, rx_timestamp_us: u64, ecn: u8) -> bool {
        let ok = self.history.on_feedback(now_us, sequence, rx_timestamp_us, ecn);
        if self.last_calc_valid {
            debug_assert!(self.last_calc_us.seq_le(now_us));
            if now_us.wrapping_sub(self.last_calc_us) >= CALC_INTERVAL_US {
                self.update_metrics();
                self.log_stats(now_us);
                self.last_calc_us = now_us;
            }
        } else {
            self.last_calc_us = now_us;
            self.last_calc_valid = true;
        }
        ok
    }

    fn bandwidth_bps(&self, _now_us: u64) -> f32 {
        self.constraints.init_bps
    }

    fn set_bandwidth_bps(&mut self, bps: f32) {
        self.constraints.init_bps = bps;
    }
}
