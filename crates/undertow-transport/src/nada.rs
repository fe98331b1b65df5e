//! # NADA Rate Controller
//!
//! Network-Assisted Dynamic Adaptation (rmcat NADA): a unified congestion
//! control scheme for real-time media combining delay, loss and receive-rate
//! signals into one aggregate congestion price.
//!
//! Two operating modes:
//!
//! - **Accelerated ramp-up** — no congestion observed anywhere in the
//!   history window: multiplicatively chase the measured receive rate.
//! - **Gradual update** — move the reference rate by a bounded step driven
//!   by the aggregate signal's offset from its target and by its change
//!   since the previous update, both scaled by elapsed time.
//!
//! The aggregate signal warps large queuing delays non-linearly while losses
//! are recent, so a single delay outlier cannot dominate, and adds a
//! quadratic loss penalty. Hysteresis against estimation noise comes from
//! the minimum-filtered delay inputs, the smoothed loss ratio and the
//! bounded per-update step.

use tracing::debug;

use crate::controller::{BandwidthController, RateConstraints};
use crate::history::PacketHistory;
use crate::stats::{ControllerSnapshot, Ewma};
use crate::wire::SeqOrd;

// ─── Algorithm Parameters (rmcat-nada defaults) ─────────────────────────────

/// Weight of the flow's priority.
const PRIO: f32 = 1.0;
/// Reference congestion level, ms.
const XREF_MS: f32 = 10.0;
/// Scaling of the gradual rate update.
const KAPPA: f32 = 0.5;
/// Scaling of the signal-difference term in the gradual update.
const ETA: f32 = 2.0;
/// Upper bound of RTT used in the gradual update, ms.
const TAU_MS: f32 = 500.0;
/// Target interval between rate recalculations, µs.
const DELTA_US: u64 = 100_000;
/// Allowed queuing delay build-up during accelerated ramp-up, µs.
const QEPS_US: u64 = 10_000;
/// Bound on filtering delay, µs.
const DFILT_US: u64 = 120_000;
/// Upper bound on the ramp-up rate increase ratio.
const GAMMA_MAX: f32 = 0.5;
/// Upper bound on self-inflicted queuing delay during ramp-up, ms.
const QBOUND_MS: f32 = 50.0;
/// Tolerated missing loss events, in multiples of the average loss interval.
const MULTILOSS: f32 = 7.0;
/// Queuing delay threshold that triggers non-linear warping, ms.
const QTH_MS: f32 = 50.0;
/// Exponent of the non-linear warping.
const LAMBDA: f32 = 0.5;
/// Delay penalty when the loss ratio sits at `PLRREF`, ms.
const DLOSS_MS: f32 = 10.0;
/// Reference packet loss ratio.
const PLRREF: f32 = 0.01;
/// Maximum aggregate congestion signal, ms.
const XMAX_MS: f32 = 500.0;
/// Smoothing factor for the loss-ratio filter.
const ALPHA: f32 = 0.1;

// ─── Controller ─────────────────────────────────────────────────────────────

/// NADA-style sender-based congestion controller.
pub struct NadaController {
    constraints: RateConstraints,
    history: PacketHistory,

    /// Reference rate r_ref: the current bandwidth estimate, bps.
    rate_bps: f32,
    /// When the rate was last recomputed.
    last_update_us: u64,
    last_update_valid: bool,

    // Metrics retained between updates (held when a reading is unavailable)
    qdelay_us: u64,
    rtt_us: u64,
    recv_rate_bps: f32,
    n_loss: u32,
    plr_filter: Ewma,
    avg_loss_interval: f32,
    current_loss_interval: u32,
    losses_seen: bool,

    /// Aggregate congestion signal x_curr and its previous value, ms.
    x_curr_ms: f32,
    x_prev_ms: f32,
}

impl NadaController {
    pub fn new(constraints: RateConstraints) -> Self {
        NadaController {
            constraints,
            history: PacketHistory::new(),
            rate_bps: constraints.init_bps,
            last_update_us: 0,
            last_update_valid: false,
            qdelay_us: 0,
            rtt_us: 0,
            recv_rate_bps: 0.0,
            n_loss: 0,
            plr_filter: Ewma::with_initial(ALPHA, 0.0),
            avg_loss_interval: 0.0,
            current_loss_interval: 0,
            losses_seen: false,
            x_curr_ms: 0.0,
            x_prev_ms: 0.0,
        }
    }

    /// Smoothed packet loss ratio currently feeding the aggregate signal.
    pub fn smoothed_loss_ratio(&self) -> f32 {
        self.plr_filter.value()
    }

    /// Periodic statistics snapshot.
    pub fn snapshot(&self, now_us: u64) -> ControllerSnapshot {
        ControllerSnapshot {
            algo: "nada".to_string(),
            ts_ms: now_us / 1000,
            history_len: self.history.history_len(),
            qdelay_ms: self.qdelay_us as f32 / 1000.0,
            rtt_ms: self.rtt_us as f32 / 1000.0,
            loss_count: self.n_loss,
            loss_ratio: self.plr_filter.value(),
            receive_rate_bps: self.recv_rate_bps,
            target_rate_bps: self.rate_bps,
            congestion_signal_ms: Some(self.x_curr_ms),
            avg_loss_interval: self.losses_seen.then_some(self.avg_loss_interval),
        }
    }

    /// Refresh delay, loss and rate metrics from the packet history,
    /// holding previous values where a reading is unavailable, then advance
    /// the aggregate congestion signal.
    fn update_metrics(&mut self) {
        let qdelay = self.history.queue_delay_us();
        if let Some(q) = qdelay {
            self.qdelay_us = q;
        }
        if let Some(rtt) = self.history.rtt_us() {
            self.rtt_us = rtt;
        }
        if let Some(rate) = self.history.receive_rate_bps() {
            self.recv_rate_bps = rate;
        }
        if let Some(loss) = self.history.loss() {
            self.n_loss = loss.lost;
            self.plr_filter.update(loss.ratio);
        }
        let interval_stats = self.history.loss_interval_stats();
        self.losses_seen = interval_stats.is_some();
        if let Some(stats) = interval_stats {
            self.avg_loss_interval = stats.average;
            self.current_loss_interval = stats.current;
        }

        self.x_prev_ms = self.x_curr_ms;
        if qdelay.is_some() {
            self.update_aggregate_signal();
        }
    }

    /// Non-linear warping of the queuing delay: delays past `QTH_MS` are
    /// compressed exponentially so one large outlier cannot dominate the
    /// congestion signal.
    fn warped_delay_ms(&self) -> f32 {
        let qdelay_ms = self.qdelay_us as f32 / 1000.0;
        if self.qdelay_us / 1000 > QTH_MS as u64 {
            let ratio = LAMBDA * (qdelay_ms - QTH_MS) / QTH_MS;
            QTH_MS * (-ratio).exp()
        } else {
            qdelay_ms
        }
    }

    /// Aggregate congestion signal x_curr: queuing delay (warped while a
    /// loss was observed recently, with a one-interval linear blend back
    /// out) plus a quadratic loss penalty, clipped to `XMAX_MS`.
    fn update_aggregate_signal(&mut self) {
        let x_delay = self.qdelay_us as f32 / 1000.0;
        let x_warped = self.warped_delay_ms();
        let current = self.current_loss_interval as f32;

        // The time window for "recent loss" self-adapts with the observed
        // loss intervals, tolerating up to MULTILOSS−1 missed loss events.
        let mut x = if self.losses_seen && current < MULTILOSS * self.avg_loss_interval {
            x_warped
        } else if self.losses_seen && current < (MULTILOSS + 1.0) * self.avg_loss_interval {
            // Loss recently expired: blend back to the unwarped delay over
            // one average loss interval.
            let blend = (current - MULTILOSS * self.avg_loss_interval) / self.avg_loss_interval;
            blend * x_delay + (1.0 - blend) * x_warped
        } else {
            x_delay
        };

        let plr_scaled = self.plr_filter.value() / PLRREF;
        x += DLOSS_MS * plr_scaled * plr_scaled;

        self.x_curr_ms = x.min(XMAX_MS);
    }

    /// Accelerated ramp-up is allowed only with a spotless window: no loss
    /// and no queuing-delay sample above `QEPS_US`.
    fn ramp_up_allowed(&self) -> bool {
        if self.n_loss > 0 {
            return false;
        }
        !self.history.queue_delays().any(|d| d > QEPS_US)
    }

    /// r_ref ← max(r_ref, (1 + γ) · receive_rate), with γ capped by the
    /// self-inflicted queuing delay bound.
    fn accelerated_ramp_up(&mut self) {
        let denom_ms = (self.rtt_us + DELTA_US + DFILT_US) / 1000;
        let gamma = (QBOUND_MS / denom_ms as f32).min(GAMMA_MAX);
        let candidate = (1.0 + gamma) * self.recv_rate_bps;
        if self.rate_bps < candidate {
            self.rate_bps = candidate;
        }
    }

    /// Gradual update: a bounded step against the signal's offset from its
    /// rate-dependent target, plus a damping term on the signal's change
    /// since the previous update, both scaled by elapsed time.
    fn gradual_update(&mut self, delta_us: u64) {
        let x_offset = self.x_curr_ms - PRIO * XREF_MS * self.constraints.max_bps / self.rate_bps;
        let x_diff = self.x_curr_ms - self.x_prev_ms;
        let delta_ms = delta_us as f32 / 1000.0;

        let r_offset = self.rate_bps * KAPPA * (delta_ms / TAU_MS) * (x_offset / TAU_MS);
        let r_diff = self.rate_bps * KAPPA * ETA * (x_diff / TAU_MS);

        self.rate_bps = self.rate_bps - r_offset - r_diff;
    }

    fn update_rate(&mut self, delta_us: u64) {
        if self.ramp_up_allowed() {
            self.accelerated_ramp_up();
        } else {
            self.gradual_update(delta_us);
        }
        self.rate_bps = self
            .rate_bps
            .clamp(self.constraints.min_bps, self.constraints.max_bps);
    }

    fn log_stats(&self, now_us: u64) {
        debug!(
            algo = "nada",
            ts_ms = now_us / 1000,
            loglen = self.history.history_len(),
            qdelay_ms = self.qdelay_us / 1000,
            rtt_ms = self.rtt_us / 1000,
            ploss = self.n_loss,
            plr = self.plr_filter.value(),
            xcurr = self.x_curr_ms,
            rrate = self.recv_rate_bps,
            srate = self.rate_bps,
            avgint = self.avg_loss_interval,
            curint = self.current_loss_interval,
            "rate update"
        );
    }
}

impl BandwidthController for NadaController {
    fn reset(&mut self) {
        self.history.reset();
        self.rate_bps = self.constraints.init_bps;
        self.last_update_us = 0;
        self.last_update_valid = false;
        self.qdelay_us = 0;
        self.rtt_us = 0;
        self.recv_rate_bps = 0.0;
        self.n_loss = 0;
        self.plr_filter = Ewma::with_initial(ALPHA, 0.0);
        self.avg_loss_interval = 0.0;
        self.current_loss_interval = 0;
        self.losses_seen = false;
        self.x_curr_ms = 0.0;
        self.x_prev_ms = 0.0;
    }

    fn on_send_packet(&mut self, now_us: u64, sequence: u16, size: u32) -> bool {
        self.history.on_send(now_us, sequence, size)
    }

    fn on_feedback(&mut self, now_us: u64, sequence: u16, rx_timestamp_us: u64, ecn: u8) -> bool {
        if !self.history.on_feedback(now_us, sequence, rx_timestamp_us, ecn) {
            return false;
        }

        if !self.last_update_valid {
            // First feedback only arms the update clock.
            self.last_update_us = now_us;
            self.last_update_valid = true;
            return true;
        }

        debug_assert!(self.last_update_us.seq_le(now_us));
        let delta_us = now_us.wrapping_sub(self.last_update_us);
        if delta_us >= DELTA_US {
            self.update_metrics();
            self.update_rate(delta_us);
            self.log_stats(now_us);
            self.last_update_us = now_us;
        }
        true
    }

    fn bandwidth_bps(&self, _now_us: u64) -> f32 {
        self.rate_bps
    }

    fn set_bandwidth_bps(&mut self, bps: f32) {
        self.rate_bps = bps;
    }
}
