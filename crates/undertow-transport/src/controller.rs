//! # Controller Capability Interface
//!
//! All congestion control algorithms are sender-based: the algorithm runs
//! exclusively at the sender endpoint, fed by per-packet arrival feedback
//! from the receiver. Each algorithm implements [`BandwidthController`] and
//! owns its own [`PacketHistory`](crate::history::PacketHistory); selection
//! happens through static configuration ([`ControllerKind`]), not runtime
//! inheritance.
//!
//! Update ordering is the embedder's job: `on_send_packet` at transmit
//! time, `on_feedback_batch` once per decoded feedback report, all from a
//! single-threaded event loop.

use crate::cbr::CbrController;
use crate::nada::NadaController;
use crate::wire::SeqOrd;

// ─── Feedback Item ──────────────────────────────────────────────────────────

/// One fed-back packet, as replayed from a decoded feedback report.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackItem {
    /// Media packet sequence number.
    pub sequence: u16,
    /// Arrival timestamp at the receiver, µs.
    pub rx_timestamp_us: u64,
    /// 2-bit ECN marking seen by the receiver.
    pub ecn: u8,
}

// ─── Rate Constraints ───────────────────────────────────────────────────────

/// Bandwidth bounds for a flow. Controllers never output a rate outside
/// `[min_bps, max_bps]`; `init_bps` seeds the estimate at flow start and
/// after a resume.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RateConstraints {
    pub init_bps: f32,
    pub min_bps: f32,
    pub max_bps: f32,
}

impl Default for RateConstraints {
    fn default() -> Self {
        RateConstraints {
            init_bps: 150_000.0,
            min_bps: 150_000.0,
            max_bps: 1_500_000.0,
        }
    }
}

// ─── Capability Trait ───────────────────────────────────────────────────────

/// The sender-side congestion controller capability.
pub trait BandwidthController {
    /// Return the controller to its freshly-constructed state (configured
    /// rate constraints are kept).
    fn reset(&mut self);

    /// Log a media packet at send time. Returns false when the record was
    /// rejected (sequence discontinuity) — non-fatal, logged.
    fn on_send_packet(&mut self, now_us: u64, sequence: u16, size: u32) -> bool;

    /// Process feedback for a single media packet. Returns false only on
    /// invariant violations that abort the flow (see
    /// [`PacketHistory::on_feedback`](crate::history::PacketHistory::on_feedback)).
    fn on_feedback(&mut self, now_us: u64, sequence: u16, rx_timestamp_us: u64, ecn: u8) -> bool;

    /// Process one decoded feedback report's entries in order.
    fn on_feedback_batch(&mut self, now_us: u64, batch: &[FeedbackItem]) -> bool {
        for item in batch {
            debug_assert!(item.rx_timestamp_us.seq_lt(now_us.wrapping_add(1)));
            if !self.on_feedback(now_us, item.sequence, item.rx_timestamp_us, item.ecn) {
                return false;
            }
        }
        true
    }

    /// The current bandwidth estimate in bps. A pure read: never mutates
    /// state or recomputes — recomputation happens only on the feedback
    /// path.
    fn bandwidth_bps(&self, now_us: u64) -> f32;

    /// Overwrite the current estimate. Useful in test environments to
    /// disrupt the estimate deliberately.
    fn set_bandwidth_bps(&mut self, bps: f32);
}

// ─── Algorithm Selection ────────────────────────────────────────────────────

/// Which congestion control algorithm a flow uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ControllerKind {
    /// Constant bitrate: no adaptation, metrics logged only.
    ConstantRate,
    /// NADA delay+loss gradual adaptation with accelerated ramp-up.
    #[default]
    Nada,
}

impl ControllerKind {
    /// Build a controller of this kind with the given rate constraints.
    pub fn build(self, constraints: RateConstraints) -> Box<dyn BandwidthController> {
        match self {
            ControllerKind::ConstantRate => Box::new(CbrController::new(constraints)),
            ControllerKind::Nada => Box::new(NadaController::new(constraints)),
        }
    }
}
