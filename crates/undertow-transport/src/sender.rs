//! # Sender Flow State Machine
//!
//! Pure logic — no I/O. Takes packet sizes from the traffic source, paces
//! them through the rate shaping buffer, frames them as media packets,
//! logs every send into the congestion controller and replays decoded
//! feedback reports back into it.
//!
//! The embedder owns sockets and timers: outgoing packets come back as
//! [`OutgoingPacket`]s carrying the suggested delay until the next send,
//! and feedback datagrams are handed in as raw bytes. All entry points
//! take the current time explicitly, so a simulation clock works as well
//! as a real one.

use bytes::{Bytes, BytesMut};
use rand::Rng;
use tracing::{debug, warn};

use crate::controller::{BandwidthController, ControllerKind, FeedbackItem, RateConstraints};
use crate::feedback::FeedbackReport;
use crate::shaping::RateShaper;
use crate::stats::SenderFlowStats;
use crate::wire::{MediaHeader, WireError};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Sender flow configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Media payload type (96 = dynamic, RFC 3551).
    pub payload_type: u8,
    /// Bandwidth bounds and the initial estimate.
    pub constraints: RateConstraints,
    /// Congestion control algorithm.
    pub controller: ControllerKind,
    /// Nominal frame rate of the traffic source, used by rate shaping.
    pub fps: f32,
    /// Enable the rate shaping buffer. Disabled, the encoder target and
    /// pacing rate both follow the reference rate directly.
    pub use_buffer: bool,
    /// Largest admissible packet payload, bytes.
    pub max_payload_size: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            payload_type: 96,
            constraints: RateConstraints::default(),
            controller: ControllerKind::default(),
            fps: 30.0,
            use_buffer: true,
            max_payload_size: 1000,
        }
    }
}

// ─── Outgoing Packet ────────────────────────────────────────────────────────

/// A framed media packet ready for the transport to send.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    /// Serialized wire bytes (header + payload).
    pub data: Bytes,
    /// Sequence number assigned to this packet.
    pub sequence: u16,
    /// Payload size, bytes.
    pub size: u32,
    /// Suggested delay before dequeuing the next packet, µs (derived from
    /// the pacing rate).
    pub pacing_delay_us: u64,
}

// ─── Sender ─────────────────────────────────────────────────────────────────

/// Sender endpoint of one media flow.
pub struct MediaSender {
    config: SenderConfig,
    ssrc: u32,
    sequence: u16,
    /// Random offset for the 90 kHz media timestamp (RFC 3550: initial
    /// values should be random).
    media_ts_offset: u32,
    controller: Box<dyn BandwidthController>,
    shaper: RateShaper,
    paused: bool,
    stats: SenderFlowStats,
}

impl MediaSender {
    pub fn new(config: SenderConfig) -> Self {
        debug_assert!(config.constraints.min_bps <= config.constraints.init_bps);
        debug_assert!(config.constraints.init_bps <= config.constraints.max_bps);
        let mut rng = rand::rng();
        let controller = config.controller.build(config.constraints);
        let shaper = RateShaper::new(config.constraints.init_bps);
        MediaSender {
            ssrc: rng.random(),
            sequence: rng.random(),
            media_ts_offset: rng.random(),
            controller,
            shaper,
            paused: false,
            stats: SenderFlowStats::new(),
            config,
        }
    }

    /// This flow's synchronization source identifier.
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Encoder target rate r_vin, bps — what the traffic source should aim
    /// for.
    pub fn target_rate_bps(&self) -> f32 {
        self.shaper.encoder_rate_bps()
    }

    /// Pacing rate r_send, bps.
    pub fn pacing_rate_bps(&self) -> f32 {
        self.shaper.pacing_rate_bps()
    }

    /// The controller's current bandwidth estimate, bps. A pure read.
    pub fn bandwidth_bps(&self, now_us: u64) -> f32 {
        self.controller.bandwidth_bps(now_us)
    }

    /// Packets waiting in the shaping buffer.
    pub fn buffered_packets(&self) -> usize {
        self.shaper.len()
    }

    pub fn stats(&self) -> &SenderFlowStats {
        &self.stats
    }

    /// Queue one packet from the traffic source for pacing.
    pub fn enqueue_packet(&mut self, size: u32) -> bool {
        if self.paused {
            debug!("enqueue ignored, flow is paused");
            return false;
        }
        if size == 0 || size > self.config.max_payload_size {
            warn!(size, max = self.config.max_payload_size, "packet size rejected");
            return false;
        }
        self.shaper.push(size)
    }

    /// Dequeue, frame and log the next paced packet, if any.
    pub fn next_packet(&mut self, now_us: u64) -> Option<OutgoingPacket> {
        if self.paused {
            return None;
        }
        let size = self.shaper.pop()?;
        let sequence = self.sequence;
        self.controller.on_send_packet(now_us, sequence, size);

        let mut header = MediaHeader::new(self.config.payload_type);
        header.sequence = sequence;
        // Video payload types run a 90 kHz media clock (RFC 3551, Table 5)
        header.timestamp = self
            .media_ts_offset
            .wrapping_add((now_us.wrapping_mul(90) / 1000) as u32);
        header.ssrc = self.ssrc;

        let mut buf = BytesMut::with_capacity(header.encoded_len() + size as usize);
        header.encode(&mut buf);
        buf.resize(buf.len() + size as usize, 0); // synthetic payload

        self.sequence = self.sequence.wrapping_add(1);
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += u64::from(size);

        let pacing_delay_us =
            (f64::from(size) * 8.0 * 1_000_000.0 / f64::from(self.shaper.pacing_rate_bps())) as u64;

        Some(OutgoingPacket {
            data: buf.freeze(),
            sequence,
            size,
            pacing_delay_us,
        })
    }

    /// Process one feedback report datagram: replay this flow's per-packet
    /// entries into the controller, then refresh the shaping rates from the
    /// updated estimate.
    ///
    /// `Ok(false)` means the controller hit a flow-fatal invariant
    /// violation (broken clock, corrupted state); the embedder should tear
    /// the flow down.
    pub fn on_feedback_datagram(&mut self, now_us: u64, data: &[u8]) -> Result<bool, WireError> {
        let mut buf = data;
        let report = FeedbackReport::decode(&mut buf)?;
        self.stats.feedback_reports += 1;

        let mut ok = true;
        match report.metric_list(self.ssrc) {
            Some(metrics) => {
                let batch: Vec<FeedbackItem> = metrics
                    .iter()
                    .map(|(sequence, mb)| FeedbackItem {
                        sequence: *sequence,
                        rx_timestamp_us: mb.rx_timestamp_us,
                        ecn: mb.ecn,
                    })
                    .collect();
                self.stats.feedback_entries += batch.len() as u64;
                ok = self.controller.on_feedback_batch(now_us, &batch);
                if !ok {
                    self.stats.batch_failures += 1;
                    warn!("feedback batch aborted by invariant violation");
                }
            }
            None => {
                self.stats.reports_without_block += 1;
                debug!(ssrc = self.ssrc, "feedback report carries no block for this flow");
            }
        }

        self.update_shaping(now_us);
        Ok(ok)
    }

    /// Pause the flow: drop all buffered packets synchronously. The
    /// embedder cancels its pacing timers.
    pub fn pause(&mut self) {
        debug_assert!(!self.paused);
        self.paused = true;
        self.shaper.clear();
        debug!("flow paused, shaping buffer dropped");
    }

    /// Resume the flow: the estimate returns to the configured initial
    /// bandwidth and sending restarts from a clean sequence base.
    pub fn resume(&mut self) {
        debug_assert!(self.paused);
        self.paused = false;
        self.controller.reset();
        self.shaper.set_rates(self.config.constraints.init_bps);
        self.sequence = rand::rng().random();
        debug!(sequence = self.sequence, "flow resumed from a clean send base");
    }

    fn update_shaping(&mut self, now_us: u64) {
        let r_ref = self.controller.bandwidth_bps(now_us);
        if self.config.use_buffer {
            self.shaper.update_rates(
                r_ref,
                self.config.fps,
                self.config.constraints.min_bps,
                self.config.constraints.max_bps,
            );
        } else {
            self.shaper.set_rates(r_ref);
        }
    }
}
