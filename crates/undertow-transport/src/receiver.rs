//! # Receiver Flow State Machine
//!
//! Pure logic — no I/O. Decodes incoming media packets, timestamps their
//! arrival and batches per-packet records into a feedback report that is
//! flushed on a periodic schedule (or early, when the next record would
//! not fit the report's length limit).
//!
//! The embedder owns the socket and the feedback timer: it calls
//! [`on_media_datagram`](MediaReceiver::on_media_datagram) per received
//! datagram — sending any early-flushed report it returns — and
//! [`poll_feedback`](MediaReceiver::poll_feedback) every
//! [`feedback_period_us`](MediaReceiver::feedback_period_us).

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, warn};

use crate::feedback::{FeedbackReport, RejectReason};
use crate::stats::ReceiverFlowStats;
use crate::wire::{MediaHeader, WireError};

/// Default interval between feedback reports, µs.
pub const DEFAULT_FEEDBACK_PERIOD_US: u64 = 20_000;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Receiver flow configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Interval between periodic feedback reports, µs.
    pub feedback_period_us: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            feedback_period_us: DEFAULT_FEEDBACK_PERIOD_US,
        }
    }
}

// ─── Receiver ───────────────────────────────────────────────────────────────

/// Receiver endpoint of one media flow.
pub struct MediaReceiver {
    config: ReceiverConfig,
    /// SSRC this endpoint signs its reports with.
    ssrc: u32,
    /// Media stream this flow is locked to, latched from the first packet.
    remote_ssrc: Option<u32>,
    report: FeedbackReport,
    stats: ReceiverFlowStats,
}

impl MediaReceiver {
    pub fn new(config: ReceiverConfig) -> Self {
        let ssrc = rand::rng().random();
        MediaReceiver {
            config,
            ssrc,
            remote_ssrc: None,
            report: FeedbackReport::new(ssrc),
            stats: ReceiverFlowStats::new(),
        }
    }

    /// SSRC this endpoint signs its feedback reports with.
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// The media stream this flow is locked to, once the first packet
    /// arrived.
    pub fn remote_ssrc(&self) -> Option<u32> {
        self.remote_ssrc
    }

    /// Scheduling hint for the embedder's feedback timer, µs.
    pub fn feedback_period_us(&self) -> u64 {
        self.config.feedback_period_us
    }

    pub fn stats(&self) -> &ReceiverFlowStats {
        &self.stats
    }

    /// Process one received media datagram, recording its arrival for the
    /// next feedback report.
    ///
    /// Returns `Ok(Some(bytes))` when the pending report had to be flushed
    /// early to make room — the embedder sends those bytes immediately.
    pub fn on_media_datagram(
        &mut self,
        now_us: u64,
        data: &[u8],
        ecn: u8,
    ) -> Result<Option<Bytes>, WireError> {
        let mut buf = data;
        let header = MediaHeader::decode(&mut buf)?;

        match self.remote_ssrc {
            None => self.remote_ssrc = Some(header.ssrc),
            Some(expected) if expected != header.ssrc => {
                // Single-flow endpoint: competing streams are dropped.
                warn!(ssrc = header.ssrc, expected, "media packet from foreign stream dropped");
                self.stats.foreign_ssrc_drops += 1;
                return Ok(None);
            }
            Some(_) => {}
        }

        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;

        match self
            .report
            .add_feedback(header.ssrc, header.sequence, now_us, ecn)
        {
            Ok(()) => Ok(None),
            Err(RejectReason::Duplicate) => {
                debug!(sequence = header.sequence, "duplicate arrival not re-reported");
                self.stats.duplicates += 1;
                Ok(None)
            }
            Err(RejectReason::BadEcn) => {
                warn!(ecn, "transport delivered an invalid ECN marking, arrival dropped");
                Ok(None)
            }
            Err(RejectReason::TooLong) => {
                // Flush the full report now and retry against a fresh one.
                let flushed = self.take_report();
                self.stats.early_flushes += 1;
                let retry = self
                    .report
                    .add_feedback(header.ssrc, header.sequence, now_us, ecn);
                debug_assert!(retry.is_ok(), "a fresh report must accept a single entry");
                Ok(Some(flushed))
            }
        }
    }

    /// Serialize and clear the pending report, if it has anything to say.
    /// Call once per feedback period; empty reports are not sent.
    pub fn poll_feedback(&mut self) -> Option<Bytes> {
        if self.report.is_empty() {
            return None;
        }
        self.stats.reports_sent += 1;
        Some(self.take_report())
    }

    fn take_report(&mut self) -> Bytes {
        let bytes = self.report.encode().freeze();
        self.report.clear();
        bytes
    }
}

impl Default for MediaReceiver {
    fn default() -> Self {
        Self::new(ReceiverConfig::default())
    }
}
