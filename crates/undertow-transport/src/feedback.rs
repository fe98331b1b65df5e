//! # Congestion Control Feedback Report
//!
//! Builder and codec for the per-packet feedback report sent from the media
//! receiver back to the sender. One report carries, per media stream (SSRC),
//! a run of 2-byte metric slots covering a contiguous (wraparound-aware)
//! sequence range, plus a single reference timestamp shared by the whole
//! message.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P| FMT=11  |    PT=205     |          length               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  SSRC of report packet sender                 |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |                      SSRC of media stream                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        begin sequence         |     end sequence (incl.)      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |R|ECN|  arrival time offset    |R|ECN|  arrival time offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                              ...                              |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |               report reference timestamp (1/65536 s)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! A slot's arrival time offset counts 1/1024-second units *before* the
//! reference timestamp. Unlisted sequences inside the range get an all-zero
//! slot (not received); an odd slot count is padded to word alignment.
//!
//! The per-stream sequence range is the smallest contiguous wraparound-aware
//! span covering every recorded sequence: the scan finds the largest gap
//! between adjacent recorded sequences (the cycle-closing gap from highest
//! back to lowest included) and starts the range just past it, so bursts
//! that straddle the 16-bit wrap boundary encode in a handful of slots
//! instead of tens of thousands.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::wire::{ReportHeader, WireError, FMT_CCFB, REPORT_HEADER_SIZE, RTCP_RTPFB};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Arrival time offset too large for the 13-bit field (≈ 8 s).
pub const ATO_OVERRANGE: u16 = 0x1ffe;

/// Arrival time offset unknown; a slot carrying this value is treated as
/// lost even when its received bit is set.
pub const ATO_UNAVAILABLE: u16 = 0x1fff;

/// Maximum message length in 32-bit words (16-bit length field).
pub const MAX_REPORT_WORDS: usize = 0xffff;

// ─── Rejection ──────────────────────────────────────────────────────────────

/// Why an entry could not be added to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// ECN marking outside the 2-bit range.
    BadEcn,
    /// The (ssrc, sequence) pair is already recorded.
    Duplicate,
    /// Adding the entry would push the message past the 16-bit word-count
    /// limit. The entry has been rolled back; the report stays sendable.
    TooLong,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::BadEcn => write!(f, "ECN value exceeds 2 bits"),
            RejectReason::Duplicate => write!(f, "sequence already reported"),
            RejectReason::TooLong => write!(f, "report length limit reached"),
        }
    }
}

// ─── Metric Block ───────────────────────────────────────────────────────────

/// Per-packet arrival record inside a report block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricBlock {
    /// 2-bit ECN marking observed by the receiver.
    pub ecn: u8,
    /// Raw 13-bit arrival time offset (1/1024 s before the reference
    /// timestamp). Populated on decode; zero for locally built reports.
    pub ato: u16,
    /// Absolute arrival timestamp in µs. Exact for locally built reports;
    /// derived from the reference timestamp (quantized) after decode.
    pub rx_timestamp_us: u64,
}

/// Sparse per-stream arrival records, keyed by sequence number.
type ReportBlock = BTreeMap<u16, MetricBlock>;

// ─── Feedback Report ────────────────────────────────────────────────────────

/// A congestion control feedback message under construction or decoded off
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackReport {
    /// Padding flag of the common report header.
    pub padding: bool,
    /// SSRC of the endpoint sending the report.
    sender_ssrc: u32,
    /// Report blocks keyed by media stream SSRC. Never holds an empty block.
    blocks: BTreeMap<u32, ReportBlock>,
    /// Reference timestamp: highest arrival timestamp recorded, µs.
    reference_ts_us: u64,
    /// Message length in 32-bit words (exclusive of the first header word),
    /// recomputed after every successful mutation.
    length: u16,
}

impl FeedbackReport {
    /// Create an empty report for the given sender SSRC.
    pub fn new(sender_ssrc: u32) -> Self {
        FeedbackReport {
            padding: false,
            sender_ssrc,
            blocks: BTreeMap::new(),
            reference_ts_us: 0,
            length: 2, // sender SSRC word + reference timestamp word
        }
    }

    /// SSRC of the endpoint sending this report.
    pub fn sender_ssrc(&self) -> u32 {
        self.sender_ssrc
    }

    pub fn set_sender_ssrc(&mut self, ssrc: u32) {
        self.sender_ssrc = ssrc;
    }

    /// Reference timestamp the whole message is anchored to, µs.
    pub fn reference_ts_us(&self) -> u64 {
        self.reference_ts_us
    }

    /// True when no arrival has been recorded.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Message length in 32-bit words, exclusive of the first header word.
    pub fn word_len(&self) -> u16 {
        self.length
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        REPORT_HEADER_SIZE + (self.length as usize - 1) * 4
    }

    /// Drop all recorded arrivals so the report can be reused for the next
    /// feedback interval. The sender SSRC is kept.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.reference_ts_us = 0;
        self.length = 2;
    }

    /// Record the arrival of media packet `seq` on stream `ssrc`.
    ///
    /// On success the reference timestamp advances to the newest arrival
    /// seen. On [`RejectReason::TooLong`] the tentative entry is rolled back
    /// and the report remains valid and sendable; the caller is expected to
    /// flush the current report and retry against a fresh one.
    pub fn add_feedback(
        &mut self,
        ssrc: u32,
        seq: u16,
        rx_timestamp_us: u64,
        ecn: u8,
    ) -> Result<(), RejectReason> {
        if ecn > 0x03 {
            return Err(RejectReason::BadEcn);
        }
        let block = self.blocks.entry(ssrc).or_default();
        if block.contains_key(&seq) {
            return Err(RejectReason::Duplicate);
        }
        block.insert(
            seq,
            MetricBlock {
                ecn,
                ato: 0,
                rx_timestamp_us,
            },
        );

        let words = compute_word_len(&self.blocks);
        if words > MAX_REPORT_WORDS {
            if let Some(block) = self.blocks.get_mut(&ssrc) {
                block.remove(&seq);
                if block.is_empty() {
                    self.blocks.remove(&ssrc);
                }
            }
            return Err(RejectReason::TooLong);
        }
        self.length = words as u16;
        self.reference_ts_us = self.reference_ts_us.max(rx_timestamp_us);
        Ok(())
    }

    /// Media stream SSRCs carried by this report, ascending.
    pub fn ssrc_list(&self) -> Vec<u32> {
        self.blocks.keys().copied().collect()
    }

    /// Recorded arrivals for one stream, in encoded order: ascending from
    /// the range's begin sequence, wraparound-aware, received entries only.
    pub fn metric_list(&self, ssrc: u32) -> Option<Vec<(u16, MetricBlock)>> {
        let block = self.blocks.get(&ssrc)?;
        let (begin, stop) = begin_stop_seq(block);
        let mut out = Vec::with_capacity(block.len());
        let mut seq = begin;
        while seq != stop {
            if let Some(mb) = block.get(&seq) {
                out.push((seq, *mb));
            }
            seq = seq.wrapping_add(1);
        }
        Some(out)
    }

    /// Serialize the whole message.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        let header = ReportHeader {
            padding: self.padding,
            subtype: FMT_CCFB,
            packet_type: RTCP_RTPFB,
            length: self.length,
            sender_ssrc: self.sender_ssrc,
        };
        header.encode(&mut buf);

        for (&ssrc, block) in &self.blocks {
            debug_assert!(!block.is_empty());
            let (begin, stop) = begin_stop_seq(block);
            buf.put_u32(ssrc);
            buf.put_u16(begin);
            buf.put_u16(stop.wrapping_sub(1)); // inclusive end

            let mut slots = 0usize;
            let mut seq = begin;
            while seq != stop {
                let word = match block.get(&seq) {
                    Some(mb) => {
                        debug_assert!(mb.ecn <= 0x03);
                        let ato = self.ts_to_ato(mb.rx_timestamp_us);
                        0x8000 | (u16::from(mb.ecn) << 13) | (ato & 0x1fff)
                    }
                    None => 0,
                };
                buf.put_u16(word);
                slots += 1;
                seq = seq.wrapping_add(1);
            }
            if slots % 2 == 1 {
                buf.put_u16(0); // pad to word alignment
            }
        }

        buf.put_u32(us_to_q16(self.reference_ts_us));
        buf
    }

    /// Deserialize a message.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        let header = ReportHeader::decode(buf)?;
        if header.packet_type != RTCP_RTPFB || header.subtype != FMT_CCFB {
            return Err(WireError::WrongReportType {
                packet_type: header.packet_type,
                subtype: header.subtype,
            });
        }
        if header.length < 2 {
            return Err(WireError::BadLength(header.length));
        }

        // Report block section in 16-bit words (sender SSRC and reference
        // timestamp words excluded).
        let mut half_words = (header.length as usize - 2) * 2;
        let mut blocks: BTreeMap<u32, ReportBlock> = BTreeMap::new();
        while half_words > 0 {
            if half_words < 4 {
                return Err(WireError::BadLength(header.length));
            }
            if buf.remaining() < 8 {
                return Err(WireError::Truncated);
            }
            let ssrc = buf.get_u32();
            let begin = buf.get_u16();
            let end = buf.get_u16();
            half_words -= 4;

            let n_slots = usize::from(end.wrapping_sub(begin)) + 1;
            let n_padding = n_slots % 2;
            if half_words < n_slots + n_padding {
                return Err(WireError::BadLength(header.length));
            }
            if buf.remaining() < 2 * (n_slots + n_padding) {
                return Err(WireError::Truncated);
            }

            let block = blocks.entry(ssrc).or_default();
            let mut seq = begin;
            for _ in 0..n_slots {
                let word = buf.get_u16();
                if word & 0x8000 != 0 {
                    let ato = word & 0x1fff;
                    // An unavailable offset means the arrival could not be
                    // timestamped; treat the packet as lost.
                    if ato != ATO_UNAVAILABLE {
                        block.insert(
                            seq,
                            MetricBlock {
                                ecn: ((word >> 13) & 0x03) as u8,
                                ato,
                                rx_timestamp_us: 0,
                            },
                        );
                    }
                }
                seq = seq.wrapping_add(1);
            }
            half_words -= n_slots;
            if n_padding == 1 {
                buf.get_u16();
                half_words -= 1;
            }
            if block.is_empty() {
                return Err(WireError::EmptyReportBlock(ssrc));
            }
        }

        if buf.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let reference_ts_us = q16_to_us(buf.get_u32());

        // The reference timestamp sits at the message tail, so absolute
        // arrival timestamps can only be derived once parsing is done.
        for block in blocks.values_mut() {
            for mb in block.values_mut() {
                mb.rx_timestamp_us = ato_to_ts(reference_ts_us, mb.ato);
            }
        }

        Ok(FeedbackReport {
            padding: header.padding,
            sender_ssrc: header.sender_ssrc,
            blocks,
            reference_ts_us,
            length: header.length,
        })
    }

    /// Encode an arrival timestamp as a 13-bit offset before the reference
    /// timestamp, in 1/1024-second units, rounded to nearest and clamped to
    /// [`ATO_OVERRANGE`].
    fn ts_to_ato(&self, ts_us: u64) -> u16 {
        debug_assert!(ts_us <= self.reference_ts_us);
        let offset_us = self.reference_ts_us.saturating_sub(ts_us);
        let ato = offset_us
            .saturating_mul(1024)
            .saturating_add(500_000)
            / 1_000_000;
        ato.min(u64::from(ATO_OVERRANGE)) as u16
    }
}

/// Decode a 13-bit arrival time offset back to an absolute timestamp.
fn ato_to_ts(reference_ts_us: u64, ato: u16) -> u64 {
    if ato == ATO_OVERRANGE {
        debug!("arrival time offset overrange, timestamp clamped ~8 s before reference");
    }
    let offset_us = u64::from(ato) * 1_000_000 / 1024;
    reference_ts_us.wrapping_sub(offset_us)
}

/// Reference timestamp wire form: 1/65536-second fixed point, truncated
/// into 32 bits.
fn us_to_q16(us: u64) -> u32 {
    ((us as u128) * 65536 / 1_000_000) as u32
}

fn q16_to_us(q16: u32) -> u64 {
    u64::from(q16) * 1_000_000 / 65536
}

/// Smallest contiguous wraparound-aware `[begin, stop)` range covering every
/// recorded sequence: scan the sorted sequence list for the largest gap
/// between adjacent entries — the cycle-closing gap from the highest raw
/// value back to the lowest included — and start the range just past it.
fn begin_stop_seq(block: &ReportBlock) -> (u16, u16) {
    debug_assert!(!block.is_empty());
    let seqs: Vec<u16> = block.keys().copied().collect();
    let first = seqs[0];
    if seqs.len() == 1 {
        return (first, first.wrapping_add(1));
    }

    let (mut gap_lo, mut gap_hi) = (seqs[0], seqs[1]);
    for pair in seqs.windows(2) {
        if pair[1].wrapping_sub(pair[0]) > gap_hi.wrapping_sub(gap_lo) {
            gap_lo = pair[0];
            gap_hi = pair[1];
        }
    }
    let last = seqs[seqs.len() - 1];
    if first.wrapping_sub(last) > gap_hi.wrapping_sub(gap_lo) {
        gap_lo = last;
        gap_hi = first;
    }

    let begin = gap_hi;
    let stop = gap_lo.wrapping_add(1);
    // A zero-width result would mean a range of 65536 sequences, which the
    // 16-bit begin/end encoding cannot represent.
    debug_assert!(begin != stop, "full-range sequence spans are unsupported");
    (begin, stop)
}

/// Message length in 32-bit words, exclusive of the first header word.
fn compute_word_len(blocks: &BTreeMap<u32, ReportBlock>) -> usize {
    let mut words = 1; // sender SSRC
    for block in blocks.values() {
        words += 2; // stream SSRC + begin/end sequence
        let (begin, stop) = begin_stop_seq(block);
        let slots = usize::from(stop.wrapping_sub(begin));
        words += (slots + slots % 2) / 2; // metric slots are 16 bits
    }
    words + 1 // reference timestamp
}
