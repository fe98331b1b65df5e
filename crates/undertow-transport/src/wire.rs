//! # Undertow Wire Format
//!
//! Fixed-layout framing for media packets and feedback reports.
//!
//! ## Media Packet Header (RTP, RFC 3550; 12-72 bytes)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
//! |            contributing source (CSRC) identifiers             |
//! |                             ....                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! ## Common Report Header (RTCP; 8 bytes)
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|   FMT   |       PT      |          length               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                 SSRC of report packet sender                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `length` counts 32-bit words, exclusive of the first header word
//! (standard RTCP accounting). All fields are big-endian on the wire.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeSet;
use std::fmt;

// ─── Constants ───────────────────────────────────────────────────────────────

/// RTP/RTCP protocol version.
pub const RTP_VERSION: u8 = 2;

/// Media header size without contributing sources.
pub const MEDIA_HEADER_MIN_SIZE: usize = 12;

/// Maximum number of contributing sources (4-bit count field).
pub const MAX_CSRCS: usize = 15;

/// Common report header size.
pub const REPORT_HEADER_SIZE: usize = 8;

/// RTCP packet type for transport-layer feedback (RFC 4585).
pub const RTCP_RTPFB: u8 = 205;

/// Feedback message sub-type (FMT) for congestion control feedback.
pub const FMT_CCFB: u8 = 11;

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Decoding failure for a wire-format header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Input shorter than the encoded structure.
    Truncated,
    /// Version field does not match [`RTP_VERSION`].
    BadVersion(u8),
    /// Report packet type / sub-type is not a congestion control feedback
    /// report.
    WrongReportType { packet_type: u8, subtype: u8 },
    /// The same contributing source appeared twice in a media header.
    DuplicateCsrc(u32),
    /// A report block decoded to zero metric entries. Empty blocks are
    /// pruned before serialization, so this indicates a corrupt message.
    EmptyReportBlock(u32),
    /// Declared message length disagrees with the block contents.
    BadLength(u16),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated => write!(f, "input truncated"),
            WireError::BadVersion(v) => write!(f, "bad protocol version {v}"),
            WireError::WrongReportType { packet_type, subtype } => {
                write!(f, "not a congestion feedback report (pt={packet_type}, fmt={subtype})")
            }
            WireError::DuplicateCsrc(csrc) => write!(f, "duplicate CSRC {csrc:#010x}"),
            WireError::EmptyReportBlock(ssrc) => {
                write!(f, "report block for SSRC {ssrc:#010x} has no entries")
            }
            WireError::BadLength(words) => write!(f, "inconsistent message length {words}"),
        }
    }
}

impl std::error::Error for WireError {}

// ─── Sequence Ordering ──────────────────────────────────────────────────────

/// Wraparound-aware ordering for sequence numbers and timestamps.
///
/// `a.seq_lt(b)` is true iff the wrapping distance from `a` forward to `b`
/// is shorter than the distance from `b` forward to `a` — equivalently, the
/// signed difference `b - a` is positive. Every ordering predicate on
/// sequences or clock values in this crate goes through this comparison,
/// never plain `<`.
pub trait SeqOrd: Copy {
    /// Wraparound-aware strict "comes before".
    fn seq_lt(self, other: Self) -> bool;

    /// Wraparound-aware "comes before or equal".
    fn seq_le(self, other: Self) -> bool {
        !other.seq_lt(self)
    }
}

macro_rules! impl_seq_ord {
    ($($ty:ty),*) => {
        $(impl SeqOrd for $ty {
            fn seq_lt(self, other: Self) -> bool {
                other.wrapping_sub(self) < self.wrapping_sub(other)
            }
        })*
    };
}

impl_seq_ord!(u16, u32, u64);

// ─── Media Packet Header ────────────────────────────────────────────────────

/// Decoded media packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHeader {
    /// Padding flag.
    pub padding: bool,
    /// Header extension flag.
    pub extension: bool,
    /// Marker bit (last packet of a frame, by convention).
    pub marker: bool,
    /// 7-bit payload type.
    pub payload_type: u8,
    /// 16-bit sequence number, wraps.
    pub sequence: u16,
    /// Media clock timestamp (90 kHz for video payload types).
    pub timestamp: u32,
    /// Synchronization source identifier.
    pub ssrc: u32,
    /// Contributing sources; at most [`MAX_CSRCS`], no duplicates.
    pub csrcs: BTreeSet<u32>,
}

impl MediaHeader {
    /// Create a header with the given payload type and zeroed fields.
    pub fn new(payload_type: u8) -> Self {
        debug_assert!(payload_type <= 0x7f);
        MediaHeader {
            padding: false,
            extension: false,
            marker: false,
            payload_type,
            sequence: 0,
            timestamp: 0,
            ssrc: 0,
            csrcs: BTreeSet::new(),
        }
    }

    /// Add a contributing source. Returns false if it is already present or
    /// the 4-bit count field is exhausted.
    pub fn add_csrc(&mut self, csrc: u32) -> bool {
        if self.csrcs.len() >= MAX_CSRCS {
            return false;
        }
        self.csrcs.insert(csrc)
    }

    /// Total encoded size of this header.
    pub fn encoded_len(&self) -> usize {
        MEDIA_HEADER_MIN_SIZE + 4 * self.csrcs.len()
    }

    /// Encode the header into a buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(self.csrcs.len() <= MAX_CSRCS);
        debug_assert!(self.payload_type <= 0x7f);

        // Octet 1: V V P X C C C C
        let octet1: u8 = (RTP_VERSION << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrcs.len() as u8 & 0x0f);
        buf.put_u8(octet1);

        // Octet 2: M + 7-bit payload type
        let octet2: u8 = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        buf.put_u8(octet2);

        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for &csrc in &self.csrcs {
            buf.put_u32(csrc);
        }
    }

    /// Decode a header from a buffer.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < MEDIA_HEADER_MIN_SIZE {
            return Err(WireError::Truncated);
        }

        let octet1 = buf.get_u8();
        let version = octet1 >> 6;
        if version != RTP_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let padding = (octet1 >> 5) & 1 == 1;
        let extension = (octet1 >> 4) & 1 == 1;
        let csrc_count = (octet1 & 0x0f) as usize;

        let octet2 = buf.get_u8();
        let marker = octet2 >> 7 == 1;
        let payload_type = octet2 & 0x7f;

        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < 4 * csrc_count {
            return Err(WireError::Truncated);
        }
        let mut csrcs = BTreeSet::new();
        for _ in 0..csrc_count {
            let csrc = buf.get_u32();
            if !csrcs.insert(csrc) {
                return Err(WireError::DuplicateCsrc(csrc));
            }
        }

        Ok(MediaHeader {
            padding,
            extension,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrcs,
        })
    }
}

// ─── Common Report Header ───────────────────────────────────────────────────

/// Common header shared by all feedback report messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportHeader {
    /// Padding flag.
    pub padding: bool,
    /// 5-bit message sub-type (FMT).
    pub subtype: u8,
    /// Report packet type.
    pub packet_type: u8,
    /// Message length in 32-bit words, exclusive of the first header word.
    pub length: u16,
    /// SSRC of the endpoint sending this report.
    pub sender_ssrc: u32,
}

impl ReportHeader {
    /// Create a header for the given packet type and sub-type.
    pub fn new(packet_type: u8, subtype: u8) -> Self {
        debug_assert!(subtype <= 0x1f);
        ReportHeader {
            padding: false,
            subtype,
            packet_type,
            length: 1,
            sender_ssrc: 0,
        }
    }

    /// Encode the header into a buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(self.subtype <= 0x1f);
        let octet1: u8 =
            (RTP_VERSION << 6) | ((self.padding as u8) << 5) | (self.subtype & 0x1f);
        buf.put_u8(octet1);
        buf.put_u8(self.packet_type);
        buf.put_u16(self.length);
        buf.put_u32(self.sender_ssrc);
    }

    /// Decode a header from a buffer.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < REPORT_HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let octet1 = buf.get_u8();
        let version = octet1 >> 6;
        if version != RTP_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let padding = (octet1 >> 5) & 1 == 1;
        let subtype = octet1 & 0x1f;
        let packet_type = buf.get_u8();
        let length = buf.get_u16();
        let sender_ssrc = buf.get_u32();
        Ok(ReportHeader {
            padding,
            subtype,
            packet_type,
            length,
            sender_ssrc,
        })
    }
}
