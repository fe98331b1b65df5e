//! Property-based tests for the feedback report codec.
//!
//! Round-trip correctness over arbitrary sparse sequence sets, ECN
//! markings and arrival timestamps, plus the wraparound ordering
//! guarantees the codec's range selection relies on.

use proptest::prelude::*;
use std::collections::BTreeMap;
use undertow_transport::feedback::{FeedbackReport, RejectReason};
use undertow_transport::wire::SeqOrd;

/// Arbitrary per-stream arrivals: unique sequences, 2-bit ECN, timestamps
/// within the 13-bit offset range of one another (so nothing clamps to the
/// overrange sentinel).
fn arrivals() -> impl Strategy<Value = Vec<(u16, u8, u64)>> {
    proptest::collection::btree_map(any::<u16>(), (0u8..=3, 0u64..7_000_000), 1..60).prop_map(
        |entries| {
            entries
                .into_iter()
                .map(|(seq, (ecn, offset))| (seq, ecn, 1_000_000 + offset))
                .collect()
        },
    )
}

proptest! {
    #[test]
    fn roundtrip_preserves_metric_sets(
        entries in arrivals(),
        ssrc in any::<u32>(),
        sender_ssrc in any::<u32>(),
    ) {
        let mut report = FeedbackReport::new(sender_ssrc);
        for &(seq, ecn, ts) in &entries {
            prop_assert_eq!(report.add_feedback(ssrc, seq, ts, ecn), Ok(()));
        }

        let encoded = report.encode();
        prop_assert_eq!(encoded.len(), report.encoded_len());
        prop_assert_eq!(encoded.len() % 4, 0);

        let decoded = FeedbackReport::decode(&mut encoded.freeze()).unwrap();
        prop_assert_eq!(decoded.sender_ssrc(), sender_ssrc);
        prop_assert_eq!(decoded.ssrc_list(), vec![ssrc]);

        let metrics = decoded.metric_list(ssrc).unwrap();
        prop_assert_eq!(metrics.len(), entries.len());

        let expected: BTreeMap<u16, (u8, u64)> = entries
            .iter()
            .map(|&(seq, ecn, ts)| (seq, (ecn, ts)))
            .collect();
        for (seq, mb) in &metrics {
            let &(ecn, ts) = expected.get(seq).unwrap();
            prop_assert_eq!(mb.ecn, ecn);
            prop_assert!(
                mb.rx_timestamp_us.abs_diff(ts) <= 1_000,
                "timestamp drifted past one quantization step: {} vs {}",
                mb.rx_timestamp_us,
                ts
            );
        }
    }

    #[test]
    fn metric_list_is_wraparound_ascending(entries in arrivals(), ssrc in any::<u32>()) {
        let mut report = FeedbackReport::new(1);
        for &(seq, ecn, ts) in &entries {
            report.add_feedback(ssrc, seq, ts, ecn).unwrap();
        }
        let metrics = report.metric_list(ssrc).unwrap();
        for pair in metrics.windows(2) {
            prop_assert!(
                pair[0].0.seq_lt(pair[1].0),
                "{} must come before {}",
                pair[0].0,
                pair[1].0
            );
        }
    }

    #[test]
    fn duplicates_always_rejected(
        seq in any::<u16>(),
        ssrc in any::<u32>(),
        ts in 0u64..10_000_000,
        ecn in 0u8..=3,
    ) {
        let mut report = FeedbackReport::new(1);
        report.add_feedback(ssrc, seq, ts, ecn).unwrap();
        prop_assert_eq!(
            report.add_feedback(ssrc, seq, ts + 1, ecn),
            Err(RejectReason::Duplicate)
        );
    }

    #[test]
    fn bad_ecn_always_rejected(ecn in 4u8..=255, seq in any::<u16>()) {
        let mut report = FeedbackReport::new(1);
        prop_assert_eq!(
            report.add_feedback(7, seq, 1_000, ecn),
            Err(RejectReason::BadEcn)
        );
        prop_assert!(report.is_empty());
    }

    #[test]
    fn seq_ordering_is_antisymmetric(a in any::<u16>(), b in any::<u16>()) {
        if a == b {
            prop_assert!(!a.seq_lt(b));
            prop_assert!(!b.seq_lt(a));
        } else if b.wrapping_sub(a) == 0x8000 {
            // Exactly half the sequence space apart: neither is "before"
            prop_assert!(!a.seq_lt(b));
            prop_assert!(!b.seq_lt(a));
        } else {
            prop_assert_ne!(a.seq_lt(b), b.seq_lt(a));
        }
    }
}
