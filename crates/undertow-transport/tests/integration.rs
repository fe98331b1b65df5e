//! End-to-end flow scenarios over a simulated network path.
//!
//! A minimal event loop stands in for the embedder: it paces the sender,
//! models a (optionally bottlenecked, lossy) link, runs the receiver's
//! periodic feedback timer and carries reports back to the sender. The
//! protocol state machines themselves never see the difference between
//! this and a live deployment.

use bytes::Bytes;
use undertow_transport::controller::{ControllerKind, RateConstraints};
use undertow_transport::receiver::{MediaReceiver, ReceiverConfig};
use undertow_transport::sender::{MediaSender, SenderConfig};

const PACKET_SIZE: u32 = 1000;

// ─── Path Model ─────────────────────────────────────────────────────────────

/// One-way link: optional bottleneck with an unbounded FIFO queue, fixed
/// propagation delay, optional periodic loss.
struct PathModel {
    capacity_bps: Option<f64>,
    prop_delay_us: u64,
    busy_until_us: u64,
    /// Drop every Nth packet.
    drop_every: Option<u64>,
    sent_count: u64,
}

impl PathModel {
    fn new(capacity_bps: Option<f64>, prop_delay_us: u64, drop_every: Option<u64>) -> Self {
        PathModel {
            capacity_bps,
            prop_delay_us,
            busy_until_us: 0,
            drop_every,
            sent_count: 0,
        }
    }

    /// Arrival time at the far end, or None when the packet is dropped.
    fn transmit(&mut self, now_us: u64, size_bytes: u32) -> Option<u64> {
        self.sent_count += 1;
        if let Some(n) = self.drop_every {
            if self.sent_count % n == 0 {
                return None;
            }
        }
        let departure_us = match self.capacity_bps {
            Some(capacity) => {
                let serialize_us = (f64::from(size_bytes) * 8.0 * 1e6 / capacity) as u64;
                let start = now_us.max(self.busy_until_us);
                self.busy_until_us = start + serialize_us;
                self.busy_until_us
            }
            None => now_us,
        };
        Some(departure_us + self.prop_delay_us)
    }
}

// ─── Event Loop ─────────────────────────────────────────────────────────────

enum Event {
    /// Traffic source produces the next packet.
    Enqueue,
    /// Pacer dequeues and transmits.
    Pace,
    /// Media packet reaches the receiver.
    MediaArrival(Bytes),
    /// Receiver's periodic feedback timer.
    FeedbackTimer,
    /// Feedback report reaches the sender.
    FeedbackArrival(Bytes),
}

/// Drive the flow from `start_us` to `end_us`.
fn run(
    tx: &mut MediaSender,
    rx: &mut MediaReceiver,
    path: &mut PathModel,
    start_us: u64,
    end_us: u64,
) {
    let fb_delay_us = path.prop_delay_us; // feedback path: uncongested, symmetric delay
    let mut events: Vec<(u64, u64, Event)> = Vec::new();
    let mut tie = 0u64;
    let mut next_send_ok_us = start_us;

    events.push((start_us, tie, Event::Enqueue));
    tie += 1;
    events.push((start_us + rx.feedback_period_us(), tie, Event::FeedbackTimer));
    tie += 1;

    loop {
        let due = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.0 <= end_us)
            .min_by_key(|(_, e)| (e.0, e.1))
            .map(|(i, _)| i);
        let Some(idx) = due else { break };
        let (now, _, event) = events.swap_remove(idx);

        match event {
            Event::Enqueue => {
                let was_empty = tx.buffered_packets() == 0;
                tx.enqueue_packet(PACKET_SIZE);
                // The traffic source paces itself at the encoder target rate
                let target = f64::from(tx.target_rate_bps()).max(1.0);
                let next_us = now + (f64::from(PACKET_SIZE) * 8.0 * 1e6 / target) as u64;
                events.push((next_us, tie, Event::Enqueue));
                tie += 1;
                if was_empty && tx.buffered_packets() > 0 {
                    events.push((now.max(next_send_ok_us), tie, Event::Pace));
                    tie += 1;
                }
            }
            Event::Pace => {
                if let Some(pkt) = tx.next_packet(now) {
                    if let Some(arrival_us) = path.transmit(now, pkt.size) {
                        events.push((arrival_us, tie, Event::MediaArrival(pkt.data)));
                        tie += 1;
                    }
                    next_send_ok_us = now + pkt.pacing_delay_us;
                    if tx.buffered_packets() > 0 {
                        events.push((next_send_ok_us, tie, Event::Pace));
                        tie += 1;
                    }
                }
            }
            Event::MediaArrival(data) => {
                if let Ok(Some(flushed)) = rx.on_media_datagram(now, &data, 0) {
                    events.push((now + fb_delay_us, tie, Event::FeedbackArrival(flushed)));
                    tie += 1;
                }
            }
            Event::FeedbackTimer => {
                if let Some(report) = rx.poll_feedback() {
                    events.push((now + fb_delay_us, tie, Event::FeedbackArrival(report)));
                    tie += 1;
                }
                events.push((now + rx.feedback_period_us(), tie, Event::FeedbackTimer));
                tie += 1;
            }
            Event::FeedbackArrival(data) => {
                // Decode failures would be a codec bug; batch-level aborts
                // are surfaced through sender stats instead.
                let _ = tx
                    .on_feedback_datagram(now, &data)
                    .expect("well-formed feedback report");
            }
        }
    }
}

fn flow(controller: ControllerKind) -> (MediaSender, MediaReceiver) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let config = SenderConfig {
        controller,
        ..SenderConfig::default()
    };
    (
        MediaSender::new(config),
        MediaReceiver::new(ReceiverConfig::default()),
    )
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[test]
fn unconstrained_path_ramps_to_max() {
    let (mut tx, mut rx) = flow(ControllerKind::Nada);
    let mut path = PathModel::new(None, 30_000, None);
    run(&mut tx, &mut rx, &mut path, 0, 30_000_000);

    let bw = tx.bandwidth_bps(30_000_000);
    let max = RateConstraints::default().max_bps;
    assert!(
        bw >= 0.9 * max,
        "clean path must ramp to the cap, got {bw}"
    );
    assert_eq!(tx.stats().batch_failures, 0);
    assert!(rx.stats().packets_received > 1000);
}

#[test]
fn bottleneck_caps_rate() {
    let (mut tx, mut rx) = flow(ControllerKind::Nada);
    // 300 kbps bottleneck: the estimate must not run away toward the cap
    let mut path = PathModel::new(Some(300_000.0), 30_000, None);
    run(&mut tx, &mut rx, &mut path, 0, 30_000_000);

    let bw = tx.bandwidth_bps(30_000_000);
    let constraints = RateConstraints::default();
    assert!(
        bw <= 600_000.0,
        "estimate must track the 300 kbps bottleneck, got {bw}"
    );
    assert!(bw >= constraints.min_bps);
    assert_eq!(tx.stats().batch_failures, 0);
    assert!(rx.stats().packets_received > 500);
}

#[test]
fn heavy_loss_drives_rate_to_floor() {
    let (mut tx, mut rx) = flow(ControllerKind::Nada);
    // Every 4th packet lost: a 25% loss ratio dwarfs the reference ratio
    let mut path = PathModel::new(None, 30_000, Some(4));
    run(&mut tx, &mut rx, &mut path, 0, 20_000_000);

    let bw = tx.bandwidth_bps(20_000_000);
    assert!(
        bw <= 200_000.0,
        "sustained heavy loss must pin the rate near the floor, got {bw}"
    );
    assert_eq!(tx.stats().batch_failures, 0);
}

#[test]
fn feedback_accounting_is_consistent() {
    let (mut tx, mut rx) = flow(ControllerKind::Nada);
    let mut path = PathModel::new(None, 20_000, None);
    run(&mut tx, &mut rx, &mut path, 0, 10_000_000);

    let sent = tx.stats().packets_sent;
    let fed_back = tx.stats().feedback_entries;
    assert!(sent > 0);
    // Everything but the tail still in flight at cutoff must be fed back
    assert!(fed_back <= sent);
    assert!(
        sent - fed_back < 20,
        "sent {sent} but only {fed_back} fed back"
    );
    // Every receiver report reaches the sender, up to the in-flight tail
    let reports_emitted = rx.stats().reports_sent + rx.stats().early_flushes;
    let reports_seen = tx.stats().feedback_reports;
    assert!(reports_seen <= reports_emitted);
    assert!(reports_emitted - reports_seen <= 2);
    assert_eq!(rx.stats().duplicates, 0);
}

#[test]
fn cbr_flow_holds_configured_rate() {
    let (mut tx, mut rx) = flow(ControllerKind::ConstantRate);
    let mut path = PathModel::new(None, 30_000, None);
    run(&mut tx, &mut rx, &mut path, 0, 10_000_000);

    assert_eq!(tx.bandwidth_bps(10_000_000), 150_000.0);
    assert_eq!(tx.stats().batch_failures, 0);
    assert!(rx.stats().packets_received > 100);
}

#[test]
fn pause_resume_restarts_cleanly() {
    let (mut tx, mut rx) = flow(ControllerKind::Nada);
    let mut path = PathModel::new(None, 30_000, None);
    run(&mut tx, &mut rx, &mut path, 0, 5_000_000);
    let sent_before = tx.stats().packets_sent;
    assert!(tx.bandwidth_bps(5_000_000) > 150_000.0, "ramped before pause");

    tx.pause();
    tx.resume();
    assert_eq!(tx.bandwidth_bps(5_000_000), 150_000.0);

    // The resumed flow keeps working from its clean sequence base. Feedback
    // for pre-pause packets may still be rejected as stale; that is logged,
    // not fatal to the transport.
    run(&mut tx, &mut rx, &mut path, 6_000_000, 12_000_000);
    assert!(tx.stats().packets_sent > sent_before);
    let bw = tx.bandwidth_bps(12_000_000);
    let constraints = RateConstraints::default();
    assert!(bw >= constraints.min_bps && bw <= constraints.max_bps);
}
