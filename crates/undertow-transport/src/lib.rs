//! # undertow-transport
//!
//! Congestion-controlled transport for interactive media: a sender paces a
//! synthetic media stream against a bandwidth estimate derived from compact
//! per-packet feedback reports sent by the receiver. Delay, loss and
//! receive-rate signals combine into a NADA-style controller with
//! hysteresis against estimation noise.
//!
//! The crate is pure protocol logic: sockets, timers and traffic sources
//! belong to the embedder, which drives the state machines with explicit
//! microsecond timestamps — a discrete-event simulation works exactly like
//! a live deployment.
//!
//! ## Crate structure
//!
//! - [`wire`] — media/report header codecs, wraparound sequence ordering
//! - [`feedback`] — congestion control feedback report builder and codec
//! - [`history`] — sender-side packet ledger and network-state estimator
//! - [`controller`] — controller capability trait, algorithm selection
//! - [`nada`] — NADA delay+loss rate controller
//! - [`cbr`] — constant-rate baseline controller
//! - [`shaping`] — rate shaping buffer (encoder target vs. pacing rate)
//! - [`sender`] — sender flow state machine
//! - [`receiver`] — receiver flow state machine
//! - [`stats`] — per-flow statistics, controller snapshots, EWMA
//! - [`clock`] — monotonic microsecond clock for live deployments

pub mod cbr;
pub mod clock;
pub mod controller;
pub mod feedback;
pub mod history;
pub mod nada;
pub mod receiver;
pub mod sender;
pub mod shaping;
pub mod stats;
pub mod wire;
