//! `patrol-kernel` – Incident Arbitration
//!
//! The decision core of Pi-Patrol.  It owns no hardware and performs no I/O;
//! it turns a stream of observations into a deduplicated stream of incidents.
//!
//! # Modules
//!
//! - [`arbiter`] – [`Arbiter`][arbiter::Arbiter]: the per-kind incident state
//!   machines.  Consumes sensor samples, capture results and face matches,
//!   and emits [`Directive`][arbiter::Directive]s (capture, match, cancel,
//!   persist) for the runtime to execute.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: tracks sample arrival
//!   per sensor and reports sources that have gone silent.

pub mod arbiter;
pub mod watchdog;

pub use arbiter::{
    Arbiter, ArbiterConfig, ArbiterInput, CaptureKind, CaptureOutcome, CaptureRequest, Directive,
    Incident, MatchOutcome,
};
pub use watchdog::{SensorHealth, Watchdog};
