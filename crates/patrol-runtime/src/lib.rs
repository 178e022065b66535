//! `patrol-runtime` – the running appliance.
//!
//! Wires the sans-IO [`Arbiter`][patrol_kernel::Arbiter] to real sensors,
//! the capture controller, the face matcher and the event log.
//!
//! # Modules
//!
//! - [`pipeline`] – [`Pipeline`]: the bounded queue, the single arbiter
//!   task, and the capture / match worker pools.
//! - [`sensor_worker`] – one polling thread per sensor.
//! - [`retry`] – [`Backoff`]: bounded exponential retry for sensor reads.
//! - [`telemetry`] – `tracing` subscriber and optional OTLP export.

pub mod pipeline;
pub mod retry;
pub mod sensor_worker;
pub mod telemetry;

pub use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineMessage, PipelineReport};
pub use retry::Backoff;
pub use sensor_worker::{SensorWorkerConfig, spawn_sensor_worker};
