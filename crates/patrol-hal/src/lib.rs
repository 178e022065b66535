//! `patrol-hal` – Hardware Abstraction Layer
//!
//! Capability traits for everything Pi-Patrol touches physically, plus the
//! filesystem capture controller and simulated drivers.
//!
//! # Modules
//!
//! - [`sensor`] – [`SensorSource`][sensor::SensorSource]: polled PIR / gas
//!   sensors, and a digital-output gas adapter.
//! - [`camera`] – [`Camera`][camera::Camera] and [`CameraFrame`][camera::CameraFrame],
//!   an `image` buffer with JPEG/PNG encode and decode.
//! - [`capture`] – [`CaptureController`][capture::CaptureController]:
//!   snapshots and clips written to storage.
//! - [`preview`] – [`LivePreview`][preview::LivePreview]: the atomically
//!   replaced "latest frame" slot.
//! - [`registry`] – [`HardwareRegistry`][registry::HardwareRegistry].
//! - [`sim`] – simulated drivers and the [`SimRegistry`][sim::SimRegistry]
//!   builder.

pub mod camera;
pub mod capture;
pub mod preview;
pub mod registry;
pub mod sensor;
pub mod sim;

pub use camera::{Camera, CameraFrame, FrameError, PixelFormat};
pub use capture::{Capture, CaptureController, CaptureError, FsCaptureController};
pub use preview::LivePreview;
pub use registry::HardwareRegistry;
pub use sensor::{DigitalGasSensor, SensorSource};
