//! In-process simulation drivers for running the pipeline without a Pi.
//!
//! [`SimRegistry`] wraps a [`HardwareRegistry`] and pre-populates it with
//! deterministic stub drivers: a PIR that fires in periodic bursts, a gas
//! sensor that replays a level script (as an analog level or through a
//! digital comparator pin), and a camera that renders a drifting texture.  `patrol run --simulate` and the runtime tests use these.
//!
//! # Example
//!
//! ```rust
//! use patrol_hal::sim::SimRegistry;
//!
//! let mut registry = SimRegistry::new()
//!     .with_pir("pir_front")
//!     .with_gas("mq135")
//!     .with_camera("front_door")
//!     .build();
//!
//! assert_eq!(registry.take_sensors().len(), 2);
//! assert!(registry.take_camera("front_door").is_ok());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::{GrayImage, Luma};
use patrol_types::{PatrolError, SensorKind, SensorValue};

use crate::camera::{Camera, CameraFrame};
use crate::registry::HardwareRegistry;
use crate::sensor::{DigitalGasSensor, SensorSource};

// ────────────────────────────────────────────────────────────────────────────
// Simulated PIR
// ────────────────────────────────────────────────────────────────────────────

/// A PIR that reports motion for the first `active` reads of every `period`
/// reads.
pub struct SimMotionSensor {
    id: String,
    period: u64,
    active: u64,
    reads: u64,
}

impl SimMotionSensor {
    /// Default pattern: a 10-read burst every 200 reads (≈3 s of motion per
    /// minute at the default 300 ms poll interval).
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_pattern(id, 200, 10)
    }

    pub fn with_pattern(id: impl Into<String>, period: u64, active: u64) -> Self {
        Self {
            id: id.into(),
            period: period.max(1),
            active,
            reads: 0,
        }
    }
}

impl SensorSource for SimMotionSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Motion
    }

    fn read(&mut self) -> Result<SensorValue, PatrolError> {
        let phase = self.reads % self.period;
        self.reads += 1;
        Ok(SensorValue::Motion(phase < self.active))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated gas sensor
// ────────────────────────────────────────────────────────────────────────────

/// A gas sensor that replays `levels` in a loop.
pub struct SimGasSensor {
    id: String,
    levels: Vec<f32>,
    reads: usize,
}

impl SimGasSensor {
    /// Default script: clean air with an occasional slow spike.
    pub fn new(id: impl Into<String>) -> Self {
        let mut levels = vec![0.1_f32; 400];
        levels.extend((0..20).map(|i| 0.1 + i as f32 * 0.04));
        levels.extend(vec![0.85_f32; 40]);
        levels.extend((0..20).map(|i| 0.85 - i as f32 * 0.04));
        Self::with_levels(id, levels)
    }

    pub fn with_levels(id: impl Into<String>, levels: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            levels,
            reads: 0,
        }
    }

    fn next_level(&mut self) -> Result<f32, PatrolError> {
        if self.levels.is_empty() {
            return Err(PatrolError::TransientSensorFault {
                sensor: self.id.clone(),
                details: "no level script".to_string(),
            });
        }
        let level = self.levels[self.reads % self.levels.len()];
        self.reads += 1;
        Ok(level)
    }
}

impl SensorSource for SimGasSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Gas
    }

    fn read(&mut self) -> Result<SensorValue, PatrolError> {
        self.next_level().map(SensorValue::Gas)
    }
}

/// The `DO` pin of a simulated gas module: the level script run through an
/// active-low comparator set at `trip`.
pub struct SimGasPin {
    levels: SimGasSensor,
    trip: f32,
}

impl SimGasPin {
    pub fn new(id: impl Into<String>, trip: f32) -> Self {
        Self::with_levels(SimGasSensor::new(id), trip)
    }

    pub fn with_levels(levels: SimGasSensor, trip: f32) -> Self {
        Self { levels, trip }
    }
}

impl SensorSource for SimGasPin {
    fn id(&self) -> &str {
        &self.levels.id
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Motion
    }

    fn read(&mut self) -> Result<SensorValue, PatrolError> {
        let level = self.levels.next_level()?;
        Ok(SensorValue::Motion(level < self.trip))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Simulated camera
// ────────────────────────────────────────────────────────────────────────────

/// A camera that renders a 64×48 greyscale checker texture whose phase
/// drifts by one pixel per capture.  Captures fail while it is asleep.
pub struct SimCamera {
    id: String,
    frames: u32,
    asleep: Arc<AtomicBool>,
}

impl SimCamera {
    pub const WIDTH: u32 = 64;
    pub const HEIGHT: u32 = 48;

    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            frames: 0,
            asleep: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared view of the power state, `true` while asleep.
    pub fn sleep_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.asleep)
    }
}

impl Camera for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<CameraFrame, PatrolError> {
        if self.asleep.load(Ordering::SeqCst) {
            return Err(PatrolError::CaptureFailure(format!("camera {} is asleep", self.id)));
        }
        let shift = self.frames;
        self.frames = self.frames.wrapping_add(1);
        let image = GrayImage::from_fn(Self::WIDTH, Self::HEIGHT, |x, y| {
            let cell = ((x + shift) / 8 + y / 8) % 2;
            Luma([(cell as u8) * 160 + ((x * 3 + y * 5) % 64) as u8])
        });
        Ok(CameraFrame::gray(image)?)
    }

    fn sleep(&mut self) -> Result<(), PatrolError> {
        self.asleep.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn wake(&mut self) -> Result<(), PatrolError> {
        self.asleep.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimRegistry builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder that constructs a [`HardwareRegistry`] pre-populated with
/// simulated drivers.
#[derive(Default)]
pub struct SimRegistry {
    sensors: Vec<Box<dyn SensorSource>>,
    cameras: Vec<Box<dyn Camera>>,
}

impl SimRegistry {
    /// Create an empty [`SimRegistry`] builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a simulated PIR with the default burst pattern.
    pub fn with_pir(mut self, id: impl Into<String>) -> Self {
        self.sensors.push(Box::new(SimMotionSensor::new(id)));
        self
    }

    /// Register a simulated gas sensor with the default level script.
    pub fn with_gas(mut self, id: impl Into<String>) -> Self {
        self.sensors.push(Box::new(SimGasSensor::new(id)));
        self
    }

    /// Register a simulated gas module read through its active-low digital
    /// output, tripping at `trip`.
    pub fn with_digital_gas(mut self, id: impl Into<String>, trip: f32) -> Self {
        self.sensors
            .push(Box::new(DigitalGasSensor::new(SimGasPin::new(id, trip), true)));
        self
    }

    /// Register a simulated camera.
    pub fn with_camera(mut self, id: impl Into<String>) -> Self {
        self.cameras.push(Box::new(SimCamera::new(id)));
        self
    }

    /// Register a custom sensor driver, e.g. a scripted test double.
    pub fn with_sensor(mut self, sensor: Box<dyn SensorSource>) -> Self {
        self.sensors.push(sensor);
        self
    }

    /// Consume the builder and return a fully configured [`HardwareRegistry`].
    pub fn build(self) -> HardwareRegistry {
        let mut registry = HardwareRegistry::new();
        for s in self.sensors {
            registry.register_sensor(s);
        }
        for c in self.cameras {
            registry.register_camera(c);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_pir_bursts_then_rests() {
        let mut pir = SimMotionSensor::with_pattern("pir", 4, 2);
        let reads: Vec<SensorValue> = (0..8).map(|_| pir.read().unwrap()).collect();
        let expected = [true, true, false, false, true, true, false, false];
        for (got, want) in reads.iter().zip(expected) {
            assert_eq!(*got, SensorValue::Motion(want));
        }
    }

    #[test]
    fn sim_gas_replays_levels() {
        let mut gas = SimGasSensor::with_levels("mq135", vec![0.1, 0.9]);
        assert_eq!(gas.read().unwrap(), SensorValue::Gas(0.1));
        assert_eq!(gas.read().unwrap(), SensorValue::Gas(0.9));
        assert_eq!(gas.read().unwrap(), SensorValue::Gas(0.1));
    }

    #[test]
    fn sim_gas_without_script_faults() {
        let mut gas = SimGasSensor::with_levels("mq135", vec![]);
        assert!(matches!(
            gas.read(),
            Err(PatrolError::TransientSensorFault { .. })
        ));
    }

    #[test]
    fn sim_default_gas_script_crosses_alarm_band() {
        let mut gas = SimGasSensor::new("mq135");
        let peak = (0..480)
            .filter_map(|_| match gas.read().unwrap() {
                SensorValue::Gas(v) => Some(v),
                SensorValue::Motion(_) => None,
            })
            .fold(0.0_f32, f32::max);
        assert!(peak > 0.8);
    }

    #[test]
    fn sim_gas_pin_pulls_low_above_trip() {
        let mut pin = SimGasPin::with_levels(SimGasSensor::with_levels("mq2", vec![0.1, 0.9]), 0.5);
        assert_eq!(pin.id(), "mq2");
        assert_eq!(pin.read().unwrap(), SensorValue::Motion(true));
        assert_eq!(pin.read().unwrap(), SensorValue::Motion(false));
    }

    #[test]
    fn digital_gas_source_reports_full_scale_alarm() {
        let mut registry = SimRegistry::new().with_digital_gas("mq2", 0.5).build();
        let mut sensors = registry.take_sensors();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].kind(), SensorKind::Gas);
        let peak = (0..480)
            .filter_map(|_| match sensors[0].read().unwrap() {
                SensorValue::Gas(v) => Some(v),
                SensorValue::Motion(_) => None,
            })
            .fold(0.0_f32, f32::max);
        assert_eq!(peak, 1.0);
    }

    #[test]
    fn sim_camera_frames_drift() {
        let mut cam = SimCamera::new("front");
        let a = cam.capture().unwrap();
        let b = cam.capture().unwrap();
        assert_eq!(a.width(), SimCamera::WIDTH);
        assert_eq!(a.height(), SimCamera::HEIGHT);
        assert_ne!(a, b);
    }

    #[test]
    fn sleeping_sim_camera_refuses_capture() {
        let mut cam = SimCamera::new("front");
        let flag = cam.sleep_flag();
        cam.sleep().unwrap();
        assert!(flag.load(Ordering::SeqCst));
        assert!(matches!(cam.capture(), Err(PatrolError::CaptureFailure(_))));
        cam.wake().unwrap();
        assert!(cam.capture().is_ok());
    }

    #[test]
    fn sim_registry_full_stack_no_hardware_required() {
        let mut registry = SimRegistry::new()
            .with_pir("pir_front")
            .with_gas("mq135")
            .with_camera("front_door")
            .build();

        assert_eq!(registry.sensor_ids(), vec!["pir_front", "mq135"]);
        let mut cam = registry.take_camera("front_door").expect("camera registered");
        cam.capture().expect("sim capture must succeed");
        for mut sensor in registry.take_sensors() {
            sensor.read().expect("sim read must succeed");
        }
    }
}
