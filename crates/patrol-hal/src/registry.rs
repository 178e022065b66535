//! [`HardwareRegistry`] – central driver registry.
//!
//! The registry collects every registered [`SensorSource`] and [`Camera`]
//! driver so the runtime can be wired without knowing which concrete
//! (physical or simulated) drivers are installed.  Sensors are handed out
//! once, to their dedicated polling workers; cameras are handed to the
//! capture controller by identifier.

use std::collections::HashMap;

use patrol_types::PatrolError;

use crate::camera::Camera;
use crate::sensor::SensorSource;

/// Central hardware driver registry.
#[derive(Default)]
pub struct HardwareRegistry {
    sensors: Vec<Box<dyn SensorSource>>,
    cameras: HashMap<String, Box<dyn Camera>>,
}

impl HardwareRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sensor driver.  Any previously registered driver with the
    /// same `id` is replaced.
    pub fn register_sensor(&mut self, sensor: Box<dyn SensorSource>) {
        self.sensors.retain(|s| s.id() != sensor.id());
        self.sensors.push(sensor);
    }

    /// Register a camera driver.  Any previously registered driver with the
    /// same `id` is replaced.
    pub fn register_camera(&mut self, camera: Box<dyn Camera>) {
        self.cameras.insert(camera.id().to_string(), camera);
    }

    /// Identifiers of the registered sensors, in registration order.
    pub fn sensor_ids(&self) -> Vec<String> {
        self.sensors.iter().map(|s| s.id().to_string()).collect()
    }

    /// Move every sensor out of the registry.
    pub fn take_sensors(&mut self) -> Vec<Box<dyn SensorSource>> {
        std::mem::take(&mut self.sensors)
    }

    /// Move the camera `id` out of the registry.
    ///
    /// # Errors
    ///
    /// Returns [`PatrolError::CaptureFailure`] when no such camera is
    /// registered.
    pub fn take_camera(&mut self, id: &str) -> Result<Box<dyn Camera>, PatrolError> {
        self.cameras
            .remove(id)
            .ok_or_else(|| PatrolError::CaptureFailure(format!("camera '{id}' is not registered")))
    }
}
