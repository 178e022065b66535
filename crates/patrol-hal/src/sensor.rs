//! Generic `SensorSource` trait for polled sensors (PIR, gas, …).

use patrol_types::{PatrolError, SensorKind, SensorValue};

/// A polled sensor.
///
/// Reads are potentially blocking (GPIO, ADC over I²C) and are always
/// issued from a dedicated worker thread, never from the arbiter.
pub trait SensorSource: Send {
    /// Stable identifier, e.g. `"pir_front"` or `"mq135"`.
    fn id(&self) -> &str;

    /// The quantity this sensor reports.  Every value returned by
    /// [`read`][Self::read] must be of this kind.
    fn kind(&self) -> SensorKind;

    /// Take one reading.
    ///
    /// # Errors
    ///
    /// Returns [`PatrolError::TransientSensorFault`] when the device could not
    /// be read; callers retry with backoff.
    fn read(&mut self) -> Result<SensorValue, PatrolError>;
}

/// Digital-output gas module (e.g. MQ-135 `DO` pin) exposed as a scalar
/// sensor: an asserted pin reads as full scale (`1.0`), a clear pin as `0.0`.
///
/// The inner source must report [`SensorKind::Motion`]-style booleans; the
/// pin level is inverted when `active_low` is set, matching modules whose
/// comparator pulls the line low on detection.
pub struct DigitalGasSensor<S> {
    pin: S,
    active_low: bool,
}

impl<S: SensorSource> DigitalGasSensor<S> {
    pub fn new(pin: S, active_low: bool) -> Self {
        Self { pin, active_low }
    }
}

impl<S: SensorSource> SensorSource for DigitalGasSensor<S> {
    fn id(&self) -> &str {
        self.pin.id()
    }

    fn kind(&self) -> SensorKind {
        SensorKind::Gas
    }

    fn read(&mut self) -> Result<SensorValue, PatrolError> {
        match self.pin.read()? {
            SensorValue::Motion(level) => {
                let detected = level != self.active_low;
                Ok(SensorValue::Gas(if detected { 1.0 } else { 0.0 }))
            }
            SensorValue::Gas(v) => Ok(SensorValue::Gas(v)),
        }
    }
}
