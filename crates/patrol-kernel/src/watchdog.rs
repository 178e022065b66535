//! [`Watchdog`] – sensor liveness monitor.
//!
//! Every sample a sensor delivers counts as a heartbeat.  A sensor whose
//! last heartbeat is older than its timeout is *stale*.  The watchdog is
//! driven by the same clock as the arbiter, so staleness is evaluated
//! against sample timestamps rather than wall-clock reads.
//!
//! [`Watchdog::check_all`] reports each stale episode once; the sensor must
//! deliver a sample again before it can be reported a second time.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::info;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health state reported for a single sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorHealth {
    /// The sensor delivered a sample within its deadline.
    Healthy,
    /// The sensor has been silent for longer than its deadline.
    Stale,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct SensorEntry {
    last_heartbeat: DateTime<Utc>,
    timeout: TimeDelta,
    reported: bool,
}

impl SensorEntry {
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_heartbeat) > self.timeout
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks sample arrival per sensor and detects silent sources.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use chrono::{TimeDelta, Utc};
/// use patrol_kernel::watchdog::{SensorHealth, Watchdog};
///
/// let t0 = Utc::now();
/// let mut wd = Watchdog::new();
/// wd.register("pir_front", Duration::from_secs(10), t0);
///
/// assert_eq!(wd.health("pir_front", t0 + TimeDelta::seconds(5)), SensorHealth::Healthy);
/// assert_eq!(wd.check_all(t0 + TimeDelta::seconds(11)), vec!["pir_front".to_string()]);
/// ```
#[derive(Default)]
pub struct Watchdog {
    sensors: HashMap<String, SensorEntry>,
}

impl Watchdog {
    /// Create an empty watchdog with no registered sensors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sensor_id` with a maximum silence of `timeout`, counting
    /// from `now`.  Re-registering resets the deadline.
    pub fn register(&mut self, sensor_id: &str, timeout: Duration, now: DateTime<Utc>) {
        self.sensors.insert(
            sensor_id.to_string(),
            SensorEntry {
                last_heartbeat: now,
                timeout: TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX),
                reported: false,
            },
        );
    }

    /// Record a heartbeat for `sensor_id` at `at`.
    ///
    /// Returns `true` when the sensor was previously reported stale and has
    /// now recovered.  No-ops (returning `false`) for unregistered sensors.
    pub fn heartbeat(&mut self, sensor_id: &str, at: DateTime<Utc>) -> bool {
        let Some(entry) = self.sensors.get_mut(sensor_id) else {
            return false;
        };
        entry.last_heartbeat = entry.last_heartbeat.max(at);
        if std::mem::take(&mut entry.reported) {
            info!(sensor = sensor_id, "sensor recovered");
            return true;
        }
        false
    }

    /// Treat the current silence of `sensor_id` as already reported, e.g.
    /// when its worker raised its own fault.
    pub fn acknowledge(&mut self, sensor_id: &str) {
        if let Some(entry) = self.sensors.get_mut(sensor_id) {
            entry.reported = true;
        }
    }

    /// [`SensorHealth`] of `sensor_id` at `now`.  Unknown sensors are
    /// [`SensorHealth::Stale`].
    pub fn health(&self, sensor_id: &str, now: DateTime<Utc>) -> SensorHealth {
        match self.sensors.get(sensor_id) {
            Some(entry) if !entry.is_stale(now) => SensorHealth::Healthy,
            _ => SensorHealth::Stale,
        }
    }

    /// IDs of sensors that went stale since the last call, sorted.
    pub fn check_all(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut stale: Vec<String> = self
            .sensors
            .iter_mut()
            .filter(|(_, entry)| !entry.reported && entry.is_stale(now))
            .map(|(id, entry)| {
                entry.reported = true;
                id.clone()
            })
            .collect();
        stale.sort();
        stale
    }
}
