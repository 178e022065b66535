//! One OS thread per sensor, feeding the arbiter's queue.
//!
//! Each worker polls its [`SensorSource`] every `poll_interval`, retrying
//! failed reads with [`Backoff`].  Samples are pushed with `blocking_send`
//! into the bounded pipeline queue, so a stalled arbiter applies
//! backpressure to the sensors instead of growing memory.
//!
//! When a read exhausts its retries the worker reports one
//! [`ArbiterInput::SensorFault`] and keeps polling; further failures are
//! not reported again until the sensor has produced a good reading.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use patrol_hal::SensorSource;
use patrol_kernel::ArbiterInput;
use patrol_types::SensorSample;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::pipeline::PipelineMessage;
use crate::retry::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorWorkerConfig {
    pub poll_interval: Duration,
    pub retry: Backoff,
}

impl Default for SensorWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            retry: Backoff::new(3, Duration::from_millis(50)),
        }
    }
}

/// Start the polling thread for `sensor`.
///
/// The thread exits when `shutdown` is set or the queue is closed.
pub fn spawn_sensor_worker(
    mut sensor: Box<dyn SensorSource>,
    config: SensorWorkerConfig,
    tx: mpsc::Sender<PipelineMessage>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    let id = sensor.id().to_string();
    thread::Builder::new()
        .name(format!("sensor-{id}"))
        .spawn(move || {
            info!(sensor = %id, kind = %sensor.kind(), "sensor worker started");
            let mut faulted = false;
            while !shutdown.load(Ordering::Relaxed) {
                let message = match config.retry.run(&id, || sensor.read()) {
                    Ok(value) => {
                        if std::mem::take(&mut faulted) {
                            info!(sensor = %id, "sensor reads recovered");
                        }
                        Some(ArbiterInput::Sample(SensorSample::new(&id, value, Utc::now())))
                    }
                    Err(e) if !faulted => {
                        faulted = true;
                        warn!(sensor = %id, error = %e, "sensor read retries exhausted");
                        Some(ArbiterInput::SensorFault {
                            sensor: id.clone(),
                            details: format!(
                                "{e} (after {} attempts)",
                                config.retry.attempts()
                            ),
                            at: Utc::now(),
                        })
                    }
                    Err(_) => None,
                };
                if let Some(input) = message
                    && tx.blocking_send(PipelineMessage::Input(input)).is_err()
                {
                    debug!(sensor = %id, "pipeline queue closed");
                    break;
                }
                thread::sleep(config.poll_interval);
            }
            info!(sensor = %id, "sensor worker stopped");
        })
}
