//! [`Pipeline`] – the async shell around the [`Arbiter`].
//!
//! ```text
//!  sensor threads ──blocking_send──▶ ┌──────────────┐
//!  capture tasks ──────────────────▶ │ bounded mpsc │──▶ arbiter task ──▶ EventLog
//!  match tasks ────────────────────▶ └──────────────┘        │
//!        ▲                                                   │
//!        └──────────── Capture / Match directives ───────────┘
//! ```
//!
//! The arbiter task is the queue's only consumer, so incident transitions
//! are linearizable.  Capture and match calls run on the blocking pool,
//! each gated by its own semaphore of `worker_pool_size` permits; their
//! results re-enter through the same queue.  Event log appends are awaited
//! one at a time before the next message is taken.
//!
//! When no motion has been seen for `idle_timeout` and no motion incident is
//! open, the camera is put to sleep; the next motion sample wakes it.
//!
//! On shutdown the queue is closed and whatever is already buffered is still
//! applied to the arbiter before open incidents are closed.  No new capture
//! or match work is started while draining.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use patrol_hal::{CameraFrame, Capture, CaptureController, CaptureError, SensorSource};
use patrol_kernel::{
    Arbiter, ArbiterConfig, ArbiterInput, CaptureOutcome, CaptureRequest, Directive, MatchOutcome,
    Watchdog,
};
use patrol_memory::EventLog;
use patrol_perception::{FaceMatcher, MatchError};
use patrol_types::{ArtifactRef, EventRecord, IncidentKind, PatrolError, SensorValue};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::sensor_worker::{SensorWorkerConfig, spawn_sensor_worker};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration & errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    Config(#[from] PatrolError),
    #[error("failed to start worker for sensor {sensor}: {source}")]
    SensorThread {
        sensor: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub arbiter: ArbiterConfig,
    /// Permits per blocking pool (capture and match each get their own).
    pub worker_pool_size: usize,
    pub matcher_timeout: Duration,
    /// Period of the clock tick that drives time-based transitions.
    pub tick_interval: Duration,
    pub queue_capacity: usize,
    pub sensor: SensorWorkerConfig,
    /// Silence after which a sensor is reported as a system fault.
    pub sensor_stale_after: Duration,
    /// Quiet period after which the camera is put to sleep.
    pub idle_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            arbiter: ArbiterConfig::default(),
            worker_pool_size: 2,
            matcher_timeout: Duration::from_secs(2),
            tick_interval: Duration::from_millis(100),
            queue_capacity: 256,
            sensor: SensorWorkerConfig::default(),
            sensor_stale_after: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PatrolError> {
        self.arbiter.validate()?;
        if self.worker_pool_size == 0 {
            return Err(PatrolError::Config("worker_pool_size must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(PatrolError::Config("queue capacity must be at least 1".to_string()));
        }
        if self.tick_interval.is_zero() || self.matcher_timeout.is_zero() {
            return Err(PatrolError::Config(
                "tick interval and matcher timeout must be non-zero".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(PatrolError::Config("idle_timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue messages
// ─────────────────────────────────────────────────────────────────────────────

/// Everything that reaches the arbiter task.
#[derive(Debug)]
pub enum PipelineMessage {
    Input(ArbiterInput),
    /// A finished capture.  Carries the frame itself, which the arbiter
    /// never sees, so a follow-up match can use it.
    Captured {
        request: CaptureRequest,
        result: Result<Capture, CaptureError>,
        at: DateTime<Utc>,
    },
}

/// Totals returned when the pipeline stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub persisted: u64,
    pub lost: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

pub struct Pipeline {
    rx: mpsc::Receiver<PipelineMessage>,
    core: Core,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        capture: Arc<dyn CaptureController>,
        matcher: Arc<dyn FaceMatcher>,
        log: Box<dyn EventLog>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let pool = config.worker_pool_size;
        Ok(Self {
            rx,
            core: Core {
                arbiter: Arbiter::new(config.arbiter.clone()),
                config,
                watchdog: Watchdog::new(),
                capture,
                matcher,
                log: Arc::new(Mutex::new(log)),
                tx,
                capture_slots: Arc::new(Semaphore::new(pool)),
                match_slots: Arc::new(Semaphore::new(pool)),
                frames: HashMap::new(),
                match_tasks: HashMap::new(),
                last_motion: Utc::now(),
                camera_idle: false,
                draining: false,
                report: PipelineReport::default(),
            },
        })
    }

    /// A handle for injecting messages from outside the pipeline.
    pub fn sender(&self) -> mpsc::Sender<PipelineMessage> {
        self.core.tx.clone()
    }

    /// Put `sensor_id` under the staleness watchdog.
    pub fn watch_sensor(&mut self, sensor_id: &str) {
        self.core
            .watchdog
            .register(sensor_id, self.core.config.sensor_stale_after, Utc::now());
    }

    /// Start one polling thread per sensor.  The threads stop when
    /// `shutdown` is set or the pipeline has stopped.
    pub fn spawn_sensors(
        &mut self,
        sensors: Vec<Box<dyn SensorSource>>,
        shutdown: &Arc<AtomicBool>,
    ) -> Result<Vec<JoinHandle<()>>, PipelineError> {
        let mut handles = Vec::with_capacity(sensors.len());
        for sensor in sensors {
            let id = sensor.id().to_string();
            self.watch_sensor(&id);
            let handle = spawn_sensor_worker(
                sensor,
                self.core.config.sensor,
                self.core.tx.clone(),
                Arc::clone(shutdown),
            )
            .map_err(|source| PipelineError::SensorThread { sensor: id, source })?;
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Run until `shutdown` is set, apply what is still queued, then close
    /// every open incident.
    pub async fn run(self, shutdown: Arc<AtomicBool>) -> PipelineReport {
        let Pipeline { mut rx, mut core } = self;
        let mut ticker = tokio::time::interval(core.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            workers = core.config.worker_pool_size,
            tick_ms = core.config.tick_interval.as_millis() as u64,
            "pipeline running"
        );

        while !shutdown.load(Ordering::Relaxed) {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => core.dispatch(message).await,
                    None => break,
                },
                _ = ticker.tick() => core.tick(Utc::now()).await,
            }
        }

        rx.close();
        core.draining = true;
        let mut drained = 0usize;
        while let Ok(message) = rx.try_recv() {
            core.dispatch(message).await;
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "queued messages applied before shutdown");
        }
        core.shutdown().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Arbiter task state
// ─────────────────────────────────────────────────────────────────────────────

struct Core {
    config: PipelineConfig,
    arbiter: Arbiter,
    watchdog: Watchdog,
    capture: Arc<dyn CaptureController>,
    matcher: Arc<dyn FaceMatcher>,
    log: Arc<Mutex<Box<dyn EventLog>>>,
    tx: mpsc::Sender<PipelineMessage>,
    capture_slots: Arc<Semaphore>,
    match_slots: Arc<Semaphore>,
    /// Snapshot frames awaiting a match directive, keyed by artifact.
    frames: HashMap<ArtifactRef, Arc<CameraFrame>>,
    match_tasks: HashMap<Uuid, Vec<AbortHandle>>,
    last_motion: DateTime<Utc>,
    camera_idle: bool,
    /// Set once the queue is closed; capture and match directives are
    /// dropped from then on.
    draining: bool,
    report: PipelineReport,
}

impl Core {
    async fn dispatch(&mut self, message: PipelineMessage) {
        match message {
            PipelineMessage::Input(input) => {
                match &input {
                    ArbiterInput::Sample(sample) => {
                        self.watchdog.heartbeat(&sample.source, sample.timestamp);
                        if sample.value == SensorValue::Motion(true) {
                            self.note_motion(sample.timestamp);
                        }
                    }
                    ArbiterInput::SensorFault { sensor, .. } => self.watchdog.acknowledge(sensor),
                    _ => {}
                }
                let directives = self.arbiter.handle(input);
                self.execute(directives).await;
            }
            PipelineMessage::Captured {
                request,
                result,
                at,
            } => {
                let (outcome, artifact) = match result {
                    Ok(Capture {
                        artifact, frame, ..
                    }) => {
                        if let Some(frame) = frame {
                            self.frames.insert(artifact.clone(), frame);
                        }
                        (
                            CaptureOutcome::Stored {
                                artifact: artifact.clone(),
                            },
                            Some(artifact),
                        )
                    }
                    Err(e) => (
                        CaptureOutcome::Failed {
                            reason: e.to_string(),
                        },
                        None,
                    ),
                };
                let directives = self.arbiter.handle(ArbiterInput::Captured {
                    request,
                    outcome,
                    at,
                });
                self.execute(directives).await;
                if let Some(artifact) = artifact {
                    self.frames.remove(&artifact);
                }
            }
        }
    }

    async fn tick(&mut self, now: DateTime<Utc>) {
        for sensor in self.watchdog.check_all(now) {
            let details = format!(
                "no samples for {:.1}s",
                self.config.sensor_stale_after.as_secs_f32()
            );
            let directives = self.arbiter.handle(ArbiterInput::SensorFault {
                sensor,
                details,
                at: now,
            });
            self.execute(directives).await;
        }
        let directives = self.arbiter.handle(ArbiterInput::Tick(now));
        self.execute(directives).await;

        let quiet = (now - self.last_motion)
            .to_std()
            .is_ok_and(|quiet| quiet >= self.config.idle_timeout);
        if quiet && !self.camera_idle && self.arbiter.motion_incident().is_none() {
            self.set_camera_idle(true);
        }
    }

    fn note_motion(&mut self, at: DateTime<Utc>) {
        self.last_motion = self.last_motion.max(at);
        if self.camera_idle {
            self.set_camera_idle(false);
        }
    }

    /// The controller call may wait behind a running clip, so it goes to the
    /// blocking pool.
    fn set_camera_idle(&mut self, idle: bool) {
        self.camera_idle = idle;
        let controller = Arc::clone(&self.capture);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = controller.set_idle(idle) {
                warn!(idle, error = %e, "camera power change failed");
            }
        });
    }

    async fn execute(&mut self, directives: Vec<Directive>) {
        for directive in directives {
            match directive {
                Directive::Capture(_) | Directive::Match { .. } if self.draining => {
                    debug!(?directive, "shutting down; directive dropped");
                }
                Directive::Capture(request) => self.spawn_capture(request),
                Directive::Match {
                    incident,
                    frame_ref,
                } => self.spawn_match(incident, frame_ref),
                Directive::Cancel { incident } => self.cancel(incident),
                Directive::Persist(record) => self.persist(record).await,
            }
        }
    }

    fn spawn_capture(&self, request: CaptureRequest) {
        let slots = Arc::clone(&self.capture_slots);
        let controller = Arc::clone(&self.capture);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let Ok(permit) = slots.acquire_owned().await else {
                return;
            };
            let hint = request.kind.duration_hint();
            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                controller.capture(hint)
            })
            .await
            .unwrap_or_else(|e| {
                Err(CaptureError::CameraUnavailable(format!(
                    "capture worker failed: {e}"
                )))
            });
            let message = PipelineMessage::Captured {
                request,
                result,
                at: Utc::now(),
            };
            if tx.send(message).await.is_err() {
                debug!(incident = %request.incident, "pipeline stopped; capture result dropped");
            }
        });
    }

    fn spawn_match(&mut self, incident: Uuid, frame_ref: ArtifactRef) {
        let frame = self.frames.remove(&frame_ref);
        let slots = Arc::clone(&self.match_slots);
        let matcher = Arc::clone(&self.matcher);
        let tx = self.tx.clone();
        let timeout = self.config.matcher_timeout;

        let task = tokio::spawn(async move {
            let outcome = match frame {
                None => MatchOutcome::Failed("snapshot frame no longer held".to_string()),
                Some(frame) => {
                    let Ok(permit) = slots.acquire_owned().await else {
                        return;
                    };
                    // The permit stays with the blocking call, so a timed-out
                    // match still occupies its worker until it returns.
                    let job = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        matcher.match_frame(&frame)
                    });
                    match tokio::time::timeout(timeout, job).await {
                        Ok(Ok(Ok(matches))) => MatchOutcome::Candidates(matches.collect()),
                        Ok(Ok(Err(MatchError::NoEnrollmentData))) => MatchOutcome::NoEnrollment,
                        Ok(Ok(Err(e))) => MatchOutcome::Failed(e.to_string()),
                        Ok(Err(e)) => MatchOutcome::Failed(format!("match worker failed: {e}")),
                        Err(_) => {
                            let error = PatrolError::MatcherTimeout(timeout);
                            warn!(incident = %incident, %error, "face match abandoned");
                            MatchOutcome::TimedOut
                        }
                    }
                }
            };
            let input = ArbiterInput::Matched {
                incident,
                frame_ref,
                outcome,
                at: Utc::now(),
            };
            if tx.send(PipelineMessage::Input(input)).await.is_err() {
                debug!(incident = %incident, "pipeline stopped; match result dropped");
            }
        });
        self.match_tasks
            .entry(incident)
            .or_default()
            .push(task.abort_handle());
    }

    fn cancel(&mut self, incident: Uuid) {
        let Some(tasks) = self.match_tasks.remove(&incident) else {
            return;
        };
        let pending = tasks.iter().filter(|t| !t.is_finished()).count();
        tasks.iter().for_each(AbortHandle::abort);
        if pending > 0 {
            debug!(incident = %incident, pending, "outstanding face matches cancelled");
        }
    }

    /// Append with one retry.  A record that still cannot be written is
    /// counted as lost and replaced by a system-fault entry when possible.
    async fn persist(&mut self, record: EventRecord) {
        let mut last_error = String::new();
        for attempt in 1..=2 {
            match self.append(record.clone()).await {
                Ok(seq) => {
                    self.report.persisted += 1;
                    debug!(seq, incident = %record.incident_id, kind = %record.kind, "event persisted");
                    return;
                }
                Err(e) => {
                    warn!(attempt, incident = %record.incident_id, error = %e, "event log append failed");
                    last_error = e;
                }
            }
        }

        self.report.lost += 1;
        error!(
            incident = %record.incident_id,
            kind = %record.kind,
            error = %last_error,
            "event record lost"
        );
        if record.kind == IncidentKind::SystemFault {
            return;
        }
        let fault = EventRecord::system_fault(
            format!(
                "event record {} ({}) lost: {last_error}",
                record.incident_id, record.kind
            ),
            Utc::now(),
        );
        match self.append(fault).await {
            Ok(_) => self.report.persisted += 1,
            Err(e) => error!(error = %e, "system fault for lost record could not be logged"),
        }
    }

    async fn append(&self, record: EventRecord) -> Result<u64, String> {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || {
            let mut log = log
                .lock()
                .map_err(|_| "event log lock poisoned".to_string())?;
            log.append(&record).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| format!("append worker failed: {e}"))?
    }

    async fn shutdown(mut self) -> PipelineReport {
        self.draining = true;
        let directives = self.arbiter.shutdown(Utc::now());
        self.execute(directives).await;
        for tasks in self.match_tasks.values() {
            tasks.iter().for_each(AbortHandle::abort);
        }
        self.capture_slots.close();
        self.match_slots.close();
        info!(
            persisted = self.report.persisted,
            lost = self.report.lost,
            "pipeline stopped"
        );
        self.report
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
