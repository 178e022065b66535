//! [`Arbiter`] – the incident state machine.
//!
//! The arbiter performs no I/O.  The runtime feeds it [`ArbiterInput`]s
//! (sensor samples, capture and match results, sensor faults, clock ticks)
//! and executes the [`Directive`]s it returns.  Time only advances through
//! the timestamps carried by those inputs, so every transition is
//! reproducible in tests.
//!
//! Two independent state machines are kept, one per kind family:
//!
//! ```text
//! motion:  Idle ──Motion=true──▶ Capturing ──cooldown elapsed──▶ Closing ──▶ Idle
//!                                 │  Motion → KnownVisitor   (match ≥ T)
//!                                 └  Motion → UnknownVisitor (capture window elapsed)
//!
//! gas:     Idle ──value ≥ H──▶ Alarm ──value < L held for debounce──▶ Idle
//! ```
//!
//! At most one incident per family is open at any time, and the two
//! families never merge.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use patrol_types::{
    ArtifactRef, EventRecord, FrameMatch, IdentityMatch, IncidentKind, PatrolError, SensorSample,
    SensorValue,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Timing and threshold parameters of the arbiter.
#[derive(Debug, Clone, PartialEq)]
pub struct ArbiterConfig {
    /// Quiet period without `Motion=true` before a motion incident closes.
    pub motion_cooldown: Duration,
    /// How long a motion incident waits for a qualifying face match before
    /// it is classified as an unknown visitor.
    pub capture_window: Duration,
    /// Snapshots requested per motion incident.
    pub frames_per_incident: u32,
    /// Spacing between snapshot requests.
    pub frame_interval: Duration,
    /// Also request one clip when a motion incident opens.
    pub record_clip: bool,
    pub clip_duration: Duration,
    /// `H`: gas level that opens an alarm.
    pub gas_alarm_threshold: f32,
    /// `L`: gas level the reading must stay under for the alarm to clear.
    pub gas_hysteresis_threshold: f32,
    pub gas_debounce: Duration,
    /// `T`: minimum confidence for a known-visitor classification.
    pub match_confidence_threshold: f32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            motion_cooldown: Duration::from_secs(10),
            capture_window: Duration::from_secs(5),
            frames_per_incident: 3,
            frame_interval: Duration::from_secs(1),
            record_clip: true,
            clip_duration: Duration::from_secs(5),
            gas_alarm_threshold: 0.6,
            gas_hysteresis_threshold: 0.4,
            gas_debounce: Duration::from_secs(30),
            match_confidence_threshold: 0.6,
        }
    }
}

impl ArbiterConfig {
    /// Reject parameter combinations the state machines cannot honour.
    ///
    /// # Errors
    ///
    /// [`PatrolError::Config`] describing the first offending parameter.
    pub fn validate(&self) -> Result<(), PatrolError> {
        if !(0.0..=1.0).contains(&self.match_confidence_threshold) {
            return Err(PatrolError::Config(format!(
                "match_confidence_threshold must lie in [0, 1], got {}",
                self.match_confidence_threshold
            )));
        }
        if !self.gas_alarm_threshold.is_finite() || !self.gas_hysteresis_threshold.is_finite() {
            return Err(PatrolError::Config("gas thresholds must be finite".to_string()));
        }
        if self.gas_hysteresis_threshold >= self.gas_alarm_threshold {
            return Err(PatrolError::Config(format!(
                "gas_hysteresis_threshold ({}) must be below gas_alarm_threshold ({})",
                self.gas_hysteresis_threshold, self.gas_alarm_threshold
            )));
        }
        if self.frames_per_incident == 0 {
            return Err(PatrolError::Config(
                "frames_per_incident must be at least 1".to_string(),
            ));
        }
        if self.record_clip && self.clip_duration.is_zero() {
            return Err(PatrolError::Config(
                "clip_duration must be non-zero when record_clip is set".to_string(),
            ));
        }
        Ok(())
    }
}

/// [`ArbiterConfig`] durations pre-converted to calendar deltas.
#[derive(Debug, Clone, Copy)]
struct Timings {
    cooldown: TimeDelta,
    window: TimeDelta,
    frame_interval: TimeDelta,
    gas_debounce: TimeDelta,
}

impl Timings {
    fn from_config(config: &ArbiterConfig) -> Self {
        Self {
            cooldown: delta(config.motion_cooldown),
            window: delta(config.capture_window),
            frame_interval: delta(config.frame_interval),
            gas_debounce: delta(config.gas_debounce),
        }
    }
}

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// `at + d`, saturating at the end of representable time.
fn after(at: DateTime<Utc>, d: TimeDelta) -> DateTime<Utc> {
    at.checked_add_signed(d).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ────────────────────────────────────────────────────────────────────────────
// Inputs and directives
// ────────────────────────────────────────────────────────────────────────────

/// What to grab from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Snapshot,
    Clip(Duration),
}

impl CaptureKind {
    /// The `duration_hint` to hand to the capture controller.
    pub fn duration_hint(&self) -> Option<Duration> {
        match self {
            CaptureKind::Snapshot => None,
            CaptureKind::Clip(d) => Some(*d),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub incident: Uuid,
    pub kind: CaptureKind,
}

/// Result of executing a [`CaptureRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Stored { artifact: ArtifactRef },
    Failed { reason: String },
}

/// Result of matching one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Candidates reported by the matcher, in any order.
    Candidates(Vec<IdentityMatch>),
    NoEnrollment,
    TimedOut,
    Failed(String),
}

/// Everything the arbiter reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ArbiterInput {
    Sample(SensorSample),
    Captured {
        request: CaptureRequest,
        outcome: CaptureOutcome,
        at: DateTime<Utc>,
    },
    Matched {
        incident: Uuid,
        frame_ref: ArtifactRef,
        outcome: MatchOutcome,
        at: DateTime<Utc>,
    },
    /// A sensor exhausted its read retries.
    SensorFault {
        sensor: String,
        details: String,
        at: DateTime<Utc>,
    },
    Tick(DateTime<Utc>),
}

impl ArbiterInput {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ArbiterInput::Sample(s) => s.timestamp,
            ArbiterInput::Captured { at, .. }
            | ArbiterInput::Matched { at, .. }
            | ArbiterInput::SensorFault { at, .. }
            | ArbiterInput::Tick(at) => *at,
        }
    }
}

/// Work the runtime must carry out on the arbiter's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Capture(CaptureRequest),
    /// Run the face matcher over the stored snapshot `frame_ref`.
    Match { incident: Uuid, frame_ref: ArtifactRef },
    /// Abandon outstanding work for a closed incident.
    Cancel { incident: Uuid },
    Persist(EventRecord),
}

// ────────────────────────────────────────────────────────────────────────────
// Incident
// ────────────────────────────────────────────────────────────────────────────

/// An open incident.  Only the arbiter mutates it; it leaves the arbiter as
/// an [`EventRecord`] exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    id: Uuid,
    kind: IncidentKind,
    opened_at: DateTime<Utc>,
    last_motion: DateTime<Utc>,
    identity: Option<String>,
    confidence: Option<f32>,
    artifact_refs: Vec<ArtifactRef>,
    matches: Vec<FrameMatch>,
    capture_failures: u32,
    snapshots_requested: u32,
    peak_gas_level: Option<f32>,
    quiet_since: Option<DateTime<Utc>>,
}

impl Incident {
    fn open(kind: IncidentKind, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            opened_at: at,
            last_motion: at,
            identity: None,
            confidence: None,
            artifact_refs: Vec::new(),
            matches: Vec::new(),
            capture_failures: 0,
            snapshots_requested: 0,
            peak_gas_level: None,
            quiet_since: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> IncidentKind {
        self.kind
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn confidence(&self) -> Option<f32> {
        self.confidence
    }

    pub fn artifact_refs(&self) -> &[ArtifactRef] {
        &self.artifact_refs
    }

    pub fn matches(&self) -> &[FrameMatch] {
        &self.matches
    }

    pub fn capture_failures(&self) -> u32 {
        self.capture_failures
    }

    pub fn peak_gas_level(&self) -> Option<f32> {
        self.peak_gas_level
    }

    /// When the motion cooldown expires given the motion seen so far.
    fn close_due(&self, t: &Timings) -> DateTime<Utc> {
        let window_end = after(self.opened_at, t.window);
        after(self.last_motion.max(window_end), t.cooldown)
    }

    fn into_record(self, closed_at: DateTime<Utc>) -> EventRecord {
        EventRecord {
            incident_id: self.id,
            kind: self.kind,
            identity: self.identity,
            confidence: self.confidence,
            opened_at: self.opened_at,
            closed_at,
            artifact_refs: self.artifact_refs,
            peak_gas_level: self.peak_gas_level,
            capture_failures: self.capture_failures,
            detail: None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Arbiter
// ────────────────────────────────────────────────────────────────────────────

/// Fuses sensor samples and face-match results into a deduplicated sequence
/// of incidents.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use patrol_kernel::arbiter::{Arbiter, ArbiterConfig, ArbiterInput, Directive};
/// use patrol_types::{SensorSample, SensorValue};
///
/// let mut arbiter = Arbiter::new(ArbiterConfig::default());
/// let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
/// let out = arbiter.handle(ArbiterInput::Sample(SensorSample::new(
///     "pir_front",
///     SensorValue::Motion(true),
///     t0,
/// )));
/// assert!(out.iter().any(|d| matches!(d, Directive::Capture(_))));
/// assert!(arbiter.motion_incident().is_some());
/// ```
#[derive(Debug)]
pub struct Arbiter {
    config: ArbiterConfig,
    timings: Timings,
    clock: Option<DateTime<Utc>>,
    motion: Option<Incident>,
    gas: Option<Incident>,
}

impl Arbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        let timings = Timings::from_config(&config);
        Self {
            config,
            timings,
            clock: None,
            motion: None,
            gas: None,
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// The open motion-family incident, if any.
    pub fn motion_incident(&self) -> Option<&Incident> {
        self.motion.as_ref()
    }

    /// The open gas incident, if any.
    pub fn gas_incident(&self) -> Option<&Incident> {
        self.gas.as_ref()
    }

    /// Apply one input and return the resulting directives, in the order
    /// they must be executed.
    pub fn handle(&mut self, input: ArbiterInput) -> Vec<Directive> {
        let now = self.advance(input.timestamp());
        let mut out = Vec::new();
        // Expire timers first so an input arriving after a deadline sees the
        // state the deadline produced.
        self.poll(now, &mut out);

        match input {
            ArbiterInput::Sample(sample) => self.on_sample(sample, now, &mut out),
            ArbiterInput::Captured {
                request, outcome, ..
            } => self.on_captured(request, outcome, &mut out),
            ArbiterInput::Matched {
                incident,
                frame_ref,
                outcome,
                ..
            } => self.on_matched(incident, frame_ref, outcome, now),
            ArbiterInput::SensorFault {
                sensor, details, ..
            } => {
                warn!(sensor = %sensor, details = %details, "sensor unavailable; recording system fault");
                out.push(Directive::Persist(EventRecord::system_fault(
                    format!("sensor {sensor} unavailable: {details}"),
                    now,
                )));
            }
            ArbiterInput::Tick(_) => {}
        }
        out
    }

    /// Close every open incident at `now`.  Used on process exit.
    pub fn shutdown(&mut self, now: DateTime<Utc>) -> Vec<Directive> {
        let now = self.advance(now);
        let mut out = Vec::new();
        self.poll(now, &mut out);
        if let Some(incident) = self.motion.take() {
            Self::close_motion(incident, now, &mut out);
        }
        if let Some(incident) = self.gas.take() {
            Self::close_gas(incident, now, &mut out);
        }
        out
    }

    /// Move the clock forward to `at`.  Timestamps older than the clock are
    /// clamped so time never runs backwards across sources.
    fn advance(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let now = match self.clock {
            Some(clock) if at < clock => {
                debug!(%at, %clock, "out-of-order timestamp clamped");
                clock
            }
            _ => at,
        };
        self.clock = Some(now);
        now
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    fn poll(&mut self, now: DateTime<Utc>, out: &mut Vec<Directive>) {
        let t = self.timings;

        if let Some(incident) = self.motion.as_mut()
            && incident.kind == IncidentKind::Motion
            && now >= after(incident.opened_at, t.window)
        {
            incident.kind = IncidentKind::UnknownVisitor;
            info!(incident = %incident.id, "no qualifying face match within capture window; unknown visitor");
        }

        if let Some(due) = self.motion.as_ref().map(|i| i.close_due(&t))
            && now >= due
            && let Some(incident) = self.motion.take()
        {
            Self::close_motion(incident, due, out);
        }

        if let Some(incident) = self.motion.as_mut() {
            Self::request_due_snapshots(incident, &t, self.config.frames_per_incident, now, out);
        }

        self.poll_gas(now, out);
    }

    fn poll_gas(&mut self, now: DateTime<Utc>, out: &mut Vec<Directive>) {
        let debounce = self.timings.gas_debounce;
        if let Some(due) = self
            .gas
            .as_ref()
            .and_then(|i| i.quiet_since)
            .map(|quiet| after(quiet, debounce))
            && now >= due
            && let Some(incident) = self.gas.take()
        {
            Self::close_gas(incident, due, out);
        }
    }

    fn request_due_snapshots(
        incident: &mut Incident,
        t: &Timings,
        frames: u32,
        now: DateTime<Utc>,
        out: &mut Vec<Directive>,
    ) {
        while incident.snapshots_requested < frames {
            let offset = i32::try_from(incident.snapshots_requested)
                .ok()
                .and_then(|k| t.frame_interval.checked_mul(k))
                .unwrap_or(TimeDelta::MAX);
            if after(incident.opened_at, offset) > now {
                break;
            }
            incident.snapshots_requested += 1;
            out.push(Directive::Capture(CaptureRequest {
                incident: incident.id,
                kind: CaptureKind::Snapshot,
            }));
        }
    }

    fn close_motion(incident: Incident, closed_at: DateTime<Utc>, out: &mut Vec<Directive>) {
        let id = incident.id;
        let record = incident.into_record(closed_at);
        info!(
            incident = %id,
            kind = %record.kind,
            identity = record.identity.as_deref().unwrap_or("-"),
            artifacts = record.artifact_refs.len(),
            capture_failures = record.capture_failures,
            "motion incident closed"
        );
        out.push(Directive::Cancel { incident: id });
        out.push(Directive::Persist(record));
    }

    fn close_gas(incident: Incident, closed_at: DateTime<Utc>, out: &mut Vec<Directive>) {
        let record = incident.into_record(closed_at);
        info!(
            incident = %record.incident_id,
            peak = record.peak_gas_level.unwrap_or_default(),
            "gas alarm cleared"
        );
        out.push(Directive::Persist(record));
    }

    // ── Inputs ───────────────────────────────────────────────────────────────

    fn on_sample(&mut self, sample: SensorSample, now: DateTime<Utc>, out: &mut Vec<Directive>) {
        match sample.value {
            SensorValue::Motion(true) => match self.motion.as_mut() {
                Some(incident) => {
                    incident.last_motion = now;
                    debug!(incident = %incident.id, source = %sample.source, "motion extends cooldown");
                }
                None => self.open_motion(&sample.source, now, out),
            },
            SensorValue::Motion(false) => {}
            SensorValue::Gas(level) => self.on_gas(&sample.source, level, now, out),
        }
    }

    fn open_motion(&mut self, source: &str, now: DateTime<Utc>, out: &mut Vec<Directive>) {
        let mut incident = Incident::open(IncidentKind::Motion, now);
        info!(incident = %incident.id, source, "motion incident opened");
        Self::request_due_snapshots(
            &mut incident,
            &self.timings,
            self.config.frames_per_incident,
            now,
            out,
        );
        if self.config.record_clip {
            out.push(Directive::Capture(CaptureRequest {
                incident: incident.id,
                kind: CaptureKind::Clip(self.config.clip_duration),
            }));
        }
        self.motion = Some(incident);
    }

    fn on_gas(&mut self, source: &str, level: f32, now: DateTime<Utc>, out: &mut Vec<Directive>) {
        let high = self.config.gas_alarm_threshold;
        let low = self.config.gas_hysteresis_threshold;
        if let Some(incident) = self.gas.as_mut() {
            incident.peak_gas_level = Some(incident.peak_gas_level.map_or(level, |p| p.max(level)));
            if level < low {
                incident.quiet_since.get_or_insert(now);
            } else if incident.quiet_since.take().is_some() {
                debug!(incident = %incident.id, level, "gas rose again; quiet period restarted");
            }
        } else if level >= high {
            let mut incident = Incident::open(IncidentKind::Gas, now);
            incident.peak_gas_level = Some(level);
            warn!(incident = %incident.id, source, level, threshold = high, "gas alarm raised");
            self.gas = Some(incident);
        }
        self.poll_gas(now, out);
    }

    fn on_captured(
        &mut self,
        request: CaptureRequest,
        outcome: CaptureOutcome,
        out: &mut Vec<Directive>,
    ) {
        let Some(incident) = self.motion.as_mut().filter(|i| i.id == request.incident) else {
            warn!(incident = %request.incident, ?outcome, "capture result for closed incident discarded");
            return;
        };
        match outcome {
            CaptureOutcome::Stored { artifact } => {
                debug!(incident = %incident.id, artifact = %artifact.display(), "artifact attached");
                incident.artifact_refs.push(artifact.clone());
                if request.kind == CaptureKind::Snapshot {
                    out.push(Directive::Match {
                        incident: incident.id,
                        frame_ref: artifact,
                    });
                }
            }
            CaptureOutcome::Failed { reason } => {
                incident.capture_failures += 1;
                warn!(
                    incident = %incident.id,
                    reason = %reason,
                    failures = incident.capture_failures,
                    "capture failed; incident continues without artifact"
                );
            }
        }
    }

    fn on_matched(
        &mut self,
        incident_id: Uuid,
        frame_ref: ArtifactRef,
        outcome: MatchOutcome,
        now: DateTime<Utc>,
    ) {
        let Some(incident) = self.motion.as_mut().filter(|i| i.id == incident_id) else {
            warn!(incident = %incident_id, frame = %frame_ref.display(), "face match for closed incident discarded");
            return;
        };

        let best = match outcome {
            MatchOutcome::Candidates(candidates) => IdentityMatch::strongest(&candidates).cloned(),
            MatchOutcome::NoEnrollment => {
                debug!(incident = %incident.id, "no enrollment data; treated as no match");
                None
            }
            MatchOutcome::TimedOut => {
                warn!(incident = %incident.id, frame = %frame_ref.display(), "face matcher timed out; treated as no match");
                None
            }
            MatchOutcome::Failed(reason) => {
                warn!(incident = %incident.id, reason = %reason, "face matcher failed; treated as no match");
                None
            }
        };

        incident.matches.push(FrameMatch {
            identity: best.as_ref().map(|m| m.identity.clone()),
            confidence: best.as_ref().map_or(0.0, |m| m.confidence),
            frame_ref,
            timestamp: now,
        });

        let Some(best) = best.filter(|m| m.confidence >= self.config.match_confidence_threshold)
        else {
            return;
        };
        let improves = match (&incident.identity, incident.confidence) {
            (Some(identity), Some(confidence)) => {
                best.rank(&IdentityMatch::new(identity.clone(), confidence)).is_lt()
            }
            _ => true,
        };
        if improves {
            let previous = incident.kind;
            incident.kind = IncidentKind::KnownVisitor;
            incident.identity = Some(best.identity.clone());
            incident.confidence = Some(best.confidence);
            info!(
                incident = %incident.id,
                identity = %best.identity,
                confidence = best.confidence,
                from = %previous,
                "known visitor identified"
            );
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 22, 0, 0).unwrap() + TimeDelta::milliseconds(ms)
    }

    fn motion(on: bool, ms: i64) -> ArbiterInput {
        ArbiterInput::Sample(SensorSample::new("pir_front", SensorValue::Motion(on), t(ms)))
    }

    fn gas(level: f32, ms: i64) -> ArbiterInput {
        ArbiterInput::Sample(SensorSample::new("mq2", SensorValue::Gas(level), t(ms)))
    }

    fn stored(request: CaptureRequest, path: &str, ms: i64) -> ArbiterInput {
        ArbiterInput::Captured {
            request,
            outcome: CaptureOutcome::Stored {
                artifact: PathBuf::from(path),
            },
            at: t(ms),
        }
    }

    fn matched(incident: Uuid, frame: &str, candidates: &[(&str, f32)], ms: i64) -> ArbiterInput {
        ArbiterInput::Matched {
            incident,
            frame_ref: PathBuf::from(frame),
            outcome: MatchOutcome::Candidates(
                candidates
                    .iter()
                    .map(|(id, c)| IdentityMatch::new(*id, *c))
                    .collect(),
            ),
            at: t(ms),
        }
    }

    fn no_clip() -> ArbiterConfig {
        ArbiterConfig {
            record_clip: false,
            ..ArbiterConfig::default()
        }
    }

    /// Feed ticks every `step` ms over `[from, to]`.
    fn tick(arbiter: &mut Arbiter, from: i64, to: i64, step: i64) -> Vec<Directive> {
        (from..=to)
            .step_by(step as usize)
            .flat_map(|ms| arbiter.handle(ArbiterInput::Tick(t(ms))))
            .collect()
    }

    fn persisted(directives: &[Directive]) -> Vec<&EventRecord> {
        directives
            .iter()
            .filter_map(|d| match d {
                Directive::Persist(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn captures(directives: &[Directive]) -> Vec<CaptureRequest> {
        directives
            .iter()
            .filter_map(|d| match d {
                Directive::Capture(r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ArbiterConfig::default().validate().is_ok());
    }

    #[test]
    fn config_rejects_inverted_gas_thresholds() {
        let config = ArbiterConfig {
            gas_alarm_threshold: 0.3,
            gas_hysteresis_threshold: 0.5,
            ..ArbiterConfig::default()
        };
        assert!(matches!(config.validate(), Err(PatrolError::Config(_))));
    }

    #[test]
    fn config_rejects_out_of_range_confidence_and_zero_frames() {
        let bad_t = ArbiterConfig {
            match_confidence_threshold: 1.5,
            ..ArbiterConfig::default()
        };
        assert!(bad_t.validate().is_err());
        let no_frames = ArbiterConfig {
            frames_per_incident: 0,
            ..ArbiterConfig::default()
        };
        assert!(no_frames.validate().is_err());
    }

    #[test]
    fn opening_requests_first_snapshot_and_clip_then_paces_the_rest() {
        let mut arbiter = Arbiter::new(ArbiterConfig::default());
        let opened = captures(&arbiter.handle(motion(true, 0)));
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[0].kind, CaptureKind::Snapshot);
        assert_eq!(opened[1].kind, CaptureKind::Clip(Duration::from_secs(5)));

        assert!(captures(&tick(&mut arbiter, 100, 900, 100)).is_empty());
        assert_eq!(captures(&arbiter.handle(ArbiterInput::Tick(t(1000)))).len(), 1);
        assert_eq!(captures(&arbiter.handle(ArbiterInput::Tick(t(2000)))).len(), 1);
        // frames_per_incident = 3: nothing more.
        assert!(captures(&tick(&mut arbiter, 2100, 9000, 100)).is_empty());
    }

    #[test]
    fn bouncing_motion_opens_exactly_one_incident() {
        let mut arbiter = Arbiter::new(no_clip());
        let mut out = Vec::new();
        // Sensor flaps every 700 ms for 30 s; every gap is shorter than the cooldown.
        for i in 0..43 {
            out.extend(arbiter.handle(motion(i % 2 == 0, i * 700)));
            out.extend(arbiter.handle(ArbiterInput::Tick(t(i * 700 + 350))));
        }
        let incidents: std::collections::HashSet<Uuid> =
            captures(&out).iter().map(|r| r.incident).collect();
        assert_eq!(incidents.len(), 1);
        assert!(persisted(&out).is_empty());

        // Last true sample at 29.4 s, so the incident closes at 39.4 s.
        let tail = tick(&mut arbiter, 30_000, 40_000, 100);
        let records = persisted(&tail);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].closed_at, t(39_400));
    }

    #[test]
    fn unmatched_motion_closes_at_fifteen_seconds_as_unknown_visitor() {
        let mut arbiter = Arbiter::new(ArbiterConfig::default());
        arbiter.handle(motion(true, 0));

        let before = tick(&mut arbiter, 100, 14_900, 100);
        assert!(persisted(&before).is_empty());
        assert_eq!(
            arbiter.motion_incident().map(Incident::kind),
            Some(IncidentKind::UnknownVisitor)
        );

        let out = arbiter.handle(ArbiterInput::Tick(t(15_000)));
        let records = persisted(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, IncidentKind::UnknownVisitor);
        assert_eq!(records[0].opened_at, t(0));
        assert_eq!(records[0].closed_at, t(15_000));
        assert_eq!(records[0].identity, None);
        assert!(matches!(out[0], Directive::Cancel { .. }));
        assert!(arbiter.motion_incident().is_none());
    }

    #[test]
    fn window_classification_happens_exactly_at_window_end() {
        let mut arbiter = Arbiter::new(no_clip());
        arbiter.handle(motion(true, 0));
        arbiter.handle(ArbiterInput::Tick(t(4_999)));
        assert_eq!(
            arbiter.motion_incident().map(Incident::kind),
            Some(IncidentKind::Motion)
        );
        arbiter.handle(ArbiterInput::Tick(t(5_000)));
        assert_eq!(
            arbiter.motion_incident().map(Incident::kind),
            Some(IncidentKind::UnknownVisitor)
        );
    }

    #[test]
    fn alice_at_one_second_is_known_immediately_and_closes_after_cooldown() {
        let mut arbiter = Arbiter::new(ArbiterConfig::default());
        let first = captures(&arbiter.handle(motion(true, 0)))[0];
        let id = first.incident;

        let out = arbiter.handle(stored(first, "/events/s0.jpg", 200));
        assert_eq!(
            out,
            vec![Directive::Match {
                incident: id,
                frame_ref: PathBuf::from("/events/s0.jpg"),
            }]
        );

        arbiter.handle(matched(id, "/events/s0.jpg", &[("alice", 0.9)], 1_000));
        let open = arbiter.motion_incident().unwrap();
        assert_eq!(open.kind(), IncidentKind::KnownVisitor);
        assert_eq!(open.identity(), Some("alice"));

        assert!(persisted(&tick(&mut arbiter, 1_100, 14_900, 100)).is_empty());
        let out = tick(&mut arbiter, 15_000, 15_000, 100);
        let records = persisted(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, IncidentKind::KnownVisitor);
        assert_eq!(records[0].identity.as_deref(), Some("alice"));
        assert_eq!(records[0].confidence, Some(0.9));
    }

    #[test]
    fn highest_confidence_wins_and_ties_go_to_smallest_identity() {
        let mut arbiter = Arbiter::new(no_clip());
        let id = captures(&arbiter.handle(motion(true, 0)))[0].incident;

        arbiter.handle(matched(id, "f0", &[("bob", 0.8), ("alice", 0.8), ("eve", 0.2)], 500));
        assert_eq!(arbiter.motion_incident().unwrap().identity(), Some("alice"));

        // Equal confidence from a later frame cannot displace a smaller name.
        arbiter.handle(matched(id, "f1", &[("carol", 0.8)], 1_500));
        assert_eq!(arbiter.motion_incident().unwrap().identity(), Some("alice"));

        arbiter.handle(matched(id, "f2", &[("dave", 0.95)], 2_500));
        assert_eq!(arbiter.motion_incident().unwrap().identity(), Some("dave"));

        // A weaker later frame does not downgrade.
        arbiter.handle(matched(id, "f3", &[("alice", 0.7)], 3_500));
        let incident = arbiter.motion_incident().unwrap();
        assert_eq!(incident.identity(), Some("dave"));
        assert_eq!(incident.matches().len(), 4);
        assert_eq!(incident.matches()[0].identity.as_deref(), Some("alice"));
    }

    #[test]
    fn sub_threshold_matches_end_as_unknown_visitor() {
        let mut arbiter = Arbiter::new(no_clip());
        let id = captures(&arbiter.handle(motion(true, 0)))[0].incident;
        arbiter.handle(matched(id, "f0", &[("alice", 0.59)], 800));
        let records_out = tick(&mut arbiter, 1_000, 15_000, 500);
        let records = persisted(&records_out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, IncidentKind::UnknownVisitor);
        assert_eq!(records[0].identity, None);
    }

    #[test]
    fn late_qualifying_match_upgrades_unknown_to_known() {
        let mut arbiter = Arbiter::new(no_clip());
        let id = captures(&arbiter.handle(motion(true, 0)))[0].incident;
        tick(&mut arbiter, 1_000, 6_000, 1_000);
        assert_eq!(
            arbiter.motion_incident().map(Incident::kind),
            Some(IncidentKind::UnknownVisitor)
        );
        arbiter.handle(matched(id, "f2", &[("bob", 0.7)], 7_000));
        assert_eq!(
            arbiter.motion_incident().map(Incident::kind),
            Some(IncidentKind::KnownVisitor)
        );
    }

    #[test]
    fn matcher_timeout_and_missing_enrollment_count_as_no_match() {
        let mut arbiter = Arbiter::new(no_clip());
        let id = captures(&arbiter.handle(motion(true, 0)))[0].incident;
        for (ms, outcome) in [
            (500, MatchOutcome::TimedOut),
            (1_500, MatchOutcome::NoEnrollment),
            (2_500, MatchOutcome::Failed("bad frame".to_string())),
        ] {
            arbiter.handle(ArbiterInput::Matched {
                incident: id,
                frame_ref: PathBuf::from("f"),
                outcome,
                at: t(ms),
            });
        }
        let out = tick(&mut arbiter, 3_000, 15_000, 1_000);
        let records = persisted(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, IncidentKind::UnknownVisitor);
    }

    #[test]
    fn failed_second_of_three_snapshots_leaves_two_artifacts() {
        let mut arbiter = Arbiter::new(no_clip());
        let mut requests = captures(&arbiter.handle(motion(true, 0)));
        requests.extend(captures(&arbiter.handle(ArbiterInput::Tick(t(1_000)))));
        requests.extend(captures(&arbiter.handle(ArbiterInput::Tick(t(2_000)))));
        assert_eq!(requests.len(), 3);

        arbiter.handle(stored(requests[0], "/events/s0.jpg", 100));
        arbiter.handle(ArbiterInput::Captured {
            request: requests[1],
            outcome: CaptureOutcome::Failed {
                reason: "camera unavailable".to_string(),
            },
            at: t(1_100),
        });
        arbiter.handle(stored(requests[2], "/events/s2.jpg", 2_100));

        let out = tick(&mut arbiter, 3_000, 15_000, 1_000);
        let records = persisted(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].artifact_refs,
            vec![PathBuf::from("/events/s0.jpg"), PathBuf::from("/events/s2.jpg")]
        );
        assert_eq!(records[0].capture_failures, 1);
        assert!(records[0].is_partial());
    }

    #[test]
    fn clip_artifact_is_attached_but_not_matched() {
        let mut arbiter = Arbiter::new(ArbiterConfig::default());
        let requests = captures(&arbiter.handle(motion(true, 0)));
        let clip = requests[1];
        let out = arbiter.handle(stored(clip, "/recordings/c0.gif", 800));
        assert!(out.is_empty());
        assert_eq!(
            arbiter.motion_incident().unwrap().artifact_refs(),
            &[PathBuf::from("/recordings/c0.gif")]
        );
    }

    #[test]
    fn results_for_closed_incidents_are_discarded() {
        let mut arbiter = Arbiter::new(no_clip());
        let old = captures(&arbiter.handle(motion(true, 0)))[0];
        tick(&mut arbiter, 1_000, 15_000, 1_000);
        assert!(arbiter.motion_incident().is_none());

        let fresh = captures(&arbiter.handle(motion(true, 20_000)))[0];
        assert_ne!(fresh.incident, old.incident);

        assert!(arbiter.handle(stored(old, "/events/late.jpg", 20_100)).is_empty());
        assert!(
            arbiter
                .handle(matched(old.incident, "/events/late.jpg", &[("alice", 0.99)], 20_200))
                .is_empty()
        );
        let current = arbiter.motion_incident().unwrap();
        assert!(current.artifact_refs().is_empty());
        assert_eq!(current.kind(), IncidentKind::Motion);
    }

    #[test]
    fn late_input_first_closes_the_expired_incident() {
        let mut arbiter = Arbiter::new(no_clip());
        arbiter.handle(motion(true, 0));
        // No ticks at all; the next sample arrives long after the cooldown.
        let out = arbiter.handle(motion(true, 60_000));
        let records = persisted(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].closed_at, t(15_000));
        let opened = arbiter.motion_incident().unwrap();
        assert_eq!(opened.opened_at(), t(60_000));
        assert_ne!(opened.id(), records[0].incident_id);
    }

    #[test]
    fn gas_hovering_between_thresholds_never_oscillates() {
        let mut arbiter = Arbiter::new(ArbiterConfig::default());
        let mut out = arbiter.handle(gas(0.65, 0));
        assert!(arbiter.gas_incident().is_some());

        // Hover in [L, H) and dip across H repeatedly for ten minutes.
        for i in 1..600 {
            let level = if i % 3 == 0 { 0.61 } else { 0.45 };
            out.extend(arbiter.handle(gas(level, i * 1_000)));
        }
        assert!(persisted(&out).is_empty());
        let open = arbiter.gas_incident().unwrap();
        assert_eq!(open.peak_gas_level(), Some(0.65));
    }

    #[test]
    fn gas_clears_only_after_debounce_below_low_threshold() {
        let mut arbiter = Arbiter::new(ArbiterConfig::default());
        arbiter.handle(gas(0.9, 0));
        arbiter.handle(gas(0.3, 1_000));
        // Bump back above L at 20 s restarts the quiet period.
        arbiter.handle(gas(0.42, 20_000));
        arbiter.handle(gas(0.2, 21_000));

        let quiet = tick(&mut arbiter, 22_000, 50_000, 1_000);
        assert!(persisted(&quiet).is_empty());

        let out = tick(&mut arbiter, 51_000, 51_000, 1_000);
        let records = persisted(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, IncidentKind::Gas);
        assert_eq!(records[0].peak_gas_level, Some(0.9));
        assert_eq!(records[0].closed_at, t(51_000));
        assert!(arbiter.gas_incident().is_none());
    }

    #[test]
    fn gas_below_alarm_level_never_opens() {
        let mut arbiter = Arbiter::new(ArbiterConfig::default());
        for i in 0..50 {
            arbiter.handle(gas(0.59, i * 100));
        }
        assert!(arbiter.gas_incident().is_none());
    }

    #[test]
    fn gas_and_motion_incidents_coexist_independently() {
        let mut arbiter = Arbiter::new(no_clip());
        arbiter.handle(motion(true, 0));
        arbiter.handle(gas(0.8, 2_000));
        assert!(arbiter.motion_incident().is_some());
        assert!(arbiter.gas_incident().is_some());

        let out = tick(&mut arbiter, 3_000, 15_000, 1_000);
        let records = persisted(&out);
        assert_eq!(records.len(), 1);
        assert!(records[0].kind.is_motion_family());
        assert!(arbiter.gas_incident().is_some());

        arbiter.handle(gas(0.1, 16_000));
        let out = tick(&mut arbiter, 17_000, 46_000, 1_000);
        let records = persisted(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, IncidentKind::Gas);
    }

    #[test]
    fn sensor_fault_is_persisted_as_system_fault() {
        let mut arbiter = Arbiter::new(ArbiterConfig::default());
        let out = arbiter.handle(ArbiterInput::SensorFault {
            sensor: "mq2".to_string(),
            details: "i2c read failed".to_string(),
            at: t(500),
        });
        let records = persisted(&out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, IncidentKind::SystemFault);
        assert!(records[0].detail.as_deref().unwrap().contains("mq2"));
        // Faults never disturb incident state.
        assert!(arbiter.motion_incident().is_none());
    }

    #[test]
    fn shutdown_closes_every_open_incident() {
        let mut arbiter = Arbiter::new(no_clip());
        arbiter.handle(motion(true, 0));
        arbiter.handle(gas(0.9, 500));
        let out = arbiter.shutdown(t(2_000));
        let records = persisted(&out);
        assert_eq!(records.len(), 2);
        // Closed before the capture window ended: verdict still pending.
        assert_eq!(records[0].kind, IncidentKind::Motion);
        assert_eq!(records[0].closed_at, t(2_000));
        assert_eq!(records[1].kind, IncidentKind::Gas);
        assert!(arbiter.motion_incident().is_none());
        assert!(arbiter.gas_incident().is_none());
        assert!(arbiter.shutdown(t(3_000)).is_empty());
    }

    #[test]
    fn out_of_order_timestamps_are_clamped() {
        let mut arbiter = Arbiter::new(no_clip());
        arbiter.handle(ArbiterInput::Tick(t(10_000)));
        arbiter.handle(motion(true, 4_000));
        // Opened at the clock, not at the stale sample time.
        assert_eq!(arbiter.motion_incident().unwrap().opened_at(), t(10_000));
    }
}
