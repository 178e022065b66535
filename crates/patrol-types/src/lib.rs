//! `patrol-types` – shared vocabulary of the Pi-Patrol pipeline.
//!
//! Every crate in the workspace speaks in these types: raw
//! [`SensorSample`]s flow in from the hardware layer, [`IdentityMatch`]es and
//! [`FrameMatch`]es come out of the face matcher, and closed incidents leave
//! the arbiter as immutable [`EventRecord`]s.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Storage path of a captured snapshot or clip.
pub type ArtifactRef = PathBuf;

// ─────────────────────────────────────────────────────────────────────────────
// Sensor samples
// ─────────────────────────────────────────────────────────────────────────────

/// The physical quantity a sensor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// PIR motion detector (boolean).
    Motion,
    /// Gas / air-quality sensor (scalar level).
    Gas,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Motion => write!(f, "motion"),
            SensorKind::Gas => write!(f, "gas"),
        }
    }
}

/// A single reading.  The variant fixes the [`SensorKind`], so a gas sensor
/// can never deliver a boolean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SensorValue {
    Motion(bool),
    /// Gas level as a fraction of sensor full-scale (`0.0..=1.0` for the
    /// bundled drivers; the arbiter only compares against thresholds).
    Gas(f32),
}

impl SensorValue {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorValue::Motion(_) => SensorKind::Motion,
            SensorValue::Gas(_) => SensorKind::Gas,
        }
    }
}

/// An immutable, timestamped sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Identifier of the producing sensor, e.g. `"pir_front"`.
    pub source: String,
    pub value: SensorValue,
    pub timestamp: DateTime<Utc>,
}

impl SensorSample {
    pub fn new(source: impl Into<String>, value: SensorValue, timestamp: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            value,
            timestamp,
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.value.kind()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Face matching
// ─────────────────────────────────────────────────────────────────────────────

/// One candidate identity produced by a face matcher for a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMatch {
    pub identity: String,
    /// Similarity in `[0, 1]`; higher is better.
    pub confidence: f32,
}

impl IdentityMatch {
    pub fn new(identity: impl Into<String>, confidence: f32) -> Self {
        Self {
            identity: identity.into(),
            confidence,
        }
    }

    /// Total ranking order: higher confidence first, equal confidences broken
    /// by the lexicographically smallest identity.  `Ordering::Less` means
    /// `self` ranks ahead of `other`.
    pub fn rank(&self, other: &Self) -> Ordering {
        other
            .confidence
            .total_cmp(&self.confidence)
            .then_with(|| self.identity.cmp(&other.identity))
    }

    /// Pick the top-ranked candidate according to [`IdentityMatch::rank`].
    pub fn strongest<'a, I>(candidates: I) -> Option<&'a IdentityMatch>
    where
        I: IntoIterator<Item = &'a IdentityMatch>,
    {
        candidates.into_iter().min_by(|a, b| a.rank(b))
    }
}

/// The verdict for one captured frame: the best identity (if any) and where
/// the frame was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMatch {
    pub identity: Option<String>,
    pub confidence: f32,
    pub frame_ref: ArtifactRef,
    pub timestamp: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Incident / record kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Classification of an incident or log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    /// Motion seen, face verdict still pending.
    Motion,
    Gas,
    UnknownVisitor,
    KnownVisitor,
    /// Degraded-operation entry (sensor fault, lost record, …).
    SystemFault,
}

impl IncidentKind {
    pub const ALL: [IncidentKind; 5] = [
        IncidentKind::Motion,
        IncidentKind::Gas,
        IncidentKind::UnknownVisitor,
        IncidentKind::KnownVisitor,
        IncidentKind::SystemFault,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::Motion => "motion",
            IncidentKind::Gas => "gas",
            IncidentKind::UnknownVisitor => "unknown_visitor",
            IncidentKind::KnownVisitor => "known_visitor",
            IncidentKind::SystemFault => "system_fault",
        }
    }

    /// `true` for the kinds a motion incident can take over its lifetime.
    pub fn is_motion_family(&self) -> bool {
        matches!(
            self,
            IncidentKind::Motion | IncidentKind::UnknownVisitor | IncidentKind::KnownVisitor
        )
    }
}

impl fmt::Display for IncidentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentKind {
    type Err = PatrolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IncidentKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| PatrolError::Config(format!("unknown incident kind '{s}'")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventRecord
// ─────────────────────────────────────────────────────────────────────────────

/// The immutable, persisted form of a closed incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub incident_id: Uuid,
    pub kind: IncidentKind,
    /// Matched identity for [`IncidentKind::KnownVisitor`] records.
    pub identity: Option<String>,
    pub confidence: Option<f32>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub artifact_refs: Vec<ArtifactRef>,
    pub peak_gas_level: Option<f32>,
    /// Number of capture requests that failed while the incident was open.
    pub capture_failures: u32,
    /// Free-form detail; always set for [`IncidentKind::SystemFault`].
    pub detail: Option<String>,
}

impl EventRecord {
    /// Build a zero-length system-fault entry at `at`.
    pub fn system_fault(detail: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            incident_id: Uuid::new_v4(),
            kind: IncidentKind::SystemFault,
            identity: None,
            confidence: None,
            opened_at: at,
            closed_at: at,
            artifact_refs: Vec::new(),
            peak_gas_level: None,
            capture_failures: 0,
            detail: Some(detail.into()),
        }
    }

    /// `true` when at least one requested capture never produced an artifact.
    pub fn is_partial(&self) -> bool {
        self.capture_failures > 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error taxonomy
// ─────────────────────────────────────────────────────────────────────────────

/// Pipeline-wide error taxonomy.  None of these abort the arbiter; each is
/// contained to the sample or incident it affects.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatrolError {
    #[error("Transient sensor fault on {sensor}: {details}")]
    TransientSensorFault { sensor: String, details: String },

    #[error("Face matcher timed out after {0:?}")]
    MatcherTimeout(Duration),

    #[error("Capture failure: {0}")]
    CaptureFailure(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
