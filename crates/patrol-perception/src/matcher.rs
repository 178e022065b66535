//! [`FaceMatcher`] – frame in, ranked identities out.
//!
//! [`LbphMatcher`] scores a frame against every enrolled identity using the
//! [`Descriptor`] texture signature, taken over the enrollment's face region.
//! An identity's confidence is its best similarity over all of its enrolled
//! samples.  The enrollment set can be
//! swapped at runtime (e.g. after `patrol enroll`) without restarting.

use std::sync::RwLock;

use patrol_hal::CameraFrame;
use patrol_types::IdentityMatch;
use thiserror::Error;
use tracing::debug;

use crate::enrollment::Enrollment;
use crate::lbp::Descriptor;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    /// Nobody is enrolled; the caller treats this as "no match".
    #[error("no enrollment data")]
    NoEnrollmentData,
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Finite sequence of candidate identities, best first.
///
/// Ordered by descending confidence, ties by ascending identity.
#[derive(Debug, Clone)]
pub struct Matches {
    inner: std::vec::IntoIter<IdentityMatch>,
}

impl Matches {
    pub fn new(mut candidates: Vec<IdentityMatch>) -> Self {
        candidates.sort_by(|a, b| a.rank(b));
        Self {
            inner: candidates.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Iterator for Matches {
    type Item = IdentityMatch;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Matches {}

/// Identifies faces in frames.
///
/// Matching is CPU-bound and is always run on a blocking worker, never on
/// the arbiter task.
pub trait FaceMatcher: Send + Sync {
    /// Score `frame` against the enrollment set.
    ///
    /// # Errors
    ///
    /// [`MatchError::NoEnrollmentData`] when nobody is enrolled.
    fn match_frame(&self, frame: &CameraFrame) -> Result<Matches, MatchError>;
}

/// LBP-histogram matcher.
pub struct LbphMatcher {
    enrollment: RwLock<Enrollment>,
    min_confidence: f32,
}

impl LbphMatcher {
    pub fn new(enrollment: Enrollment) -> Self {
        Self {
            enrollment: RwLock::new(enrollment),
            min_confidence: 0.0,
        }
    }

    /// Drop candidates scoring below `floor` from the returned sequence.
    pub fn with_min_confidence(mut self, floor: f32) -> Self {
        self.min_confidence = floor.clamp(0.0, 1.0);
        self
    }

    /// Replace the enrollment set.
    pub fn reload(&self, enrollment: Enrollment) {
        match self.enrollment.write() {
            Ok(mut slot) => *slot = enrollment,
            Err(poisoned) => *poisoned.into_inner() = enrollment,
        }
    }
}

impl FaceMatcher for LbphMatcher {
    fn match_frame(&self, frame: &CameraFrame) -> Result<Matches, MatchError> {
        let enrollment = match self.enrollment.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if enrollment.is_empty() {
            return Err(MatchError::NoEnrollmentData);
        }

        let query = Descriptor::from_frame(frame, enrollment.region())
            .map_err(|e| MatchError::InvalidFrame(e.to_string()))?;
        let candidates: Vec<IdentityMatch> = enrollment
            .descriptors()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(identity, samples)| {
                let best = samples
                    .iter()
                    .map(|d| query.similarity(d))
                    .fold(0.0_f32, f32::max);
                IdentityMatch::new(identity, best)
            })
            .filter(|m| m.confidence >= self.min_confidence)
            .collect();

        debug!(candidates = candidates.len(), "frame matched against enrollment");
        Ok(Matches::new(candidates))
    }
}
