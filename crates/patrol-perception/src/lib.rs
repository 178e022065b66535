//! `patrol-perception` – face recognition.
//!
//! # Modules
//!
//! - [`lbp`] – [`Descriptor`][lbp::Descriptor]: Local Binary Pattern
//!   histogram signature of the [`FaceRegion`][lbp::FaceRegion] of a frame,
//!   lighting-normalised by histogram equalisation.
//! - [`enrollment`] – [`Enrollment`][enrollment::Enrollment]: the
//!   precomputed per-identity descriptors, persisted as JSON or trained from
//!   a `faces/<identity>/` tree.
//! - [`matcher`] – [`FaceMatcher`][matcher::FaceMatcher] and the
//!   [`LbphMatcher`][matcher::LbphMatcher] implementation.

pub mod enrollment;
pub mod lbp;
pub mod matcher;

pub use enrollment::{Enrollment, EnrollmentError};
pub use lbp::{Descriptor, FaceRegion, FaceTooSmall};
pub use matcher::{FaceMatcher, LbphMatcher, MatchError, Matches};
