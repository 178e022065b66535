//! Enrollment set – the precomputed per-identity descriptors the matcher
//! compares against.
//!
//! Persisted as JSON (`enrollment.json`).  Can also be trained from a faces
//! directory laid out one folder per person:
//!
//! ```text
//! faces/
//!   alice/  front.jpg  side.png
//!   bob/    door.jpg
//! ```
//!
//! Every descriptor in a set is computed over the same [`FaceRegion`],
//! which is stored with the set and reused for frames being matched.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use patrol_hal::{CameraFrame, FrameError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::lbp::{Descriptor, FaceRegion, FaceTooSmall};

/// Image types accepted in a faces tree.
const FACE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "pgm", "ppm", "pnm"];

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Enrollment file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unreadable face image: {0}")]
    Image(#[from] FrameError),
    #[error("Invalid face image: {0}")]
    InvalidFrame(#[from] FaceTooSmall),
    #[error("Invalid identity name {0:?}")]
    InvalidIdentity(String),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> EnrollmentError + '_ {
    move |source| EnrollmentError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Enrollment {
    #[serde(default)]
    region: FaceRegion,
    identities: BTreeMap<String, Vec<Descriptor>>,
}

impl Enrollment {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty set whose descriptors are taken over `region`.
    pub fn with_region(region: FaceRegion) -> Self {
        Self {
            region,
            identities: BTreeMap::new(),
        }
    }

    pub fn region(&self) -> FaceRegion {
        self.region
    }

    /// Add a face image for `identity`.
    ///
    /// # Errors
    ///
    /// [`EnrollmentError::InvalidIdentity`] for empty names or names that
    /// could escape the faces directory, [`EnrollmentError::InvalidFrame`]
    /// when the face region of `frame` is too small to describe.
    pub fn enroll(&mut self, identity: &str, frame: &CameraFrame) -> Result<(), EnrollmentError> {
        validate_identity(identity)?;
        let descriptor = Descriptor::from_frame(frame, self.region)?;
        self.identities
            .entry(identity.to_string())
            .or_default()
            .push(descriptor);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.identities.values().all(Vec::is_empty)
    }

    /// Enrolled identities in lexicographic order.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.identities.keys().map(String::as_str)
    }

    /// Number of descriptors stored for `identity`.
    pub fn samples(&self, identity: &str) -> usize {
        self.identities.get(identity).map_or(0, Vec::len)
    }

    pub(crate) fn descriptors(&self) -> impl Iterator<Item = (&str, &[Descriptor])> {
        self.identities
            .iter()
            .map(|(id, ds)| (id.as_str(), ds.as_slice()))
    }

    /// Load an enrollment file.  A missing file yields an empty set.
    pub fn load(path: &Path) -> Result<Self, EnrollmentError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(io_error(path))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), EnrollmentError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let raw = serde_json::to_string(self)?;
        fs::write(path, raw).map_err(io_error(path))
    }

    /// Train from a `faces/<identity>/*.jpg` tree (PNG and PNM are accepted
    /// too).  Unreadable or undersized images are skipped with a warning; a
    /// missing directory yields an empty set.
    pub fn from_faces_dir(dir: &Path, region: FaceRegion) -> Result<Self, EnrollmentError> {
        let mut enrollment = Self::with_region(region);
        if !dir.exists() {
            warn!(dir = %dir.display(), "faces directory missing; running in unknown-only mode");
            return Ok(enrollment);
        }
        let mut people: Vec<_> = fs::read_dir(dir)
            .map_err(io_error(dir))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        people.sort();

        for person in people {
            let Some(name) = person.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let mut images: Vec<_> = fs::read_dir(&person)
                .map_err(io_error(&person))?
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| is_face_image(p))
                .collect();
            images.sort();
            for image in images {
                let enrolled = CameraFrame::open(&image)
                    .map_err(EnrollmentError::from)
                    .and_then(|frame| enrollment.enroll(name, &frame));
                match enrolled {
                    Ok(()) => {}
                    Err(e @ EnrollmentError::InvalidIdentity(_)) => return Err(e),
                    Err(e) => warn!(image = %image.display(), error = %e, "skipping face image"),
                }
            }
        }

        let total: usize = enrollment.identities.values().map(Vec::len).sum();
        info!(
            identities = enrollment.identities.len(),
            images = total,
            "trained enrollment from faces directory"
        );
        Ok(enrollment)
    }
}

fn is_face_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| FACE_EXTENSIONS.iter().any(|f| ext.eq_ignore_ascii_case(f)))
}

fn validate_identity(identity: &str) -> Result<(), EnrollmentError> {
    let bad = identity.trim().is_empty()
        || identity.contains(['/', '\\'])
        || identity == "."
        || identity == "..";
    if bad {
        return Err(EnrollmentError::InvalidIdentity(identity.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn frame(seed: u8) -> CameraFrame {
        CameraFrame::gray(GrayImage::from_fn(32, 32, |x, y| {
            Luma([((y * 32 + x) as u8).wrapping_mul(seed).wrapping_add(seed)])
        }))
        .unwrap()
    }

    fn photo(seed: u32) -> RgbImage {
        RgbImage::from_fn(48, 48, |x, y| {
            let v = ((x * 7 + y * 13 + seed * 31) ^ (x * y + seed)) as u8;
            Rgb([v, v / 2, 255 - v])
        })
    }

    #[test]
    fn empty_by_default() {
        let e = Enrollment::new();
        assert!(e.is_empty());
        assert_eq!(e.identities().count(), 0);
    }

    #[test]
    fn enroll_groups_samples_by_identity() {
        let mut e = Enrollment::new();
        e.enroll("bob", &frame(3)).unwrap();
        e.enroll("alice", &frame(5)).unwrap();
        e.enroll("bob", &frame(7)).unwrap();
        assert_eq!(e.identities().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(e.samples("bob"), 2);
        assert_eq!(e.samples("carol"), 0);
    }

    #[test]
    fn enroll_rejects_path_like_names() {
        let mut e = Enrollment::new();
        for name in ["", "  ", "../root", "a/b", ".."] {
            assert!(matches!(
                e.enroll(name, &frame(1)),
                Err(EnrollmentError::InvalidIdentity(_))
            ));
        }
    }

    #[test]
    fn enroll_rejects_frames_too_small_to_describe() {
        let mut e = Enrollment::with_region(FaceRegion::whole_frame());
        let sliver = CameraFrame::gray(GrayImage::from_pixel(64, 4, Luma([90]))).unwrap();
        assert!(matches!(
            e.enroll("alice", &sliver),
            Err(EnrollmentError::InvalidFrame(_))
        ));
        assert!(e.is_empty());
    }

    #[test]
    fn save_and_load_preserve_identities_and_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces").join("enrollment.json");
        let mut e = Enrollment::with_region(FaceRegion::centre(0.8));
        e.enroll("alice", &frame(5)).unwrap();
        e.save(&path).unwrap();

        let loaded = Enrollment::load(&path).unwrap();
        assert_eq!(loaded.samples("alice"), 1);
        assert_eq!(loaded.region(), FaceRegion::centre(0.8));
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Enrollment::load(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn load_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enrollment.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(Enrollment::load(&path), Err(EnrollmentError::Json(_))));
    }

    #[test]
    fn faces_dir_trains_from_jpeg_and_png() {
        let dir = tempfile::tempdir().unwrap();
        let alice = dir.path().join("alice");
        let bob = dir.path().join("bob");
        fs::create_dir_all(&alice).unwrap();
        fs::create_dir_all(&bob).unwrap();
        photo(3).save(alice.join("1.jpg")).unwrap();
        photo(4).save(alice.join("2.JPEG")).unwrap();
        photo(9).save(bob.join("door.png")).unwrap();

        let e = Enrollment::from_faces_dir(dir.path(), FaceRegion::default()).unwrap();
        assert_eq!(e.identities().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(e.samples("alice"), 2);
        assert_eq!(e.samples("bob"), 1);
        assert_eq!(e.region(), FaceRegion::default());
    }

    #[test]
    fn faces_dir_training_skips_bad_images() {
        let dir = tempfile::tempdir().unwrap();
        let alice = dir.path().join("alice");
        fs::create_dir_all(&alice).unwrap();
        frame(5).as_image().save(alice.join("a.pgm")).unwrap();
        fs::write(alice.join("broken.jpg"), b"\xFF\xD8 truncated").unwrap();
        GrayImage::from_pixel(4, 4, Luma([7])).save(alice.join("tiny.png")).unwrap();
        fs::write(alice.join("notes.txt"), b"ignored").unwrap();
        fs::create_dir_all(dir.path().join("bob")).unwrap();

        let e = Enrollment::from_faces_dir(dir.path(), FaceRegion::default()).unwrap();
        assert_eq!(e.samples("alice"), 1);
        assert_eq!(e.samples("bob"), 0);
        assert!(!e.is_empty());
    }

    #[test]
    fn missing_faces_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let e = Enrollment::from_faces_dir(&dir.path().join("faces"), FaceRegion::default()).unwrap();
        assert!(e.is_empty());
    }
}
