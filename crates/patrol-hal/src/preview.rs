//! [`LivePreview`] – the single-slot "most recent frame" shared with the
//! dashboard.
//!
//! There is exactly one writer (the capture controller) and any number of
//! readers.  The in-memory slot is an `Arc` swapped under a lock, so a reader
//! either sees the old frame or the new one, never a torn mix.  The on-disk
//! copy is written to a temporary file in the same directory and renamed over
//! the well-known path, which is atomic on POSIX filesystems.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use image::ImageFormat;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::camera::{CameraFrame, FrameError};

pub struct LivePreview {
    path: PathBuf,
    latest: RwLock<Option<Arc<CameraFrame>>>,
}

impl LivePreview {
    /// Create a preview slot published at `path` (e.g. `events/live.jpg`).
    /// The file is always JPEG regardless of extension.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            latest: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the preview with `frame`, in memory and on disk.
    ///
    /// The in-memory slot is updated even when the disk write fails.
    pub fn publish(&self, frame: Arc<CameraFrame>) -> Result<(), FrameError> {
        let bytes = frame.encode(ImageFormat::Jpeg);
        match self.latest.write() {
            Ok(mut slot) => *slot = Some(frame),
            Err(poisoned) => *poisoned.into_inner() = Some(frame),
        }

        let bytes = bytes?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_data()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!(path = %self.path.display(), "live preview replaced");
        Ok(())
    }

    /// The most recently published frame, if any.
    pub fn latest(&self) -> Option<Arc<CameraFrame>> {
        match self.latest.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn frame(fill: u8) -> Arc<CameraFrame> {
        Arc::new(CameraFrame::gray(GrayImage::from_pixel(4, 4, Luma([fill]))).unwrap())
    }

    #[test]
    fn empty_slot_has_no_frame() {
        let dir = tempfile::tempdir().unwrap();
        let preview = LivePreview::new(dir.path().join("live.jpg"));
        assert!(preview.latest().is_none());
        assert!(!preview.path().exists());
    }

    #[test]
    fn publish_overwrites_single_slot() {
        let dir = tempfile::tempdir().unwrap();
        let preview = LivePreview::new(dir.path().join("live.jpg"));

        preview.publish(frame(10)).unwrap();
        preview.publish(frame(200)).unwrap();

        assert_eq!(preview.latest().unwrap(), frame(200));
        let bytes = std::fs::read(preview.path()).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
        let on_disk = CameraFrame::decode(&bytes).unwrap();
        assert!(on_disk.to_luma8().get_pixel(1, 1).0[0] > 150);

        // Only the well-known file remains; temp files were renamed away.
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn publish_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let preview = LivePreview::new(dir.path().join("events").join("live.jpg"));
        preview.publish(frame(3)).unwrap();
        assert!(preview.path().exists());
    }
}
