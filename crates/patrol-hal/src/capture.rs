//! [`CaptureController`] – turns "grab evidence now" requests into stored
//! artifacts.
//!
//! A capture is either a single snapshot (`duration_hint = None`) or a short
//! clip recorded for roughly the hinted duration.  Every successful capture
//! also refreshes the [`LivePreview`] slot.
//!
//! [`FsCaptureController`] is the filesystem-backed implementation:
//! snapshots land in the events directory as JPEG, clips in the recordings
//! directory as animated GIF.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, ImageFormat};
use patrol_types::{ArtifactRef, PatrolError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::camera::{Camera, CameraFrame, FrameError};
use crate::preview::LivePreview;

/// Errors returned by [`CaptureController::capture`].
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("failed to write artifact {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode artifact {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl From<CaptureError> for PatrolError {
    fn from(e: CaptureError) -> Self {
        PatrolError::CaptureFailure(e.to_string())
    }
}

/// A stored artifact.
#[derive(Debug, Clone)]
pub struct Capture {
    pub artifact: ArtifactRef,
    /// The captured frame, present for snapshots so it can be face-matched.
    pub frame: Option<Arc<CameraFrame>>,
    pub captured_at: DateTime<Utc>,
}

/// Grabs snapshots / clips from a camera and writes them to storage.
///
/// Implementations are shared across worker threads and must serialise
/// access to the underlying device themselves.
pub trait CaptureController: Send + Sync {
    /// Capture a snapshot (`None`) or a clip of about `duration_hint`.
    ///
    /// # Errors
    ///
    /// [`CaptureError::CameraUnavailable`] when no frame could be grabbed,
    /// [`CaptureError::Storage`] / [`CaptureError::Encode`] when the artifact
    /// could not be written.
    fn capture(&self, duration_hint: Option<Duration>) -> Result<Capture, CaptureError>;

    /// Put the camera to sleep (`true`) or wake it.  A capture on a sleeping
    /// camera wakes it first.
    fn set_idle(&self, _idle: bool) -> Result<(), CaptureError> {
        Ok(())
    }
}

const DEFAULT_CLIP_FPS: u32 = 5;

/// Filesystem-backed [`CaptureController`].
pub struct FsCaptureController {
    camera: Mutex<Box<dyn Camera>>,
    asleep: AtomicBool,
    snapshot_dir: PathBuf,
    clip_dir: PathBuf,
    preview: Arc<LivePreview>,
    clip_fps: u32,
    seq: AtomicU64,
}

impl FsCaptureController {
    pub fn new(
        camera: Box<dyn Camera>,
        snapshot_dir: impl Into<PathBuf>,
        clip_dir: impl Into<PathBuf>,
        preview: Arc<LivePreview>,
    ) -> Self {
        Self {
            camera: Mutex::new(camera),
            asleep: AtomicBool::new(false),
            snapshot_dir: snapshot_dir.into(),
            clip_dir: clip_dir.into(),
            preview,
            clip_fps: DEFAULT_CLIP_FPS,
            seq: AtomicU64::new(0),
        }
    }

    /// Frame rate used when recording clips (clamped to at least 1).
    pub fn with_clip_fps(mut self, fps: u32) -> Self {
        self.clip_fps = fps.max(1);
        self
    }

    pub fn preview(&self) -> &Arc<LivePreview> {
        &self.preview
    }

    pub fn is_idle(&self) -> bool {
        self.asleep.load(Ordering::SeqCst)
    }

    fn camera(&self) -> Result<MutexGuard<'_, Box<dyn Camera>>, CaptureError> {
        self.camera
            .lock()
            .map_err(|_| CaptureError::CameraUnavailable("camera lock poisoned".to_string()))
    }

    fn grab(&self) -> Result<CameraFrame, CaptureError> {
        let unavailable = |e: PatrolError| CaptureError::CameraUnavailable(e.to_string());
        let mut camera = self.camera()?;
        if self.asleep.swap(false, Ordering::SeqCst) {
            camera.wake().map_err(unavailable)?;
            debug!(camera = camera.id(), "camera woken for capture");
        }
        camera.capture().map_err(unavailable)
    }

    fn artifact_path(&self, dir: &Path, stem: &str, ext: &str, at: DateTime<Utc>) -> PathBuf {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        dir.join(format!("{stem}_{}_{seq}.{ext}", at.format("%Y%m%d%H%M%S")))
    }

    fn write(path: &Path, bytes: &[u8]) -> Result<(), CaptureError> {
        let to_storage = |source| CaptureError::Storage {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(to_storage)?;
        }
        std::fs::write(path, bytes).map_err(to_storage)
    }

    fn refresh_preview(&self, frame: Arc<CameraFrame>) {
        if let Err(e) = self.preview.publish(frame) {
            warn!(error = %e, path = %self.preview.path().display(), "live preview update failed");
        }
    }

    fn snapshot(&self) -> Result<Capture, CaptureError> {
        let frame = Arc::new(self.grab()?);
        let captured_at = Utc::now();
        let path = self.artifact_path(&self.snapshot_dir, "snapshot", "jpg", captured_at);
        let bytes = frame
            .encode(ImageFormat::Jpeg)
            .map_err(|e| encode_error(&path, e))?;
        Self::write(&path, &bytes)?;
        self.refresh_preview(Arc::clone(&frame));
        debug!(artifact = %path.display(), "snapshot stored");
        Ok(Capture {
            artifact: path,
            frame: Some(frame),
            captured_at,
        })
    }

    fn clip(&self, duration: Duration) -> Result<Capture, CaptureError> {
        let frame_count = (duration.as_secs_f64() * self.clip_fps as f64).ceil().max(1.0) as usize;
        let interval = Duration::from_secs_f64(1.0 / self.clip_fps as f64);
        let delay = Delay::from_numer_denom_ms(1000, self.clip_fps);
        let captured_at = Utc::now();
        let path = self.artifact_path(&self.clip_dir, "clip", "gif", captured_at);

        let mut stream = Vec::new();
        let mut last: Option<CameraFrame> = None;
        let mut recorded = 0usize;
        {
            let mut encoder = GifEncoder::new(&mut stream);
            encoder
                .set_repeat(Repeat::Infinite)
                .map_err(|e| CaptureError::Encode {
                    path: path.clone(),
                    source: e,
                })?;
            for i in 0..frame_count {
                if i > 0 {
                    std::thread::sleep(interval);
                }
                let frame = match self.grab() {
                    Ok(frame) => frame,
                    Err(e) if last.is_some() => {
                        warn!(frame = i, error = %e, "clip truncated after camera error");
                        break;
                    }
                    Err(e) => return Err(e),
                };
                // GIF frames share one logical screen.
                if let Some(prev) = &last
                    && (prev.width(), prev.height()) != (frame.width(), frame.height())
                {
                    warn!(frame = i, "camera geometry changed mid-clip; truncating clip");
                    break;
                }
                let rgba = frame.as_image().to_rgba8();
                encoder
                    .encode_frame(Frame::from_parts(rgba, 0, 0, delay))
                    .map_err(|e| CaptureError::Encode {
                        path: path.clone(),
                        source: e,
                    })?;
                recorded += 1;
                last = Some(frame);
            }
        }

        let Some(last) = last else {
            return Err(CaptureError::CameraUnavailable("clip captured no frames".to_string()));
        };
        Self::write(&path, &stream)?;
        self.refresh_preview(Arc::new(last));
        debug!(artifact = %path.display(), frames = recorded, "clip stored");
        Ok(Capture {
            artifact: path,
            frame: None,
            captured_at,
        })
    }
}

fn encode_error(path: &Path, e: FrameError) -> CaptureError {
    match e {
        FrameError::Image(source) => CaptureError::Encode {
            path: path.to_path_buf(),
            source,
        },
        other => CaptureError::CameraUnavailable(other.to_string()),
    }
}

impl CaptureController for FsCaptureController {
    fn capture(&self, duration_hint: Option<Duration>) -> Result<Capture, CaptureError> {
        match duration_hint {
            Some(d) if !d.is_zero() => self.clip(d),
            _ => self.snapshot(),
        }
    }

    fn set_idle(&self, idle: bool) -> Result<(), CaptureError> {
        let mut camera = self.camera()?;
        if self.asleep.load(Ordering::SeqCst) == idle {
            return Ok(());
        }
        let result = if idle { camera.sleep() } else { camera.wake() };
        result.map_err(|e| CaptureError::CameraUnavailable(e.to_string()))?;
        self.asleep.store(idle, Ordering::SeqCst);
        info!(camera = camera.id(), idle, "camera power state changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PixelFormat;
    use crate::sim::SimCamera;
    use image::AnimationDecoder;
    use image::codecs::gif::GifDecoder;

    /// Camera that fails on the listed (1-based) capture calls.
    struct FlakyCamera {
        calls: u32,
        fail_on: Vec<u32>,
    }

    impl Camera for FlakyCamera {
        fn id(&self) -> &str {
            "flaky"
        }
        fn capture(&mut self) -> Result<CameraFrame, PatrolError> {
            self.calls += 1;
            if self.fail_on.contains(&self.calls) {
                return Err(PatrolError::CaptureFailure("sensor asleep".to_string()));
            }
            Ok(CameraFrame::from_raw(
                8,
                8,
                PixelFormat::Gray8,
                vec![self.calls as u8 * 20; 64],
            )?)
        }
    }

    fn controller(dir: &Path, fail_on: Vec<u32>) -> FsCaptureController {
        let preview = Arc::new(LivePreview::new(dir.join("events").join("live.jpg")));
        FsCaptureController::new(
            Box::new(FlakyCamera { calls: 0, fail_on }),
            dir.join("events"),
            dir.join("recordings"),
            preview,
        )
        .with_clip_fps(50)
    }

    fn gif_frames(path: &Path) -> usize {
        let bytes = std::fs::read(path).unwrap();
        let decoder = GifDecoder::new(std::io::Cursor::new(bytes)).unwrap();
        decoder.into_frames().collect_frames().unwrap().len()
    }

    #[test]
    fn snapshot_writes_jpeg_artifact_and_preview() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), vec![]);

        let cap = ctl.capture(None).unwrap();
        assert!(cap.artifact.starts_with(dir.path().join("events")));
        assert_eq!(cap.artifact.extension().unwrap(), "jpg");
        let stored = CameraFrame::open(&cap.artifact).unwrap();
        assert_eq!((stored.width(), stored.height()), (8, 8));
        assert!(cap.frame.is_some());
        assert!(ctl.preview().path().exists());
        assert_eq!(ctl.preview().latest().unwrap().to_luma8().get_pixel(0, 0).0, [20]);
    }

    #[test]
    fn snapshots_get_distinct_paths() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), vec![]);
        let a = ctl.capture(None).unwrap();
        let b = ctl.capture(None).unwrap();
        assert_ne!(a.artifact, b.artifact);
    }

    #[test]
    fn snapshot_failure_reports_camera_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), vec![1]);
        let err = ctl.capture(None).unwrap_err();
        assert!(matches!(err, CaptureError::CameraUnavailable(_)));
        assert!(ctl.preview().latest().is_none());
    }

    #[test]
    fn clip_records_animated_gif() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), vec![]);
        let cap = ctl.capture(Some(Duration::from_millis(100))).unwrap();
        assert!(cap.frame.is_none());
        assert!(cap.artifact.starts_with(dir.path().join("recordings")));
        assert_eq!(cap.artifact.extension().unwrap(), "gif");
        assert_eq!(gif_frames(&cap.artifact), 5);
    }

    #[test]
    fn clip_is_truncated_not_lost_on_mid_clip_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), vec![3]);
        let cap = ctl.capture(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(gif_frames(&cap.artifact), 2);
    }

    #[test]
    fn unwritable_storage_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the snapshot directory should be.
        let blocker = dir.path().join("events");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let preview = Arc::new(LivePreview::new(dir.path().join("live.jpg")));
        let ctl = FsCaptureController::new(
            Box::new(FlakyCamera {
                calls: 0,
                fail_on: vec![],
            }),
            &blocker,
            dir.path().join("recordings"),
            preview,
        );
        let err = ctl.capture(None).unwrap_err();
        assert!(matches!(err, CaptureError::Storage { .. }));
        let patrol: PatrolError = err.into();
        assert!(matches!(patrol, PatrolError::CaptureFailure(_)));
    }

    #[test]
    fn idle_camera_sleeps_and_capture_wakes_it() {
        let dir = tempfile::tempdir().unwrap();
        let camera = SimCamera::new("cam0");
        let power = camera.sleep_flag();
        let preview = Arc::new(LivePreview::new(dir.path().join("live.jpg")));
        let ctl = FsCaptureController::new(
            Box::new(camera),
            dir.path().join("events"),
            dir.path().join("recordings"),
            preview,
        );

        ctl.set_idle(true).unwrap();
        assert!(ctl.is_idle());
        assert!(power.load(Ordering::SeqCst));

        ctl.capture(None).unwrap();
        assert!(!ctl.is_idle());
        assert!(!power.load(Ordering::SeqCst));

        ctl.set_idle(true).unwrap();
        ctl.set_idle(false).unwrap();
        assert!(!power.load(Ordering::SeqCst));
    }
}
