//! Appliance configuration – reads/writes `~/.patrol/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use patrol_kernel::ArbiterConfig;
use patrol_perception::FaceRegion;
use patrol_runtime::{Backoff, PipelineConfig, SensorWorkerConfig};

/// How the gas module is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GasInput {
    /// Scalar level through the ADC.
    #[default]
    Analog,
    /// The module's active-low `DO` comparator pin; reads as 0.0 or 1.0.
    Digital,
}

/// Persisted appliance configuration.
///
/// Storage paths left unset are derived from `base_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    /// Snapshots and the live preview frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recordings_dir: Option<PathBuf>,
    /// `faces/<identity>/*.jpg` training tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faces_dir: Option<PathBuf>,

    #[serde(default = "default_motion_cooldown")]
    pub motion_cooldown_seconds: f64,
    #[serde(default = "default_capture_window")]
    pub capture_window_seconds: f64,
    #[serde(default = "default_frames_per_incident")]
    pub frames_per_incident: u32,
    #[serde(default = "default_frame_interval")]
    pub frame_interval_seconds: f64,
    #[serde(default = "default_true")]
    pub record_clip: bool,
    #[serde(default = "default_clip_duration")]
    pub clip_duration_seconds: f64,
    #[serde(default = "default_clip_fps")]
    pub clip_fps: u32,

    #[serde(default = "default_gas_alarm")]
    pub gas_alarm_threshold: f32,
    #[serde(default = "default_gas_hysteresis")]
    pub gas_hysteresis_threshold: f32,
    #[serde(default = "default_gas_debounce")]
    pub gas_debounce_seconds: f64,

    #[serde(default)]
    pub gas_input: GasInput,

    #[serde(default = "default_match_threshold")]
    pub match_confidence_threshold: f32,
    /// Share of each frame dimension, centred, that face matching looks at.
    #[serde(default = "default_face_crop")]
    pub face_crop: f32,
    #[serde(default = "default_matcher_timeout")]
    pub matcher_timeout_seconds: f64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_sensor_poll_ms")]
    pub sensor_poll_ms: u64,
    #[serde(default = "default_sensor_retry_attempts")]
    pub sensor_retry_attempts: u32,
    #[serde(default = "default_sensor_retry_base_ms")]
    pub sensor_retry_base_ms: u64,
    #[serde(default = "default_sensor_stale_after")]
    pub sensor_stale_after_seconds: f64,
    #[serde(default = "default_camera_idle_timeout")]
    pub camera_idle_timeout_seconds: f64,
}

fn default_base_dir() -> PathBuf {
    patrol_home(&home_dir())
}
fn default_motion_cooldown() -> f64 {
    10.0
}
fn default_capture_window() -> f64 {
    5.0
}
fn default_frames_per_incident() -> u32 {
    3
}
fn default_frame_interval() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}
fn default_clip_duration() -> f64 {
    5.0
}
fn default_clip_fps() -> u32 {
    10
}
fn default_gas_alarm() -> f32 {
    0.6
}
fn default_gas_hysteresis() -> f32 {
    0.4
}
fn default_gas_debounce() -> f64 {
    30.0
}
fn default_match_threshold() -> f32 {
    0.6
}
fn default_face_crop() -> f32 {
    FaceRegion::DEFAULT_FRACTION
}
fn default_camera_idle_timeout() -> f64 {
    10.0
}
fn default_matcher_timeout() -> f64 {
    2.0
}
fn default_worker_pool_size() -> usize {
    2
}
fn default_sensor_poll_ms() -> u64 {
    100
}
fn default_sensor_retry_attempts() -> u32 {
    3
}
fn default_sensor_retry_base_ms() -> u64 {
    50
}
fn default_sensor_stale_after() -> f64 {
    10.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            db_path: None,
            events_dir: None,
            recordings_dir: None,
            faces_dir: None,
            motion_cooldown_seconds: default_motion_cooldown(),
            capture_window_seconds: default_capture_window(),
            frames_per_incident: default_frames_per_incident(),
            frame_interval_seconds: default_frame_interval(),
            record_clip: default_true(),
            clip_duration_seconds: default_clip_duration(),
            clip_fps: default_clip_fps(),
            gas_alarm_threshold: default_gas_alarm(),
            gas_hysteresis_threshold: default_gas_hysteresis(),
            gas_debounce_seconds: default_gas_debounce(),
            gas_input: GasInput::default(),
            match_confidence_threshold: default_match_threshold(),
            face_crop: default_face_crop(),
            matcher_timeout_seconds: default_matcher_timeout(),
            worker_pool_size: default_worker_pool_size(),
            sensor_poll_ms: default_sensor_poll_ms(),
            sensor_retry_attempts: default_sensor_retry_attempts(),
            sensor_retry_base_ms: default_sensor_retry_base_ms(),
            sensor_stale_after_seconds: default_sensor_stale_after(),
            camera_idle_timeout_seconds: default_camera_idle_timeout(),
        }
    }
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("patrol.db"))
    }

    pub fn events_dir(&self) -> PathBuf {
        self.events_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("events"))
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.recordings_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("recordings"))
    }

    pub fn faces_dir(&self) -> PathBuf {
        self.faces_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("faces"))
    }

    /// Precomputed descriptors; preferred over retraining from `faces_dir`.
    pub fn enrollment_path(&self) -> PathBuf {
        self.base_dir.join("enrollment.json")
    }

    pub fn face_region(&self) -> Result<FaceRegion, String> {
        if !(self.face_crop > 0.0 && self.face_crop <= 1.0) {
            return Err(format!("face_crop = {} must be in (0, 1]", self.face_crop));
        }
        Ok(FaceRegion::centre(self.face_crop))
    }

    /// Translate into runtime parameters, rejecting values the pipeline
    /// cannot run with.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, String> {
        let arbiter = ArbiterConfig {
            motion_cooldown: seconds("motion_cooldown_seconds", self.motion_cooldown_seconds)?,
            capture_window: seconds("capture_window_seconds", self.capture_window_seconds)?,
            frames_per_incident: self.frames_per_incident,
            frame_interval: seconds("frame_interval_seconds", self.frame_interval_seconds)?,
            record_clip: self.record_clip,
            clip_duration: seconds("clip_duration_seconds", self.clip_duration_seconds)?,
            gas_alarm_threshold: self.gas_alarm_threshold,
            gas_hysteresis_threshold: self.gas_hysteresis_threshold,
            gas_debounce: seconds("gas_debounce_seconds", self.gas_debounce_seconds)?,
            match_confidence_threshold: self.match_confidence_threshold,
        };
        let config = PipelineConfig {
            arbiter,
            worker_pool_size: self.worker_pool_size,
            matcher_timeout: seconds("matcher_timeout_seconds", self.matcher_timeout_seconds)?,
            sensor: SensorWorkerConfig {
                poll_interval: Duration::from_millis(self.sensor_poll_ms),
                retry: Backoff::new(
                    self.sensor_retry_attempts,
                    Duration::from_millis(self.sensor_retry_base_ms),
                ),
            },
            sensor_stale_after: seconds(
                "sensor_stale_after_seconds",
                self.sensor_stale_after_seconds,
            )?,
            idle_timeout: seconds(
                "camera_idle_timeout_seconds",
                self.camera_idle_timeout_seconds,
            )?,
            ..PipelineConfig::default()
        };
        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value).map_err(|e| format!("{key} = {value}: {e}"))
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn patrol_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".patrol")
}

/// Return the path to `~/.patrol/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    patrol_home(home).join("config.toml")
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// The effective configuration: the file at `path` (or defaults when
/// absent) with environment overrides applied.
pub fn load_effective(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Apply `PATROL_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `PATROL_BASE_DIR` | `base_dir` |
/// | `PATROL_DB_PATH` | `db_path` |
/// | `PATROL_MATCH_THRESHOLD` | `match_confidence_threshold` |
/// | `PATROL_GAS_ALARM_THRESHOLD` | `gas_alarm_threshold` |
/// | `PATROL_WORKER_POOL_SIZE` | `worker_pool_size` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("PATROL_BASE_DIR") {
        cfg.base_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("PATROL_DB_PATH") {
        cfg.db_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("PATROL_MATCH_THRESHOLD")
        && let Ok(t) = v.parse::<f32>()
    {
        cfg.match_confidence_threshold = t;
    }
    if let Ok(v) = std::env::var("PATROL_GAS_ALARM_THRESHOLD")
        && let Ok(h) = v.parse::<f32>()
    {
        cfg.gas_alarm_threshold = h;
    }
    if let Ok(v) = std::env::var("PATROL_WORKER_POOL_SIZE")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.worker_pool_size = n;
    }
}

/// Save the config to `path`, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
