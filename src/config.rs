// Configuration management for the dashcam

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::video::FrameScanLimits;

const BYTES_PER_KB: usize = 1024;
pub const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Error type for configuration problems
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid camera '{id}': {reason}")]
    InvalidCamera { id: String, reason: String },

    #[error("Duplicate camera id: {0}")]
    DuplicateCamera(String),
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the rolling archive; one subdirectory per camera
    #[serde(default = "get_default_video_dir")]
    pub video_dir: PathBuf,

    /// Total archive size cap in gigabytes
    #[serde(default = "default_storage_cap_gb")]
    pub storage_cap_gb: u64,

    /// Length of one recorded segment in seconds
    #[serde(default = "default_segment_length_secs")]
    pub segment_length_secs: u64,

    /// ffmpeg binary used for V4L2 capture and for exports
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// rpicam-vid binary used for CSI cameras
    #[serde(default = "default_libcamera_path")]
    pub libcamera_path: String,

    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub export: ExportConfig,

    /// Camera definitions, in display order
    #[serde(default = "default_cameras")]
    pub cameras: Vec<CameraConfig>,
}

/// Live frame extraction and MJPEG streaming settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    /// How often each camera refreshes its cached frame from disk
    #[serde(default = "default_frame_refresh_ms")]
    pub frame_refresh_ms: u64,

    /// Interval between parts of a continuous MJPEG stream
    #[serde(default = "default_stream_interval_ms")]
    pub stream_interval_ms: u64,

    /// Consecutive empty intervals after which a stream is closed
    #[serde(default = "default_max_missed_frames")]
    pub max_missed_frames: u32,

    /// Maximum concurrent continuous viewers per camera
    #[serde(default = "default_max_viewers")]
    pub max_viewers: usize,

    /// Bytes read from the end of the active segment (KB).
    /// Must hold at least one whole frame at the configured resolution.
    #[serde(default = "default_tail_window_kb")]
    pub tail_window_kb: usize,

    /// Furthest distance searched back from an end marker for its start marker (KB)
    #[serde(default = "default_max_frame_kb")]
    pub max_frame_kb: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Seconds between quota enforcement passes
    #[serde(default = "default_enforce_interval_secs")]
    pub enforce_interval_secs: u64,

    /// How long a computed usage figure is served before re-walking the archive
    #[serde(default = "default_usage_cache_secs")]
    pub usage_cache_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Seconds between output-size polls while the transcoder runs
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,

    /// MPEG-4 q:v for exports (1-31, lower is better)
    #[serde(default = "default_export_quality")]
    pub quality: u32,
}

/// How a camera is captured
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// ffmpeg reading a V4L2 device (USB cameras)
    #[default]
    Ffmpeg,
    /// rpicam-vid (CSI cameras on a Raspberry Pi)
    Libcamera,
}

/// Configuration for a single camera
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    /// Stable identifier, used in directory and file names
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Capture device, e.g. /dev/video0
    #[serde(default = "default_device")]
    pub device: String,

    /// Clockwise rotation in degrees (0, 90, 180, 270)
    #[serde(default)]
    pub rotation: u32,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// MJPEG q:v (2-31, lower is better)
    #[serde(default = "default_mjpeg_quality")]
    pub mjpeg_quality: u32,

    /// Nominal bitrate, only used to estimate segment durations
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,

    /// Burn a UTC timestamp into the picture
    #[serde(default)]
    pub embed_timestamp: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub backend: CaptureBackend,
}

impl CameraConfig {
    /// A camera with default capture parameters
    pub fn new(id: &str, device: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            device: device.to_string(),
            rotation: 0,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            mjpeg_quality: default_mjpeg_quality(),
            bitrate_kbps: default_bitrate_kbps(),
            embed_timestamp: false,
            enabled: true,
            backend: CaptureBackend::default(),
        }
    }

    /// Name to show in logs and UIs; falls back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Check the invariants the capture loop and archive layout rely on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidCamera {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if !is_filesystem_safe_id(&self.id) {
            return Err(invalid("id must be non-empty, not start with '.', and use only [A-Za-z0-9_-]"));
        }
        if !matches!(self.rotation, 0 | 90 | 180 | 270) {
            return Err(invalid("rotation must be 0, 90, 180 or 270"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(invalid("resolution must be non-zero"));
        }
        if self.fps == 0 {
            return Err(invalid("fps must be non-zero"));
        }
        if !(2..=31).contains(&self.mjpeg_quality) {
            return Err(invalid("mjpeg_quality must be between 2 and 31"));
        }
        Ok(())
    }
}

/// Camera ids become directory names and filename prefixes
pub fn is_filesystem_safe_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video_dir: get_default_video_dir(),
            storage_cap_gb: default_storage_cap_gb(),
            segment_length_secs: default_segment_length_secs(),
            ffmpeg_path: default_ffmpeg_path(),
            libcamera_path: default_libcamera_path(),
            live: LiveConfig::default(),
            storage: StorageConfig::default(),
            export: ExportConfig::default(),
            cameras: default_cameras(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            frame_refresh_ms: default_frame_refresh_ms(),
            stream_interval_ms: default_stream_interval_ms(),
            max_missed_frames: default_max_missed_frames(),
            max_viewers: default_max_viewers(),
            tail_window_kb: default_tail_window_kb(),
            max_frame_kb: default_max_frame_kb(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enforce_interval_secs: default_enforce_interval_secs(),
            usage_cache_secs: default_usage_cache_secs(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            progress_interval_secs: default_progress_interval_secs(),
            quality: default_export_quality(),
        }
    }
}

impl LiveConfig {
    pub fn frame_refresh(&self) -> Duration {
        Duration::from_millis(self.frame_refresh_ms.max(1))
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms.max(1))
    }

    pub fn scan_limits(&self) -> FrameScanLimits {
        FrameScanLimits {
            tail_window: self.tail_window_kb * BYTES_PER_KB,
            max_frame_size: self.max_frame_kb * BYTES_PER_KB,
        }
    }
}

impl Config {
    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => log::warn!("[Config] Failed to load {}: {}", path.display(), e),
            }
        }

        Self::default()
    }

    /// Load and parse a config file, failing on any error
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// Validate every camera and reject duplicate ids
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            camera.validate()?;
            if !seen.insert(camera.id.as_str()) {
                return Err(ConfigError::DuplicateCamera(camera.id.clone()));
            }
        }
        Ok(())
    }

    pub fn storage_cap_bytes(&self) -> u64 {
        self.storage_cap_gb.saturating_mul(BYTES_PER_GB)
    }

    pub fn segment_length(&self) -> Duration {
        Duration::from_secs(self.segment_length_secs.max(1))
    }

    /// Frame rate used for exports: the first camera's, or the default
    pub fn export_fps(&self) -> u32 {
        self.cameras.first().map(|c| c.fps).unwrap_or_else(default_fps)
    }
}

/// Get the default config file path
pub fn get_default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dashcam")
        .join("config.toml")
}

/// Get the default archive location
fn get_default_video_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("state")))
        .map(|d| d.join("dashcam").join("videos"))
        .unwrap_or_else(|| PathBuf::from("./videos"))
}

fn default_storage_cap_gb() -> u64 {
    10
}

fn default_segment_length_secs() -> u64 {
    60
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_libcamera_path() -> String {
    "rpicam-vid".to_string()
}

fn default_cameras() -> Vec<CameraConfig> {
    let mut camera = CameraConfig::new("default", &default_device());
    camera.name = "Default Camera".to_string();
    vec![camera]
}

fn default_device() -> String {
    "/dev/video0".to_string()
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    24
}

fn default_mjpeg_quality() -> u32 {
    5
}

fn default_bitrate_kbps() -> u32 {
    1024
}

// 100ms = 10 Hz refresh of the cached frame
fn default_frame_refresh_ms() -> u64 {
    100
}

// 40ms = 25 fps MJPEG stream
fn default_stream_interval_ms() -> u64 {
    40
}

// 50 x 40ms = 2 seconds without frames
fn default_max_missed_frames() -> u32 {
    50
}

fn default_max_viewers() -> usize {
    8
}

fn default_tail_window_kb() -> usize {
    256
}

fn default_max_frame_kb() -> usize {
    200
}

fn default_enforce_interval_secs() -> u64 {
    30
}

fn default_usage_cache_secs() -> u64 {
    5
}

fn default_progress_interval_secs() -> u64 {
    5
}

fn default_export_quality() -> u32 {
    2
}

/// Default true value (for serde)
fn default_true() -> bool {
    true
}
