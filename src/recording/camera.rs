// Per-camera capture loop
//
// A Camera records back-to-back segments by launching one encoder process per
// segment and waiting for it to finish. Alongside, a refresh thread pulls the
// newest complete frame out of the segment being written and pushes it into
// the camera's StreamManager.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};

use super::stream::{StreamManager, StreamSettings};
use super::{CameraStatus, RecordingStatus};
use crate::config::{CameraConfig, Config, ConfigError};
use crate::encoding::{capture_invocation, spawn_stderr_tail, EncoderError, EncoderTools, Tool};
use crate::storage::segment_file_name;
use crate::video::{extract_frame_from, latest_segment, FrameScanLimits};

/// Error type for capture operations
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Invalid camera configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("No enabled cameras configured")]
    NoCameras,

    #[error("Camera {0} is already running")]
    AlreadyStarted(String),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("Encoder exited with {status}")]
    EncoderExit { status: ExitStatus, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to start thread: {0}")]
    Thread(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Settings shared by every camera
#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// Archive root; each camera records into `<video_dir>/<id>/`
    pub video_dir: PathBuf,
    pub segment_length: Duration,
    pub tools: EncoderTools,
    pub frame_refresh: Duration,
    pub scan_limits: FrameScanLimits,
    pub stream: StreamSettings,
    /// Minimum time between two logged capture failures
    pub error_log_throttle: Duration,
    /// Pause after a failed segment before the next attempt
    pub restart_backoff: Duration,
    /// How often a running encoder is checked for exit
    pub supervise_tick: Duration,
}

impl CameraSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            video_dir: config.video_dir.clone(),
            segment_length: config.segment_length(),
            tools: EncoderTools::new(
                Tool::new(config.ffmpeg_path.clone()),
                Tool::new(config.libcamera_path.clone()),
            ),
            frame_refresh: config.live.frame_refresh(),
            scan_limits: config.live.scan_limits(),
            stream: StreamSettings::from(&config.live),
            ..Self::default()
        }
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            video_dir: PathBuf::from("./videos"),
            segment_length: Duration::from_secs(60),
            tools: EncoderTools::default(),
            frame_refresh: Duration::from_millis(100),
            scan_limits: FrameScanLimits::default(),
            stream: StreamSettings::default(),
            error_log_throttle: Duration::from_secs(5),
            restart_backoff: Duration::from_secs(1),
            supervise_tick: Duration::from_millis(50),
        }
    }
}

/// How a segment ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentEnd {
    Completed,
    Stopped,
}

#[derive(Debug)]
struct CameraState {
    status: RecordingStatus,
    current_segment: Option<PathBuf>,
    segments_recorded: u64,
    failed_segments: u64,
}

/// Rate limit for repeated failure logs
#[derive(Debug)]
pub(crate) struct ErrorThrottle {
    interval: Duration,
    last_logged: Option<Instant>,
    suppressed: u64,
}

impl ErrorThrottle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: None,
            suppressed: 0,
        }
    }

    /// `Some(n)` if this occurrence should be logged, where `n` is how many
    /// were swallowed since the last logged one.
    pub(crate) fn check(&mut self, now: Instant) -> Option<u64> {
        match self.last_logged {
            Some(at) if now.saturating_duration_since(at) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last_logged = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

/// Keeps the live cache in step with the newest segment
#[derive(Debug, Default)]
pub(crate) struct FrameRefresher {
    /// Newest file and its length at the last refresh
    last_seen: Option<(PathBuf, u64)>,
}

impl FrameRefresher {
    /// Push the latest frame from `dir` into `stream`. Returns whether a frame was pushed.
    pub(crate) fn refresh(&mut self, dir: &Path, stream: &StreamManager, limits: &FrameScanLimits) -> bool {
        let Some(path) = latest_segment(dir) else {
            return false;
        };
        let Ok(len) = std::fs::metadata(&path).map(|m| m.len()) else {
            return false;
        };

        let key = (path, len);
        if self.last_seen.as_ref() == Some(&key) {
            return false;
        }

        let frame = extract_frame_from(&key.0, limits);
        self.last_seen = Some(key);

        match frame {
            Some(frame) => {
                stream.update(&frame);
                true
            }
            None => false,
        }
    }
}

pub struct Camera {
    config: CameraConfig,
    dir: PathBuf,
    settings: CameraSettings,
    stream: Arc<StreamManager>,
    state: RwLock<CameraState>,
    throttle: Mutex<ErrorThrottle>,
    started: AtomicBool,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
}

impl Camera {
    pub fn new(config: CameraConfig, settings: CameraSettings) -> Result<Self> {
        config.validate()?;

        let dir = settings.video_dir.join(&config.id);
        let stream = Arc::new(StreamManager::new(config.id.clone(), settings.stream));
        let (stop_tx, stop_rx) = bounded(0);

        Ok(Self {
            throttle: Mutex::new(ErrorThrottle::new(settings.error_log_throttle)),
            config,
            dir,
            settings,
            stream,
            state: RwLock::new(CameraState {
                status: RecordingStatus::Idle,
                current_segment: None,
                segments_recorded: 0,
                failed_segments: 0,
            }),
            started: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// Directory this camera records into
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stream(&self) -> Arc<StreamManager> {
        Arc::clone(&self.stream)
    }

    pub fn recording_status(&self) -> RecordingStatus {
        self.state.read().status
    }

    pub fn status(&self) -> CameraStatus {
        let state = self.state.read();
        CameraStatus {
            id: self.config.id.clone(),
            name: self.config.display_name().to_string(),
            status: state.status,
            current_segment: state.current_segment.clone(),
            segments_recorded: state.segments_recorded,
            failed_segments: state.failed_segments,
            has_frame: self.stream.has_frame(),
            viewers: self.stream.viewer_count(),
        }
    }

    /// Record segments until `stop` is called. Blocks the calling thread.
    pub fn run(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::AlreadyStarted(self.config.id.clone()));
        }

        let result = self.capture_loop();
        self.state.write().status = RecordingStatus::Stopped;
        log::info!("[Camera] {} stopped", self.config.display_name());
        result
    }

    fn capture_loop(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let refresher = self.spawn_frame_refresh()?;

        log::info!(
            "[Camera] {} recording {}x{}@{} from {} into {}",
            self.config.display_name(),
            self.config.width,
            self.config.height,
            self.config.fps,
            self.config.device,
            self.dir.display()
        );

        while !self.stop_requested() {
            match self.record_segment() {
                Ok(SegmentEnd::Completed) => {}
                Ok(SegmentEnd::Stopped) => break,
                Err(e) => {
                    self.note_failure(&e);
                    if self.wait_or_stop(self.settings.restart_backoff) {
                        break;
                    }
                }
            }
        }

        if refresher.join().is_err() {
            log::error!("[Camera] Frame refresh thread for {} panicked", self.config.id);
        }
        Ok(())
    }

    /// Ask the capture loop to exit and kill the running encoder
    pub fn stop(&self) {
        if self.stop_tx.lock().take().is_some() {
            log::info!("[Camera] Stopping {}", self.config.display_name());
            let mut state = self.state.write();
            if state.status != RecordingStatus::Stopped {
                state.status = RecordingStatus::Stopping;
            }
        }
    }

    fn stop_requested(&self) -> bool {
        matches!(self.stop_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `duration` unless stopped first. Returns true if stopped.
    fn wait_or_stop(&self, duration: Duration) -> bool {
        select! {
            recv(self.stop_rx) -> _ => true,
            default(duration) => false,
        }
    }

    fn record_segment(&self) -> Result<SegmentEnd> {
        let path = self.dir.join(segment_file_name(&self.config.id, Utc::now()));
        let invocation = capture_invocation(&self.config, &self.settings.tools, self.settings.segment_length, &path)?;

        let mut child = invocation.spawn()?;
        self.begin_segment(&path);
        log::debug!("[Camera] {} started segment {}", self.config.id, path.display());

        let drain = child.stderr.take().and_then(|pipe| {
            spawn_stderr_tail(pipe, format!("dashcam-stderr-{}", self.config.id))
                .map_err(|e| log::warn!("[Camera] No stderr capture for {}: {}", self.config.id, e))
                .ok()
        });

        let ticker = tick(self.settings.supervise_tick);
        let status = loop {
            select! {
                recv(self.stop_rx) -> _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    self.end_segment(true);
                    return Ok(SegmentEnd::Stopped);
                }
                recv(ticker) -> _ => match child.try_wait() {
                    Ok(Some(status)) => break status,
                    Ok(None) => {}
                    Err(e) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        self.end_segment(false);
                        return Err(e.into());
                    }
                },
            }
        };

        let stderr = drain.and_then(|d| d.join().ok()).unwrap_or_default();
        self.end_segment(status.success());

        if status.success() {
            Ok(SegmentEnd::Completed)
        } else {
            Err(CaptureError::EncoderExit { status, stderr })
        }
    }

    fn begin_segment(&self, path: &Path) {
        let mut state = self.state.write();
        if state.status == RecordingStatus::Idle {
            state.status = RecordingStatus::Recording;
        }
        state.current_segment = Some(path.to_path_buf());
    }

    fn end_segment(&self, success: bool) {
        let mut state = self.state.write();
        state.current_segment = None;
        if state.status == RecordingStatus::Recording {
            state.status = RecordingStatus::Idle;
        }
        if success {
            state.segments_recorded += 1;
        } else {
            state.failed_segments += 1;
        }
    }

    fn note_failure(&self, error: &CaptureError) {
        if !matches!(error, CaptureError::EncoderExit { .. }) {
            // Spawn failures never reach end_segment
            self.state.write().failed_segments += 1;
        }

        let Some(suppressed) = self.throttle.lock().check(Instant::now()) else {
            return;
        };

        let name = self.config.display_name();
        match error {
            CaptureError::EncoderExit { stderr, .. } if !stderr.is_empty() => {
                log::error!("[Camera] {} segment failed: {} - {}", name, error, stderr)
            }
            _ => log::error!("[Camera] {} segment failed: {}", name, error),
        }
        if suppressed > 0 {
            log::warn!("[Camera] {} suppressed {} similar errors", name, suppressed);
        }
    }

    fn spawn_frame_refresh(&self) -> Result<JoinHandle<()>> {
        let dir = self.dir.clone();
        let stream = Arc::clone(&self.stream);
        let limits = self.settings.scan_limits;
        let stop_rx = self.stop_rx.clone();
        let ticker = tick(self.settings.frame_refresh);

        std::thread::Builder::new()
            .name(format!("dashcam-frames-{}", self.config.id))
            .spawn(move || {
                let mut refresher = FrameRefresher::default();
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            refresher.refresh(&dir, &stream, &limits);
                        }
                    }
                }
            })
            .map_err(|e| CaptureError::Thread(e.to_string()))
    }
}
