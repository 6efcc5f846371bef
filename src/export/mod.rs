//! On-demand export of an archive time range
//!
//! An export copies every segment whose modification time falls inside the
//! requested range into a private workspace, then has ffmpeg concatenate the
//! copies into a single MP4. Working on copies means the quota enforcer can
//! keep deleting archive files while an export runs.
//!
//! Only one export exists at a time. Its state lives in `ExportInfo`. A
//! finished export is recorded in a JSON sidecar, and a running attempt in a
//! separate job marker, so a restart can tell a finished export from one that
//! was cut short without losing the former.

pub mod pipeline;
pub mod sidecar;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::encoding::{EncoderError, ExportPreset, Tool};
use crate::storage::quota::remove_temp_export_dirs;
use pipeline::JobContext;

/// Name prefix of export workspaces under the archive root
pub const TEMP_EXPORT_PREFIX: &str = ".temp_export_";

pub const EXPORT_DIR_NAME: &str = ".export";
pub const EXPORT_FILENAME: &str = "export.mp4";
pub const SIDECAR_FILENAME: &str = "export_info.json";
/// Present only while an export attempt runs
pub const JOB_MARKER_FILENAME: &str = "export_job.json";

/// Error type for export operations
///
/// Display strings of job failures are shown to users as the export progress.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Invalid range: start is after end")]
    InvalidRange,

    #[error("An export is already in progress")]
    AlreadyRunning,

    #[error("No videos found in the specified date range")]
    NoVideos,

    #[error("Error: Failed to create temporary directory")]
    Workspace(#[source] std::io::Error),

    #[error("Error: Failed to copy video segments")]
    Copy(#[source] std::io::Error),

    #[error("Error: No videos could be copied (files may have been deleted)")]
    NothingCopied,

    #[error("Error: Failed to write concat manifest")]
    Manifest(#[source] std::io::Error),

    #[error("Error: Failed to start FFmpeg encoding")]
    EncoderStart(#[source] EncoderError),

    #[error("Error: FFmpeg encoding failed")]
    EncoderFailed { stderr: String },

    #[error("Error: Output file not found")]
    OutputMissing,

    #[error("Error: Output file is empty")]
    OutputEmpty,

    #[error("Error: Failed to save export")]
    Publish(#[source] std::io::Error),

    #[error("Export cancelled")]
    Cancelled,

    #[error("Failed to start export thread: {0}")]
    Thread(String),
}

pub type Result<T> = std::result::Result<T, ExportError>;

/// Stage of the current export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportPhase {
    /// No export exists
    #[default]
    Idle,
    Scanning,
    Copying,
    Encoding,
    Complete,
    Failed,
    /// A previous run was cut short by a crash or shutdown
    Interrupted,
}

impl ExportPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, ExportPhase::Scanning | ExportPhase::Copying | ExportPhase::Encoding)
    }
}

/// State of the single process-wide export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportInfo {
    pub filename: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub size: u64,
    pub available: bool,
    pub in_progress: bool,
    pub progress: String,
    pub current_size_mb: f64,
    pub total_segments: usize,
    pub processed_files: usize,
    pub phase: ExportPhase,
}

impl ExportInfo {
    /// State right after a request is accepted
    pub fn started(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(start),
            end_time: Some(end),
            in_progress: true,
            progress: "Scanning for video files...".into(),
            phase: ExportPhase::Scanning,
            ..Default::default()
        }
    }

    /// Terminal failure; keeps the requested range for context
    pub fn failed(&self, message: impl Into<String>) -> Self {
        Self {
            start_time: self.start_time,
            end_time: self.end_time,
            progress: message.into(),
            phase: ExportPhase::Failed,
            ..Default::default()
        }
    }
}

/// Export settings
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub video_dir: PathBuf,
    pub transcoder: Tool,
    pub preset: ExportPreset,
    pub progress_interval: Duration,
}

impl ExportSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            video_dir: config.video_dir.clone(),
            transcoder: Tool::new(config.ffmpeg_path.clone()),
            preset: ExportPreset {
                fps: config.export_fps(),
                quality: config.export.quality,
            },
            progress_interval: Duration::from_secs(config.export.progress_interval_secs.max(1)),
        }
    }
}

/// What startup recovery found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No export on disk
    Nothing,
    /// A finished export was adopted
    Adopted,
    /// An unfinished attempt was cleaned up
    Interrupted,
    /// Inconsistent leftovers were deleted
    Discarded,
}

struct RunningJob {
    thread: JoinHandle<()>,
    /// Dropped to cancel the job
    cancel: Sender<()>,
}

pub struct ExportManager {
    settings: Arc<ExportSettings>,
    info: Arc<RwLock<ExportInfo>>,
    running: Arc<AtomicBool>,
    job: Mutex<Option<RunningJob>>,
}

impl ExportManager {
    pub fn new(settings: ExportSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            info: Arc::new(RwLock::new(ExportInfo::default())),
            running: Arc::new(AtomicBool::new(false)),
            job: Mutex::new(None),
        }
    }

    pub fn video_dir(&self) -> &Path {
        &self.settings.video_dir
    }

    /// Start exporting `[start, end]` in the background
    pub fn request_export(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
        if start > end {
            return Err(ExportError::InvalidRange);
        }

        let mut job = self.job.lock();
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ExportError::AlreadyRunning);
        }

        // The previous job has already published its result
        if let Some(previous) = job.take() {
            let _ = previous.thread.join();
        }

        // A finished export stays in place until this attempt publishes
        let previous = {
            let info = self.info.read();
            info.available.then(|| info.clone())
        };

        log::info!("[Export] Starting export from {} to {}", start.to_rfc3339(), end.to_rfc3339());
        *self.info.write() = ExportInfo::started(start, end);

        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let ctx = JobContext {
            settings: Arc::clone(&self.settings),
            info: Arc::clone(&self.info),
            previous: previous.clone(),
            cancel: cancel_rx,
        };
        let running = Arc::clone(&self.running);

        let spawned = std::thread::Builder::new()
            .name("dashcam-export".into())
            .spawn(move || {
                let guard = JobGuard {
                    ctx: &ctx,
                    running,
                    armed: true,
                };
                pipeline::run_job(&ctx, start, end);
                guard.disarm();
            });

        match spawned {
            Ok(thread) => {
                *job = Some(RunningJob {
                    thread,
                    cancel: cancel_tx,
                });
                Ok(())
            }
            Err(e) => {
                let failed = settled_failure(
                    &self.info.read(),
                    previous.as_ref(),
                    &self.settings.video_dir,
                    "Error: Export generation failed unexpectedly",
                    ExportPhase::Failed,
                );
                *self.info.write() = failed;
                self.running.store(false, Ordering::SeqCst);
                Err(ExportError::Thread(e.to_string()))
            }
        }
    }

    /// Snapshot of the current export state
    pub fn status(&self) -> ExportInfo {
        self.info.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Path of the finished export, if one is available
    pub fn download_path(&self) -> Option<PathBuf> {
        if !self.info.read().available {
            return None;
        }
        let path = sidecar::output_path(&self.settings.video_dir);
        path.is_file().then_some(path)
    }

    /// Delete the finished export and any leftover job marker
    pub fn delete_export(&self) -> Result<()> {
        let _job = self.job.lock();
        if self.is_running() {
            return Err(ExportError::AlreadyRunning);
        }

        sidecar::remove_artifacts(&self.settings.video_dir);
        *self.info.write() = ExportInfo::default();
        log::info!("[Export] Export deleted");
        Ok(())
    }

    /// Block until the current job, if any, has finished
    pub fn wait(&self) {
        let job = self.job.lock().take();
        // Keep the cancel sender alive until the job is done
        if let Some(RunningJob { thread, cancel: _cancel }) = job {
            if thread.join().is_err() {
                log::error!("[Export] Export thread panicked");
            }
        }
    }

    /// Abandon a running export
    ///
    /// The transcoder is killed and the workspace removed, but the job marker
    /// stays so the next `recover` handles it like a crash.
    pub fn shutdown(&self) {
        let job = self.job.lock().take();
        if let Some(RunningJob { thread, cancel }) = job {
            drop(cancel);
            if thread.join().is_err() {
                log::error!("[Export] Export thread panicked");
            }
        }
    }

    /// Reconcile on-disk export state at startup
    pub fn recover(&self) -> RecoveryOutcome {
        let _job = self.job.lock();
        if self.is_running() {
            return RecoveryOutcome::Nothing;
        }

        let video_dir = &self.settings.video_dir;
        let swept = remove_temp_export_dirs(video_dir);
        if swept > 0 {
            log::info!("[Export] Cleaned up {} temporary export workspace(s)", swept);
        }

        let output = sidecar::output_path(video_dir);
        let sidecar_file = sidecar::sidecar_path(video_dir);

        let interrupted = sidecar::job_marker_path(video_dir).exists();
        if interrupted {
            log::info!("[Export] Found interrupted export, cleaning up");
            sidecar::remove_job_marker(video_dir);
        }

        let (mut outcome, mut info) = match sidecar::read(&sidecar_file) {
            Ok(Some(saved)) if saved.in_progress => {
                log::warn!("[Export] Export record still marked in progress, discarding");
                sidecar::remove_artifacts(video_dir);
                (RecoveryOutcome::Interrupted, interrupted_info())
            }
            Ok(Some(saved)) => match std::fs::metadata(&output) {
                Ok(meta) if meta.is_file() && meta.len() > 0 && meta.len() == saved.size => {
                    let info = ExportInfo {
                        filename: EXPORT_FILENAME.into(),
                        size: meta.len(),
                        current_size_mb: bytes_to_mb(meta.len()),
                        available: true,
                        in_progress: false,
                        progress: "Complete".into(),
                        phase: ExportPhase::Complete,
                        ..saved
                    };
                    log::info!(
                        "[Export] Found existing export: {:.2} MB",
                        bytes_to_mb(meta.len())
                    );
                    (RecoveryOutcome::Adopted, info)
                }
                _ => {
                    log::warn!("[Export] Export record without usable output, discarding");
                    sidecar::remove_artifacts(video_dir);
                    (RecoveryOutcome::Discarded, ExportInfo::default())
                }
            },
            Ok(None) if output.exists() => {
                log::warn!("[Export] Export output without a record, discarding");
                sidecar::remove_artifacts(video_dir);
                (RecoveryOutcome::Discarded, ExportInfo::default())
            }
            Ok(None) => (RecoveryOutcome::Nothing, ExportInfo::default()),
            Err(e) => {
                log::warn!("[Export] Unreadable export record ({}), discarding", e);
                sidecar::remove_artifacts(video_dir);
                (RecoveryOutcome::Discarded, ExportInfo::default())
            }
        };

        // An interrupted attempt never touched a finished export
        if interrupted {
            if !info.available {
                info = interrupted_info();
            }
            outcome = RecoveryOutcome::Interrupted;
        }

        *self.info.write() = info;
        outcome
    }
}

impl Drop for ExportManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn interrupted_info() -> ExportInfo {
    ExportInfo {
        progress: "Previous export was interrupted".into(),
        phase: ExportPhase::Interrupted,
        ..Default::default()
    }
}

/// Terminal state of an attempt that did not publish
///
/// A prior export whose output is still on disk stays available, with the
/// failure as its progress message.
pub(crate) fn settled_failure(
    current: &ExportInfo,
    previous: Option<&ExportInfo>,
    video_dir: &Path,
    message: impl Into<String>,
    phase: ExportPhase,
) -> ExportInfo {
    match previous {
        Some(prev) if sidecar::output_path(video_dir).is_file() => ExportInfo {
            progress: message.into(),
            phase,
            in_progress: false,
            ..prev.clone()
        },
        _ => ExportInfo {
            phase,
            ..current.failed(message)
        },
    }
}

/// Marks the job finished on every exit path. If the job panicked the
/// state becomes failed, the workspace and job marker are removed, and a
/// prior export is kept.
struct JobGuard<'a> {
    ctx: &'a JobContext,
    running: Arc<AtomicBool>,
    armed: bool,
}

impl JobGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::error!("[Export] Export generation panicked");
            remove_temp_export_dirs(&self.ctx.settings.video_dir);
            sidecar::remove_job_marker(&self.ctx.settings.video_dir);
            self.ctx.settle_failure("Error: Export generation failed unexpectedly", ExportPhase::Failed);
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn manager(dir: &Path) -> ExportManager {
        ExportManager::new(ExportSettings {
            video_dir: dir.to_path_buf(),
            transcoder: Tool::new("/nonexistent/ffmpeg"),
            preset: ExportPreset::default(),
            progress_interval: Duration::from_millis(50),
        })
    }

    #[test]
    fn inverted_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exports = manager(dir.path());
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        assert!(matches!(exports.request_export(start, end), Err(ExportError::InvalidRange)));
        assert!(!exports.status().in_progress);
    }

    #[test]
    fn empty_range_reports_no_videos() {
        let dir = tempfile::tempdir().unwrap();
        let exports = manager(dir.path());
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        exports.request_export(start, start).unwrap();
        exports.wait();

        let status = exports.status();
        assert!(!status.in_progress);
        assert!(!status.available);
        assert_eq!(status.progress, "No videos found in the specified date range");
        assert_eq!(status.phase, ExportPhase::Failed);
        assert!(!sidecar::sidecar_path(dir.path()).exists());
        assert!(!sidecar::job_marker_path(dir.path()).exists());
        assert!(exports.download_path().is_none());
    }

    #[test]
    fn recover_with_nothing_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let exports = manager(dir.path());
        assert_eq!(exports.recover(), RecoveryOutcome::Nothing);
        assert_eq!(exports.status().phase, ExportPhase::Idle);
    }

    #[test]
    fn failure_message_keeps_range() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let info = ExportInfo::started(start, start).failed(ExportError::OutputEmpty.to_string());
        assert_eq!(info.progress, "Error: Output file is empty");
        assert_eq!(info.start_time, Some(start));
        assert!(!info.in_progress);
        assert!(!info.available);
    }

    fn finished_export(dir: &Path, start: DateTime<Utc>) -> ExportInfo {
        std::fs::create_dir_all(sidecar::export_dir(dir)).unwrap();
        std::fs::write(sidecar::output_path(dir), b"ftyp").unwrap();
        let info = ExportInfo {
            filename: EXPORT_FILENAME.into(),
            start_time: Some(start),
            end_time: Some(start),
            size: 4,
            available: true,
            progress: "Complete".into(),
            phase: ExportPhase::Complete,
            ..Default::default()
        };
        sidecar::write_atomic(&sidecar::sidecar_path(dir), &info).unwrap();
        info
    }

    fn panicked_job(exports: &ExportManager, previous: Option<ExportInfo>, start: DateTime<Utc>) {
        let (_cancel_tx, cancel_rx) = bounded(0);
        let ctx = JobContext {
            settings: Arc::clone(&exports.settings),
            info: Arc::clone(&exports.info),
            previous,
            cancel: cancel_rx,
        };
        *exports.info.write() = ExportInfo::started(start, start);
        exports.running.store(true, Ordering::SeqCst);

        drop(JobGuard {
            ctx: &ctx,
            running: Arc::clone(&exports.running),
            armed: true,
        });
    }

    #[test]
    fn panicked_job_fails_and_keeps_previous_export() {
        let dir = tempfile::tempdir().unwrap();
        let video_dir = dir.path();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let previous = finished_export(video_dir, start);

        sidecar::write_atomic(&sidecar::job_marker_path(video_dir), &ExportInfo::started(start, start)).unwrap();
        let workspace = video_dir.join(format!("{}20240101_000000_abcdef12", TEMP_EXPORT_PREFIX));
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join(EXPORT_FILENAME), b"partial").unwrap();

        let exports = manager(video_dir);
        panicked_job(&exports, Some(previous), Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());

        let status = exports.status();
        assert_eq!(status.progress, "Error: Export generation failed unexpectedly");
        assert_eq!(status.phase, ExportPhase::Failed);
        assert!(!status.in_progress);
        assert!(status.available);
        assert_eq!(status.start_time, Some(start));
        assert_eq!(status.size, 4);
        assert!(!exports.is_running());

        assert!(!workspace.exists());
        assert!(!sidecar::job_marker_path(video_dir).exists());
        assert!(sidecar::sidecar_path(video_dir).is_file());
        assert_eq!(exports.download_path(), Some(sidecar::output_path(video_dir)));
    }

    #[test]
    fn panicked_first_job_leaves_nothing_available() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        sidecar::write_atomic(&sidecar::job_marker_path(dir.path()), &ExportInfo::started(start, start)).unwrap();

        let exports = manager(dir.path());
        panicked_job(&exports, None, start);

        let status = exports.status();
        assert_eq!(status.progress, "Error: Export generation failed unexpectedly");
        assert_eq!(status.phase, ExportPhase::Failed);
        assert!(!status.available);
        assert_eq!(status.start_time, Some(start));
        assert!(!exports.is_running());
        assert!(!sidecar::job_marker_path(dir.path()).exists());
        assert!(exports.download_path().is_none());
    }

    #[test]
    fn failure_after_previous_output_vanished_is_plain_failure() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let previous = finished_export(dir.path(), start);
        std::fs::remove_file(sidecar::output_path(dir.path())).unwrap();

        let current = ExportInfo::started(start, start);
        let settled = settled_failure(&current, Some(&previous), dir.path(), "Export cancelled", ExportPhase::Interrupted);
        assert!(!settled.available);
        assert_eq!(settled.phase, ExportPhase::Interrupted);
        assert_eq!(settled.progress, "Export cancelled");
    }

    #[test]
    fn info_serializes_with_snake_case_fields() {
        let json = serde_json::to_value(ExportInfo::default()).unwrap();
        for key in ["filename", "start_time", "in_progress", "current_size_mb", "total_segments", "processed_files"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["phase"], "idle");
    }
}
