// Export job stages
//
// prepare -> scan -> copy -> manifest -> encode -> validate -> publish
//
// Every stage after `prepare` works inside a fresh workspace directory.
// A job marker records the attempt until `publish` swaps the new output and
// sidecar in. Any failure removes the workspace and the marker; a previous
// export is left as it was.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use crossbeam_channel::{select, tick, Receiver, TryRecvError};
use parking_lot::RwLock;

use super::{bytes_to_mb, settled_failure, sidecar, ExportError, ExportInfo, ExportPhase, ExportSettings, Result};
use super::{EXPORT_FILENAME, TEMP_EXPORT_PREFIX};
use crate::encoding::{export_args, spawn_stderr_tail, Invocation};
use crate::storage::quota::{remove_temp_export_dirs, sort_oldest_first};
use crate::storage::{scan_segments, SegmentFile};

const MANIFEST_FILENAME: &str = "concat_list.txt";

// How often the transcoder is checked for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything a running job shares with its manager
pub(crate) struct JobContext {
    pub settings: Arc<ExportSettings>,
    pub info: Arc<RwLock<ExportInfo>>,
    /// Finished export that was available when the job was accepted
    pub previous: Option<ExportInfo>,
    /// Disconnects when the job should be abandoned
    pub cancel: Receiver<()>,
}

impl JobContext {
    fn video_dir(&self) -> &Path {
        &self.settings.video_dir
    }

    fn update(&self, f: impl FnOnce(&mut ExportInfo)) {
        f(&mut self.info.write());
    }

    fn cancelled(&self) -> bool {
        matches!(self.cancel.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(crate) fn settle_failure(&self, message: impl Into<String>, phase: ExportPhase) {
        let settled = settled_failure(&self.info.read(), self.previous.as_ref(), self.video_dir(), message, phase);
        *self.info.write() = settled;
    }
}

/// Run an export to completion and record its outcome
pub(crate) fn run_job(ctx: &JobContext, start: DateTime<Utc>, end: DateTime<Utc>) {
    let started = Instant::now();
    let result = run_stages(ctx, start, end);

    // The workspace never outlives the job
    remove_temp_export_dirs(ctx.video_dir());

    match result {
        Ok(info) => {
            log::info!(
                "[Export] Export ready: {:.2} MB from {} segments in {:.1}s",
                bytes_to_mb(info.size),
                info.processed_files,
                started.elapsed().as_secs_f64()
            );
            *ctx.info.write() = info;
        }
        Err(ExportError::Cancelled) => {
            // Leave the job marker for startup recovery
            log::warn!("[Export] Export abandoned");
            ctx.settle_failure("Export cancelled", ExportPhase::Interrupted);
        }
        Err(e) => {
            match &e {
                ExportError::EncoderFailed { stderr } if !stderr.is_empty() => {
                    log::error!("[Export] {} - ffmpeg output: {}", e, stderr)
                }
                _ => log::error!("[Export] {}", e),
            }
            if matches!(e, ExportError::Publish(_)) {
                // The swap may have stopped halfway
                sidecar::remove_artifacts(ctx.video_dir());
            } else {
                sidecar::remove_job_marker(ctx.video_dir());
            }
            ctx.settle_failure(e.to_string(), ExportPhase::Failed);
        }
    }
}

fn run_stages(ctx: &JobContext, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<ExportInfo> {
    prepare(ctx)?;

    let files = collect_segments(ctx.video_dir(), start, end);
    if files.is_empty() {
        return Err(ExportError::NoVideos);
    }
    log::info!("[Export] Found {} segments in range", files.len());
    ctx.update(|info| {
        info.total_segments = files.len();
        info.progress = format!("Found {} video segments, preparing to copy...", files.len());
        info.phase = ExportPhase::Copying;
    });

    let workspace = create_workspace(ctx.video_dir())?;
    let copies = copy_segments(ctx, &workspace, &files)?;

    let manifest = workspace.join(MANIFEST_FILENAME);
    std::fs::write(&manifest, concat_manifest(&copies)).map_err(ExportError::Manifest)?;

    let output = workspace.join(EXPORT_FILENAME);
    encode(ctx, &manifest, &output, copies.len())?;

    let size = validate_output(&output)?;
    publish(ctx, &output, start, end, size, copies.len())
}

/// Clear stale workspaces, then record that a job is running
fn prepare(ctx: &JobContext) -> Result<()> {
    let swept = remove_temp_export_dirs(ctx.video_dir());
    if swept > 0 {
        log::info!("[Export] Cleaned up {} stale workspace(s) before starting", swept);
    }

    let info = ctx.info.read().clone();
    sidecar::write_atomic(&sidecar::job_marker_path(ctx.video_dir()), &info).map_err(ExportError::Publish)
}

/// Archive segments modified within `[start, end]`, oldest first
pub fn collect_segments(video_dir: &Path, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<SegmentFile> {
    let start = SystemTime::from(start);
    let end = SystemTime::from(end);

    let mut files: Vec<SegmentFile> = scan_segments(video_dir)
        .into_iter()
        .filter(|f| f.modified >= start && f.modified <= end)
        .collect();
    sort_oldest_first(&mut files);
    files
}

fn create_workspace(video_dir: &Path) -> Result<PathBuf> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let name = format!(
        "{}{}_{}",
        TEMP_EXPORT_PREFIX,
        Utc::now().format("%Y%m%d_%H%M%S"),
        &id[..8]
    );
    let workspace = video_dir.join(name);
    std::fs::create_dir_all(&workspace).map_err(ExportError::Workspace)?;
    Ok(workspace)
}

/// Copy segments into the workspace as `segment_NNN.mjpeg`
///
/// Sources that vanished since the scan are skipped. A failure writing a copy aborts.
fn copy_segments(ctx: &JobContext, workspace: &Path, files: &[SegmentFile]) -> Result<Vec<PathBuf>> {
    let total = files.len();
    let mut copies = Vec::with_capacity(total);

    for (i, file) in files.iter().enumerate() {
        if ctx.cancelled() {
            return Err(ExportError::Cancelled);
        }
        ctx.update(|info| {
            info.progress = format!("Copying files... {}/{}", i, total);
            info.processed_files = i;
        });

        let mut src = match File::open(&file.path) {
            Ok(src) => src,
            Err(e) => {
                log::warn!("[Export] Could not open {}: {}", file.path.display(), e);
                continue;
            }
        };

        let dest = workspace.join(format!("segment_{:03}.mjpeg", i));
        let mut dst = File::create(&dest).map_err(ExportError::Copy)?;
        std::io::copy(&mut src, &mut dst).map_err(ExportError::Copy)?;
        copies.push(dest);
    }

    if copies.is_empty() {
        return Err(ExportError::NothingCopied);
    }

    log::info!("[Export] Copied {}/{} segments", copies.len(), total);
    ctx.update(|info| {
        info.progress = format!("Copied {} files, preparing to encode...", copies.len());
        info.processed_files = copies.len();
    });
    Ok(copies)
}

/// ffmpeg concat demuxer input listing `files` in order
pub fn concat_manifest(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|path| {
            let escaped = path.to_string_lossy().replace('\'', r"'\''");
            format!("file '{}'\n", escaped)
        })
        .collect()
}

fn encode(ctx: &JobContext, manifest: &Path, output: &Path, segments: usize) -> Result<()> {
    let settings = &ctx.settings;
    let invocation = Invocation {
        tool: settings.transcoder.clone(),
        args: export_args(&settings.preset, manifest, output),
    };

    log::info!(
        "[Export] Encoding {} segments at {} fps with {}",
        segments,
        settings.preset.fps,
        invocation.tool.display_name()
    );
    ctx.update(|info| {
        info.progress = "Encoding video with FFmpeg...".into();
        info.phase = ExportPhase::Encoding;
    });

    let mut child = invocation.spawn().map_err(ExportError::EncoderStart)?;
    let stderr = match child.stderr.take() {
        Some(pipe) => spawn_stderr_tail(pipe, "dashcam-export-stderr".into()).ok(),
        None => None,
    };

    let poll = tick(EXIT_POLL_INTERVAL);
    let progress = tick(settings.progress_interval);
    let mut last_size: u64 = 0;

    let status = loop {
        select! {
            recv(ctx.cancel) -> _ => {
                log::warn!("[Export] Stopping ffmpeg");
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExportError::Cancelled);
            }
            recv(poll) -> _ => {
                match child.try_wait() {
                    Ok(Some(status)) => break status,
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("[Export] Failed to poll ffmpeg: {}", e);
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ExportError::EncoderFailed { stderr: String::new() });
                    }
                }
            }
            recv(progress) -> _ => {
                if let Ok(meta) = std::fs::metadata(output) {
                    let size = meta.len();
                    let size_mb = bytes_to_mb(size);
                    let speed = bytes_to_mb(size.saturating_sub(last_size)) / settings.progress_interval.as_secs_f64();
                    last_size = size;
                    log::info!("[Export] Encoding progress: {:.1} MB ({:.1} MB/s)", size_mb, speed);
                    ctx.update(|info| {
                        info.progress = format!("Encoding... {:.1} MB ({:.1} MB/s)", size_mb, speed);
                        info.current_size_mb = size_mb;
                    });
                }
            }
        }
    };

    let stderr = stderr.and_then(|drain| drain.join().ok()).unwrap_or_default();
    if !status.success() {
        return Err(ExportError::EncoderFailed { stderr });
    }
    log::info!("[Export] ffmpeg finished");
    Ok(())
}

fn validate_output(output: &Path) -> Result<u64> {
    let meta = std::fs::metadata(output).map_err(|_| ExportError::OutputMissing)?;
    if meta.len() == 0 {
        return Err(ExportError::OutputEmpty);
    }
    Ok(meta.len())
}

/// Replace the previous export with the new output, then record it as complete
///
/// The old sidecar goes first, so a crash mid-swap leaves an output without a
/// record, which recovery discards.
fn publish(
    ctx: &JobContext,
    output: &Path,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    size: u64,
    copied: usize,
) -> Result<ExportInfo> {
    let video_dir = ctx.video_dir();
    std::fs::create_dir_all(sidecar::export_dir(video_dir)).map_err(ExportError::Publish)?;
    match std::fs::remove_file(sidecar::sidecar_path(video_dir)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ExportError::Publish(e)),
    }
    std::fs::rename(output, sidecar::output_path(video_dir)).map_err(ExportError::Publish)?;

    let total_segments = ctx.info.read().total_segments;
    let info = ExportInfo {
        filename: EXPORT_FILENAME.into(),
        start_time: Some(start),
        end_time: Some(end),
        size,
        available: true,
        in_progress: false,
        progress: "Complete".into(),
        current_size_mb: bytes_to_mb(size),
        total_segments,
        processed_files: copied,
        phase: ExportPhase::Complete,
    };

    sidecar::write_atomic(&sidecar::sidecar_path(video_dir), &info).map_err(ExportError::Publish)?;
    sidecar::remove_job_marker(video_dir);
    Ok(info)
}
