// Archive layout and file operations
//
// <video_dir>/<camera_id>/<camera_id>_<YYYY-MM-DD_HH-MM-SS-mmm>.mjpeg
//
// The directory listing is the only index of recordings. Entries whose names
// start with '.' (export output, temporary export workspaces) are never part
// of the archive.

pub mod quota;

pub use quota::{plan_evictions, EnforceReport, StorageManager, StorageSettings, StorageStats};

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;

use crate::config::{is_filesystem_safe_id, CameraConfig};
use crate::video::{is_segment_file, SEGMENT_EXTENSION};

/// Timestamp part of a segment file name
const SEGMENT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S-%3f";
const SEGMENT_TIMESTAMP_LEN: usize = "YYYY-MM-DD_HH-MM-SS-mmm".len();

/// Bytes per second for each kbps of nominal bitrate
const BITRATE_TO_BYTES_PER_SEC: f64 = 128.0;

/// Used when a file's camera is no longer configured
const FALLBACK_BITRATE_KBPS: u32 = 1024;

/// Error type for archive operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid archive path: {0}")]
    InvalidPath(String),

    #[error("Video not found: {0}")]
    NotFound(String),

    #[error("Failed to start storage thread: {0}")]
    Thread(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One segment found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub camera_id: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// A segment as reported to clients
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    pub camera_id: String,
    pub filename: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Capture start parsed from the file name
    pub started_at: Option<DateTime<Utc>>,
    /// Rough duration derived from size and the camera's nominal bitrate
    pub estimated_duration_secs: u64,
}

/// File name for a segment that starts at `start`
pub fn segment_file_name(camera_id: &str, start: DateTime<Utc>) -> String {
    format!(
        "{}_{}.{}",
        camera_id,
        start.format(SEGMENT_TIMESTAMP_FORMAT),
        SEGMENT_EXTENSION
    )
}

/// Parse the capture start from a segment file name like
/// `front_2024-03-01_14-05-09-123.mjpeg`
pub fn parse_segment_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let stem = file_name.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
    let split = stem.len().checked_sub(SEGMENT_TIMESTAMP_LEN)?;
    if !stem.is_char_boundary(split) {
        return None;
    }
    let (prefix, timestamp) = stem.split_at(split);
    if prefix.len() < 2 || !prefix.ends_with('_') {
        return None;
    }

    NaiveDateTime::parse_from_str(timestamp, SEGMENT_TIMESTAMP_FORMAT)
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// Duration estimate used by the archive listing
pub fn estimate_duration_secs(size: u64, bitrate_kbps: u32) -> u64 {
    if bitrate_kbps == 0 {
        return 0;
    }
    (size as f64 / (bitrate_kbps as f64 * BITRATE_TO_BYTES_PER_SEC)) as u64
}

/// Archive entries are directories and files that don't start with '.'
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'))
}

/// Every segment under `video_dir`, across all camera directories
///
/// Unreadable directories and entries are logged and skipped.
pub fn scan_segments(video_dir: &Path) -> Vec<SegmentFile> {
    let mut segments = Vec::new();

    let camera_dirs = match std::fs::read_dir(video_dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("[Storage] Failed to read {}: {}", video_dir.display(), e);
            }
            return segments;
        }
    };

    for entry in camera_dirs.flatten() {
        let dir = entry.path();
        if is_hidden(&dir) || !dir.is_dir() {
            continue;
        }
        let camera_id = entry.file_name().to_string_lossy().into_owned();
        scan_camera_dir(&dir, &camera_id, &mut segments);
    }

    segments
}

fn scan_camera_dir(dir: &Path, camera_id: &str, out: &mut Vec<SegmentFile>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("[Storage] Failed to read {}: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if is_hidden(&path) || !is_segment_file(&path) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) => {
                log::debug!("[Storage] Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        out.push(SegmentFile {
            path,
            camera_id: camera_id.to_string(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
}

/// Segments of every camera, newest first, with estimated durations
pub fn list_archive(video_dir: &Path, cameras: &[CameraConfig]) -> Vec<ArchiveEntry> {
    let mut segments = scan_segments(video_dir);
    segments.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));

    segments
        .into_iter()
        .filter_map(|seg| {
            let filename = seg.path.file_name()?.to_str()?.to_string();
            let bitrate = cameras
                .iter()
                .find(|c| c.id == seg.camera_id)
                .map_or(FALLBACK_BITRATE_KBPS, |c| c.bitrate_kbps);

            Some(ArchiveEntry {
                started_at: parse_segment_timestamp(&filename),
                estimated_duration_secs: estimate_duration_secs(seg.size, bitrate),
                modified: DateTime::<Utc>::from(seg.modified),
                size: seg.size,
                camera_id: seg.camera_id,
                filename,
            })
        })
        .collect()
}

/// Resolve a client-supplied camera id and file name to an archive path
///
/// Rejects anything that could escape the camera's directory.
pub fn resolve_archive_file(video_dir: &Path, camera_id: &str, filename: &str) -> Result<PathBuf> {
    if !is_filesystem_safe_id(camera_id) {
        return Err(StorageError::InvalidPath(format!("invalid camera id: {}", camera_id)));
    }

    let name = Path::new(filename);
    let mut components = name.components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none();
    if !single_normal || filename.contains(['/', '\\']) || is_hidden(name) || !is_segment_file(name) {
        return Err(StorageError::InvalidPath(format!("invalid file name: {}", filename)));
    }

    let path = video_dir.join(camera_id).join(filename);
    if !path.is_file() {
        return Err(StorageError::NotFound(filename.to_string()));
    }
    Ok(path)
}

/// Delete a single archive segment on user request
pub fn delete_archive_file(video_dir: &Path, camera_id: &str, filename: &str) -> Result<()> {
    let path = resolve_archive_file(video_dir, camera_id, filename)?;
    match std::fs::remove_file(&path) {
        Ok(()) => {
            log::info!("[Storage] Deleted {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(filename.to_string())),
        Err(e) => Err(e.into()),
    }
}
