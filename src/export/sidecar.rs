// Export state persisted next to the output
//
// <video_dir>/.export/export.mp4        finished output
// <video_dir>/.export/export_info.json  ExportInfo of the finished export
// <video_dir>/.export/export_job.json   ExportInfo of a running attempt
//
// The sidecar describes the finished export and is only replaced when a new
// one is published. The job marker exists from the start of an attempt until
// it publishes or fails; finding one at startup means the process died
// mid-export. Both are written through a temp file and a rename so a power
// cut never leaves half a JSON document behind.

use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{ExportInfo, EXPORT_DIR_NAME, EXPORT_FILENAME, JOB_MARKER_FILENAME, SIDECAR_FILENAME};

pub fn export_dir(video_dir: &Path) -> PathBuf {
    video_dir.join(EXPORT_DIR_NAME)
}

pub fn output_path(video_dir: &Path) -> PathBuf {
    export_dir(video_dir).join(EXPORT_FILENAME)
}

pub fn sidecar_path(video_dir: &Path) -> PathBuf {
    export_dir(video_dir).join(SIDECAR_FILENAME)
}

pub fn job_marker_path(video_dir: &Path) -> PathBuf {
    export_dir(video_dir).join(JOB_MARKER_FILENAME)
}

/// Read the sidecar. `Ok(None)` when there is none; an error when it can't
/// be read or parsed.
pub fn read(path: &Path) -> std::io::Result<Option<ExportInfo>> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    serde_json::from_slice(&contents)
        .map(Some)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
}

/// Replace the sidecar atomically
pub fn write_atomic(path: &Path, info: &ExportInfo) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let data = serde_json::to_vec_pretty(info).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Remove a file, treating "already gone" as success
pub fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Remove the job marker of a finished or abandoned attempt
pub fn remove_job_marker(video_dir: &Path) {
    let marker = job_marker_path(video_dir);
    remove_logged(&[marker.clone(), marker.with_extension("json.tmp")]);
}

/// Remove the published output, its sidecar and any job marker
pub fn remove_artifacts(video_dir: &Path) {
    let sidecar = sidecar_path(video_dir);
    remove_logged(&[output_path(video_dir), sidecar.with_extension("json.tmp"), sidecar]);
    remove_job_marker(video_dir);
}

fn remove_logged(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = remove_if_exists(path) {
            log::warn!("[Export] Failed to remove {}: {}", path.display(), e);
        }
    }
}
