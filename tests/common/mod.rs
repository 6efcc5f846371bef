// Shared fixtures for the integration tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use dashcam_lib::encoding::{ExportPreset, Tool};
use dashcam_lib::export::{ExportManager, ExportSettings};

/// Write a shell script into `dir` and return a Tool that runs it through /bin/sh
pub fn script_tool(dir: &Path, name: &str, body: &str) -> Tool {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    Tool::with_prefix("/bin/sh", [path.to_string_lossy().into_owned()])
}

/// Fake transcoder that copies the concat manifest into the output file
pub const COPY_MANIFEST: &str = r#"manifest=""
prev=""
for arg; do
  if [ "$prev" = "-i" ]; then manifest="$arg"; fi
  prev="$arg"
  out="$arg"
done
cat "$manifest" > "$out""#;

/// Fake transcoder that concatenates the files named in the manifest
pub const CONCAT_SEGMENTS: &str = r#"manifest=""
prev=""
for arg; do
  if [ "$prev" = "-i" ]; then manifest="$arg"; fi
  prev="$arg"
  out="$arg"
done
sed -n "s/^file '\(.*\)'$/\1/p" "$manifest" | while read -r f; do cat "$f"; done > "$out""#;

/// Fake transcoder that produces an empty output
pub const EMPTY_OUTPUT: &str = r#"for arg; do out="$arg"; done
: > "$out""#;

/// Fake transcoder that fails with a message on stderr
pub const FAILING: &str = r#"echo "concat: invalid data found" >&2
exit 1"#;

/// Fake transcoder that never finishes on its own
pub const HANGING: &str = "exec sleep 30";

/// Write a segment for `camera` with the given size and mtime
pub fn segment(video_dir: &Path, camera: &str, name: &str, size: usize, modified: SystemTime) -> PathBuf {
    let dir = video_dir.join(camera);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, vec![0xAB; size]).unwrap();
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
    path
}

pub fn export_manager(video_dir: &Path, transcoder: Tool) -> ExportManager {
    ExportManager::new(ExportSettings {
        video_dir: video_dir.to_path_buf(),
        transcoder,
        preset: ExportPreset::default(),
        progress_interval: Duration::from_millis(50),
    })
}

/// Names of `.temp_export_*` entries directly under `video_dir`
pub fn workspaces(video_dir: &Path) -> Vec<String> {
    std::fs::read_dir(video_dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.starts_with(dashcam_lib::export::TEMP_EXPORT_PREFIX))
                .collect()
        })
        .unwrap_or_default()
}

/// Poll `check` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}
