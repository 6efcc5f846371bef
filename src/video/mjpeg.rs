// MJPEG frame extractor
//
// The active segment is still being appended to by the encoder, so the tail
// of the file usually ends mid-frame. Reading only the last few hundred KB
// and scanning backward for a complete SOI..EOI pair gives the most recent
// whole frame without parsing the file from the start.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{is_segment_file, FrameScanLimits, EOI, SOI};

/// Newest segment file in `dir` by modification time
///
/// Ties are broken by path so the result is stable. Unreadable entries are skipped.
pub fn latest_segment(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_segment_file(&path) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else { continue };

        let candidate = (modified, path);
        if newest.as_ref().map_or(true, |current| candidate > *current) {
            newest = Some(candidate);
        }
    }

    newest.map(|(_, path)| path)
}

/// Byte range of the last complete JPEG in `buf`
///
/// Finds the final end marker, then looks back at most `max_frame_size`
/// bytes for the start marker that opens it. The range includes both markers.
pub fn last_complete_frame(buf: &[u8], max_frame_size: usize) -> Option<Range<usize>> {
    let eoi = rfind_marker(buf, EOI, 0)?;
    let end = eoi + EOI.len();

    let floor = eoi.saturating_sub(max_frame_size);
    let soi = rfind_marker(&buf[..eoi], SOI, floor)?;

    Some(soi..end)
}

/// Position of the last `marker` in `buf` at or after `floor`
fn rfind_marker(buf: &[u8], marker: [u8; 2], floor: usize) -> Option<usize> {
    if buf.len() < 2 {
        return None;
    }
    (floor..=buf.len() - 2)
        .rev()
        .find(|&i| buf[i] == marker[0] && buf[i + 1] == marker[1])
}

/// Last complete frame of the newest segment in `dir`
///
/// Returns `None` when there is no segment yet, when the file disappears or
/// shrinks between listing and reading, or when the tail holds no whole frame.
pub fn extract_latest_frame(dir: &Path, limits: &FrameScanLimits) -> Option<Vec<u8>> {
    let path = latest_segment(dir)?;
    extract_frame_from(&path, limits)
}

/// Last complete frame within the tail window of one segment file
pub fn extract_frame_from(path: &Path, limits: &FrameScanLimits) -> Option<Vec<u8>> {
    let mut tail = read_tail(path, limits.tail_window).ok()?;

    let range = last_complete_frame(&tail, limits.max_frame_size)?;
    tail.truncate(range.end);
    Some(tail.split_off(range.start))
}

/// Read at most the final `window` bytes of a file
fn read_tail(path: &Path, window: usize) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let start = len.saturating_sub(window as u64);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.take(window as u64).read_to_end(&mut buf)?;
    Ok(buf)
}
