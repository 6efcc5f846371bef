// Video file handling module
//
// Archive segments are raw MJPEG: JPEG images written back to back.
// This module finds the newest segment of a camera and pulls the last
// complete frame out of it for the live view.

pub mod mjpeg;

pub use mjpeg::{extract_frame_from, extract_latest_frame, last_complete_frame, latest_segment};

/// File extension of archive segments
pub const SEGMENT_EXTENSION: &str = "mjpeg";

/// JPEG start-of-image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Bounds for the backward frame scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameScanLimits {
    /// Bytes read from the end of the segment
    pub tail_window: usize,
    /// Furthest a start marker may lie before its end marker
    pub max_frame_size: usize,
}

impl Default for FrameScanLimits {
    fn default() -> Self {
        Self {
            tail_window: 256 * 1024,
            max_frame_size: 200 * 1024,
        }
    }
}

/// Whether a path looks like an archive segment
pub fn is_segment_file(path: &std::path::Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION)
}
