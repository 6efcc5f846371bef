// Recording modules

pub mod camera;
pub mod manager;
pub mod stream;

pub use camera::{Camera, CameraSettings, CaptureError};
pub use manager::CameraManager;
pub use stream::{SingleFrame, StreamEnd, StreamError, StreamManager, StreamSettings};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current state of a camera's capture loop
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    /// Between segments, or not started yet
    Idle,
    /// An encoder is writing a segment
    Recording,
    /// Stop requested, encoder being torn down
    Stopping,
    /// Capture loop has exited
    Stopped,
}

/// Snapshot of one camera for status queries
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub id: String,
    pub name: String,
    pub status: RecordingStatus,
    pub current_segment: Option<PathBuf>,
    pub segments_recorded: u64,
    pub failed_segments: u64,
    pub has_frame: bool,
    pub viewers: usize,
}

impl CameraStatus {
    pub fn is_recording(&self) -> bool {
        self.status == RecordingStatus::Recording
    }
}
