//! Capture encoder invocations
//!
//! Builds the command line that records one time-boxed MJPEG segment for a
//! camera. Two backends are supported:
//! - ffmpeg reading MJPEG from a V4L2 device (USB cameras)
//! - rpicam-vid (CSI cameras on a Raspberry Pi)
//!
//! Both write a plain concatenation of JPEG frames, so every prefix of the
//! file that ends on an end-of-image marker is a valid recording.

use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStderr};
use std::thread::JoinHandle;
use std::time::Duration;

use super::presets::{capture_filters, rotation_filter};
use super::{EncoderError, Result, Tool};
use crate::config::{CameraConfig, CaptureBackend};

/// Programs used to capture segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderTools {
    pub ffmpeg: Tool,
    pub libcamera: Tool,
}

impl EncoderTools {
    pub fn new(ffmpeg: Tool, libcamera: Tool) -> Self {
        Self { ffmpeg, libcamera }
    }

    /// The program a camera's backend uses
    pub fn for_backend(&self, backend: CaptureBackend) -> &Tool {
        match backend {
            CaptureBackend::Ffmpeg => &self.ffmpeg,
            CaptureBackend::Libcamera => &self.libcamera,
        }
    }
}

impl Default for EncoderTools {
    fn default() -> Self {
        Self {
            ffmpeg: Tool::new("ffmpeg"),
            libcamera: Tool::new("rpicam-vid"),
        }
    }
}

/// A fully resolved external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: Tool,
    pub args: Vec<String>,
}

impl Invocation {
    /// Start the process with stderr piped for diagnostics
    pub fn spawn(&self) -> Result<Child> {
        self.tool
            .command(&self.args)
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: self.tool.display_name(),
                source,
            })
    }
}

/// Diagnostics kept from an encoder's stderr
pub const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Drain a child's stderr on its own thread, keeping only the last
/// `STDERR_TAIL_BYTES`. The handle yields the tail once the pipe closes.
pub fn spawn_stderr_tail(mut stderr: ChildStderr, thread_name: String) -> std::io::Result<JoinHandle<String>> {
    std::thread::Builder::new().name(thread_name).spawn(move || {
        let mut tail: Vec<u8> = Vec::with_capacity(STDERR_TAIL_BYTES);
        let mut buf = [0u8; 1024];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let excess = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..excess);
                    }
                }
            }
        }
        String::from_utf8_lossy(&tail).trim().to_string()
    })
}

/// Build the command that records one segment of `segment_length` into `output`
pub fn capture_invocation(
    camera: &CameraConfig,
    tools: &EncoderTools,
    segment_length: Duration,
    output: &Path,
) -> Result<Invocation> {
    let args = match camera.backend {
        CaptureBackend::Ffmpeg => ffmpeg_capture_args(camera, segment_length, output)?,
        CaptureBackend::Libcamera => libcamera_capture_args(camera, segment_length, output)?,
    };

    Ok(Invocation {
        tool: tools.for_backend(camera.backend).clone(),
        args,
    })
}

fn ffmpeg_capture_args(camera: &CameraConfig, segment_length: Duration, output: &Path) -> Result<Vec<String>> {
    let fps = camera.fps.to_string();

    let mut args: Vec<String> = vec![
        "-y".into(),
        "-loglevel".into(),
        "warning".into(),
        "-f".into(),
        "v4l2".into(),
        "-input_format".into(),
        "mjpeg".into(),
        "-video_size".into(),
        format!("{}x{}", camera.width, camera.height),
        "-framerate".into(),
        fps.clone(),
        // Small buffers keep latency to the live view low
        "-rtbufsize".into(),
        "5M".into(),
        "-thread_queue_size".into(),
        "16".into(),
        "-i".into(),
        camera.device.clone(),
    ];

    if let Some(filters) = capture_filters(camera.rotation, camera.embed_timestamp)? {
        args.push("-vf".into());
        args.push(filters);
    }

    args.extend([
        "-c:v".into(),
        "mjpeg".into(),
        "-q:v".into(),
        camera.mjpeg_quality.to_string(),
        "-r".into(),
        fps,
        "-t".into(),
        segment_length.as_secs().to_string(),
        "-f".into(),
        "mjpeg".into(),
        output.to_string_lossy().into_owned(),
    ]);

    Ok(args)
}

fn libcamera_capture_args(camera: &CameraConfig, segment_length: Duration, output: &Path) -> Result<Vec<String>> {
    // rpicam-vid rotates in the ISP; still reject values it can't do
    rotation_filter(camera.rotation)?;

    let mut args: Vec<String> = vec![
        "-t".into(),
        segment_length.as_millis().to_string(),
        "--width".into(),
        camera.width.to_string(),
        "--height".into(),
        camera.height.to_string(),
        "--framerate".into(),
        camera.fps.to_string(),
        "--inline".into(),
        "--codec".into(),
        "mjpeg".into(),
        "-o".into(),
        output.to_string_lossy().into_owned(),
    ];

    if camera.rotation != 0 {
        args.push("--rotation".into());
        args.push(camera.rotation.to_string());
    }

    Ok(args)
}
