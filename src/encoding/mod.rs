// External encoder and transcoder invocations
//
// Capture and export never link a codec library. They drive external programs:
// - ffmpeg reading a V4L2 device and writing an MJPEG segment
// - rpicam-vid writing an MJPEG segment from a CSI camera
// - ffmpeg concatenating copied segments into one MP4
//
// Program locations are configurable through `Tool`, which also lets tests
// substitute shell scripts for the real binaries.

pub mod encoder;
pub mod presets;

pub use encoder::{capture_invocation, spawn_stderr_tail, EncoderTools, Invocation, STDERR_TAIL_BYTES};
pub use presets::{export_args, rotation_filter, ExportPreset, TIMESTAMP_OVERLAY};

use std::ffi::OsStr;
use std::process::{Command, Stdio};

/// Error type for encoder operations
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported rotation: {0}")]
    UnsupportedRotation(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EncoderError>;

/// An external program plus arguments that always precede the per-call ones
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    pub program: String,
    pub prefix_args: Vec<String>,
}

impl Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    /// Run a script through an interpreter, e.g. `Tool::with_prefix("/bin/sh", ["fake.sh"])`
    pub fn with_prefix<I, S>(program: impl Into<String>, prefix_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            prefix_args: prefix_args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a command with null stdin/stdout and piped stderr
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    /// Short name for log lines
    pub fn display_name(&self) -> String {
        match self.prefix_args.last() {
            Some(script) => format!("{} {}", self.program, script),
            None => self.program.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_args_come_first() {
        let tool = Tool::with_prefix("/bin/sh", ["fake.sh"]);
        let cmd = tool.command(["-y", "out.mjpeg"]);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "/bin/sh");
        assert_eq!(args, ["fake.sh", "-y", "out.mjpeg"]);
        assert_eq!(tool.display_name(), "/bin/sh fake.sh");
    }
}
