// Filter strings and fixed encoding presets
//
// The capture side only needs rotation and an optional timestamp overlay.
// The export side has one preset: MPEG-4 Part 2 in MP4, tolerant of the
// truncated final frame a power cut leaves in the last segment.

use std::path::Path;

use super::{EncoderError, Result};

/// UTC wall clock burned into the top-left corner.
/// Colons inside the strftime expansion need double escaping for drawtext.
pub const TIMESTAMP_OVERLAY: &str = r"drawtext=text='%{gmtime\:%Y-%m-%d %H\\\:%M\\\:%S} \\(UTC\\)':fontcolor=white:fontsize=24:box=1:boxcolor=black@0.5:boxborderw=5:x=10:y=10";

/// ffmpeg filter for a clockwise rotation, `None` for no rotation
pub fn rotation_filter(rotation: u32) -> Result<Option<&'static str>> {
    match rotation {
        0 => Ok(None),
        90 => Ok(Some("transpose=1")),
        180 => Ok(Some("transpose=1,transpose=1")),
        270 => Ok(Some("transpose=2")),
        other => Err(EncoderError::UnsupportedRotation(other)),
    }
}

/// Join the capture filters into a single `-vf` value
pub fn capture_filters(rotation: u32, embed_timestamp: bool) -> Result<Option<String>> {
    let mut filters = Vec::new();
    if let Some(rotate) = rotation_filter(rotation)? {
        filters.push(rotate);
    }
    if embed_timestamp {
        filters.push(TIMESTAMP_OVERLAY);
    }

    if filters.is_empty() {
        Ok(None)
    } else {
        Ok(Some(filters.join(",")))
    }
}

/// Parameters of the export transcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportPreset {
    pub fps: u32,
    /// MPEG-4 q:v, 1-31
    pub quality: u32,
}

impl Default for ExportPreset {
    fn default() -> Self {
        Self { fps: 24, quality: 2 }
    }
}

/// Arguments for concatenating a manifest of MJPEG segments into one MP4
pub fn export_args(preset: &ExportPreset, manifest: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-loglevel".into(),
        "error".into(),
        // Skip the partial frame at the end of a segment cut by power loss
        "-fflags".into(),
        "+discardcorrupt".into(),
        "-err_detect".into(),
        "ignore_err".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        manifest.to_string_lossy().into_owned(),
        "-c:v".into(),
        "mpeg4".into(),
        "-q:v".into(),
        preset.quality.to_string(),
        "-r".into(),
        preset.fps.to_string(),
        "-fps_mode".into(),
        "cfr".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-f".into(),
        "mp4".into(),
        output.to_string_lossy().into_owned(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn rotation_maps_to_transpose() {
        assert_eq!(rotation_filter(0).unwrap(), None);
        assert_eq!(rotation_filter(90).unwrap(), Some("transpose=1"));
        assert_eq!(rotation_filter(180).unwrap(), Some("transpose=1,transpose=1"));
        assert_eq!(rotation_filter(270).unwrap(), Some("transpose=2"));
        assert!(matches!(rotation_filter(45), Err(EncoderError::UnsupportedRotation(45))));
    }

    #[test]
    fn overlay_follows_rotation() {
        let vf = capture_filters(90, true).unwrap().unwrap();
        assert!(vf.starts_with("transpose=1,drawtext="));
        assert_eq!(capture_filters(0, false).unwrap(), None);
    }

    #[test]
    fn export_args_end_with_output() {
        let preset = ExportPreset { fps: 15, quality: 2 };
        let args = export_args(&preset, &PathBuf::from("/w/concat.txt"), &PathBuf::from("/w/export.mp4"));

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("-fflags") + 1], "+discardcorrupt");
        assert_eq!(args[pos("-i") + 1], "/w/concat.txt");
        assert_eq!(args[pos("-r") + 1], "15");
        assert_eq!(args[pos("-c:v") + 1], "mpeg4");
        assert!(pos("-f") < pos("-i"));
        assert_eq!(args.last().unwrap(), "/w/export.mp4");
    }
}
