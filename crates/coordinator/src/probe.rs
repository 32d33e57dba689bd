//! Media probing with ffprobe.
//!
//! Collects the dimensions, duration, file size and side data of the first
//! video stream; these feed the success report and the spritemap frame rate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Side data marker of spherical (360°) sources.
pub const SPHERICAL_MAPPING: &str = "Spherical Mapping";

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The file has no video stream.
    #[error("No video stream found")]
    NoVideoStream,

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One side data entry of a video stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SideData {
    pub side_data_type: Option<String>,
}

/// Metadata of the first video stream of a media file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaProbe {
    pub width: u32,
    pub height: u32,
    /// Duration in seconds.
    pub duration_secs: f64,
    /// File size in bytes.
    pub size_bytes: u64,
    pub side_data_list: Vec<SideData>,
}

impl MediaProbe {
    /// A source is 360° when its first side data entry is a spherical mapping.
    /// Later entries are not consulted.
    pub fn is_360_video(&self) -> bool {
        self.side_data_list
            .first()
            .and_then(|entry| entry.side_data_type.as_deref())
            .map(|kind| kind.contains(SPHERICAL_MAPPING))
            .unwrap_or(false)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub duration: Option<String>,
        pub side_data_list: Option<Vec<super::SideData>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Probe a media file.
///
/// Runs `<ffprobe> -v quiet -print_format json -show_streams -show_format <path>`.
pub fn probe_file(ffprobe_binary: &str, path: &Path) -> Result<MediaProbe, ProbeError> {
    let output = Command::new(ffprobe_binary)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parse ffprobe JSON output into a [`MediaProbe`] of the first video stream.
///
/// Stream duration wins over the container duration when both are present.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaProbe, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let video = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
        .ok_or(ProbeError::NoVideoStream)?;

    let parse_secs = |value: Option<&String>| value.and_then(|d| d.parse::<f64>().ok());

    let duration_secs = parse_secs(video.duration.as_ref())
        .or_else(|| parse_secs(ffprobe.format.as_ref().and_then(|f| f.duration.as_ref())))
        .unwrap_or(0.0);

    let size_bytes = ffprobe
        .format
        .as_ref()
        .and_then(|f| f.size.as_ref())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(MediaProbe {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        duration_secs,
        size_bytes,
        side_data_list: video.side_data_list.unwrap_or_default(),
    })
}
