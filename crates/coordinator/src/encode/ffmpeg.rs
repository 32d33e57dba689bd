//! ffmpeg command construction and execution.
//!
//! An encode is one ffmpeg process with `-progress pipe:2`; the key/value
//! progress blocks it writes to stderr are turned into whole percentages of
//! the expected output duration.

use super::EncodingEngine;
use crate::filters::{VideoFilter, SYNC_ARGS};
use crate::params::Timecode;
use crate::probe::{self, MediaProbe, ProbeError};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use transcode_coordinator_config::FfmpegConfig;

/// Audio codec of every encode.
pub const AUDIO_CODEC: &str = "aac";

/// Number of trailing stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// ffmpeg exited with non-zero status
    #[error("ffmpeg failed with exit code {code}: {stderr}")]
    FfmpegFailed { code: i32, stderr: String },

    /// ffmpeg was terminated by signal
    #[error("ffmpeg process was terminated by signal")]
    FfmpegTerminated,

    /// ffmpeg ran past the configured timeout and was killed
    #[error("ffmpeg timed out after {0:?}")]
    Timeout(Duration),

    /// Probing the input failed
    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything ffmpeg needs for one encode.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeInvocation {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Encoder of the selected profile.
    pub video_codec: String,
    pub audio_codec: String,
    /// Video bitrate in kbit/s.
    pub video_kbps: u32,
    /// Audio bitrate in kbit/s.
    pub audio_kbps: u32,
    /// Placed before the input.
    pub initial_params: Vec<String>,
    /// Placed after the codec settings.
    pub additional_params: Vec<String>,
    pub filter: VideoFilter,
    pub threads: u32,
    /// Length of a preview clip; full encodes take the duration from a probe.
    pub clip_duration_secs: Option<f64>,
}

/// Build the ffmpeg command of an encode.
///
/// Order: `-y [initial] -i <input> -threads N -vf <filter> <sync> -c:v ... -b:v
/// ...k -c:a aac -b:a ...k [additional] -progress pipe:2 -nostats <output>`.
pub fn build_ffmpeg_command(binary: &str, invocation: &EncodeInvocation) -> Command {
    let mut cmd = Command::new(binary);

    cmd.arg("-y");
    cmd.args(&invocation.initial_params);
    cmd.arg("-i").arg(&invocation.input);
    cmd.arg("-threads").arg(invocation.threads.to_string());
    cmd.arg("-vf").arg(invocation.filter.expression());
    cmd.args(SYNC_ARGS);
    cmd.arg("-c:v").arg(&invocation.video_codec);
    cmd.arg("-b:v").arg(format!("{}k", invocation.video_kbps));
    cmd.arg("-c:a").arg(&invocation.audio_codec);
    cmd.arg("-b:a").arg(format!("{}k", invocation.audio_kbps));
    cmd.args(&invocation.additional_params);
    cmd.args(["-progress", "pipe:2", "-nostats"]);
    cmd.arg(&invocation.output);

    cmd
}

/// A single still frame to extract.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Seek position in seconds.
    pub at_secs: f64,
    /// Optional filter chain applied before the frame is written.
    pub filter: Option<String>,
}

/// Build the ffmpeg command of a frame extraction.
pub fn build_frame_command(binary: &str, request: &FrameRequest) -> Command {
    let mut cmd = Command::new(binary);

    cmd.arg("-y");
    cmd.arg("-ss")
        .arg(Timecode::from_seconds(request.at_secs).to_string());
    cmd.arg("-i").arg(&request.input);
    if let Some(filter) = &request.filter {
        cmd.arg("-vf").arg(filter);
    }
    cmd.args(["-frames:v", "1"]);
    cmd.arg(&request.output);

    cmd
}

/// Turns `-progress` output into whole percentages.
///
/// A percentage is emitted at the end of each progress block, only when it
/// differs from the previous one.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    duration_secs: Option<f64>,
    last_out_time_us: Option<i64>,
    last_percentage: Option<u8>,
}

impl ProgressParser {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| *d > 0.0),
            last_out_time_us: None,
            last_percentage: None,
        }
    }

    /// Feed one stderr line; returns a new percentage when a block completes.
    pub fn feed(&mut self, line: &str) -> Option<u8> {
        let line = line.trim();

        if let Some(val) = line.strip_prefix("out_time_us=") {
            self.last_out_time_us = val.parse::<i64>().ok();
            return None;
        }

        let state = line.strip_prefix("progress=")?;
        let percentage = if state == "end" {
            100
        } else {
            let duration = self.duration_secs?;
            let out_us = self.last_out_time_us?;
            let elapsed_secs = out_us.max(0) as f64 / 1_000_000.0;
            ((elapsed_secs / duration) * 100.0).clamp(0.0, 100.0).floor() as u8
        };

        if self.last_percentage == Some(percentage) {
            return None;
        }
        self.last_percentage = Some(percentage);
        Some(percentage)
    }
}

/// Run an ffmpeg command to completion, streaming stderr lines to `on_line`.
///
/// The process is killed when it runs longer than `timeout`.
fn run_streaming(
    mut cmd: Command,
    timeout: Duration,
    on_line: &mut dyn FnMut(&str),
) -> Result<(), EncodeError> {
    debug!("Running {:?}", cmd);

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let (tx, rx) = mpsc::channel::<String>();
    let reader = child.stderr.take().map(|stderr| {
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
    });

    let deadline = Instant::now() + timeout;
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    if reader.is_some() {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(line) => {
                    on_line(&line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!("ffmpeg exceeded {:?}, killing process {}", timeout, child.id());
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EncodeError::Timeout(timeout));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    let status = child.wait()?;
    if let Some(reader) = reader {
        let _ = reader.join();
    }

    if status.success() {
        return Ok(());
    }

    match status.code() {
        Some(code) => Err(EncodeError::FfmpegFailed {
            code,
            stderr: tail.into_iter().collect::<Vec<_>>().join("\n"),
        }),
        None => Err(EncodeError::FfmpegTerminated),
    }
}

/// Engine backed by the ffmpeg and ffprobe binaries.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg_binary: String,
    ffprobe_binary: String,
    timeout: Duration,
}

impl FfmpegEngine {
    pub fn new(
        ffmpeg_binary: impl Into<String>,
        ffprobe_binary: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            ffmpeg_binary: ffmpeg_binary.into(),
            ffprobe_binary: ffprobe_binary.into(),
            timeout,
        }
    }

    pub fn from_config(cfg: &FfmpegConfig) -> Self {
        Self::new(
            cfg.ffmpeg_binary.clone(),
            cfg.ffprobe_binary.clone(),
            Duration::from_secs(cfg.timeout_secs),
        )
    }
}

impl EncodingEngine for FfmpegEngine {
    fn encode(
        &self,
        invocation: &EncodeInvocation,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<(), EncodeError> {
        let duration_secs = match invocation.clip_duration_secs {
            Some(secs) => Some(secs),
            None => match self.probe(&invocation.input) {
                Ok(probe) => Some(probe.duration_secs),
                Err(e) => {
                    warn!(
                        "Could not probe {:?}, progress will not be reported: {}",
                        invocation.input, e
                    );
                    None
                }
            },
        };

        let mut parser = ProgressParser::new(duration_secs);
        let cmd = build_ffmpeg_command(&self.ffmpeg_binary, invocation);
        run_streaming(cmd, self.timeout, &mut |line| {
            if let Some(percentage) = parser.feed(line) {
                on_progress(percentage);
            }
        })
    }

    fn extract_frame(&self, request: &FrameRequest) -> Result<(), EncodeError> {
        let cmd = build_frame_command(&self.ffmpeg_binary, request);
        run_streaming(cmd, self.timeout, &mut |_| {})
    }

    fn probe(&self, path: &Path) -> Result<MediaProbe, ProbeError> {
        probe::probe_file(&self.ffprobe_binary, path)
    }
}
