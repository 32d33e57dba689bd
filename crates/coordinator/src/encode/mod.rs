//! Encoding engine boundary.
//!
//! The job state machine talks to the engine only through [`EncodingEngine`];
//! [`FfmpegEngine`] drives the ffmpeg/ffprobe binaries.

pub mod ffmpeg;

pub use ffmpeg::{
    build_ffmpeg_command, build_frame_command, EncodeError, EncodeInvocation, FfmpegEngine,
    FrameRequest, ProgressParser,
};

use crate::probe::{MediaProbe, ProbeError};
use std::path::Path;

/// Media engine capability used by the worker.
///
/// All methods block; callers run them on a blocking thread.
pub trait EncodingEngine: Send + Sync {
    /// Run one encode. `on_progress` receives whole percentages as the
    /// engine reports them, synchronously on the encoding thread.
    fn encode(
        &self,
        invocation: &EncodeInvocation,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<(), EncodeError>;

    /// Write a single still frame.
    fn extract_frame(&self, request: &FrameRequest) -> Result<(), EncodeError>;

    /// Probe the first video stream of a media file.
    fn probe(&self, path: &Path) -> Result<MediaProbe, ProbeError>;
}
