//! Transcoding Job Coordinator
//!
//! Drives one source-to-target transcoding job at a time through its record
//! lifecycle, bundles and reports the artifact, and fires a single final
//! report once every job of a download batch has been delivered.

pub mod aggregate;
pub mod auxiliary;
pub mod callback;
pub mod encode;
pub mod file_server;
pub mod filters;
pub mod finalize;
pub mod job_executor;
pub mod layout;
pub mod params;
pub mod probe;
pub mod profile;
pub mod progress;
pub mod records;

pub use transcode_coordinator_config as config;
pub use transcode_coordinator_config::Config;

pub use aggregate::{aggregate, evaluate_barrier, BarrierOutcome};
pub use callback::{
    CallbackError, CallbackReport, CallbackReporter, CallbackTransport, HttpTransport,
    MediaProperties, ReportBody,
};
pub use encode::{EncodeError, EncodeInvocation, EncodingEngine, FfmpegEngine, FrameRequest};
pub use file_server::{create_file_router, run_file_server, ServerError};
pub use filters::{select_filter, Dimension, EncoderFamily, VideoFilter};
pub use finalize::{archive_name, finalize_artifact, FinalizeError, FinalizedArtifact};
pub use job_executor::{
    JobContext, JobOutcome, JobRequest, TranscodeWorker, WorkerError, WorkerSettings,
};
pub use layout::{prepare_output_dir, resolve_output_path, LayoutError, ModeFlags};
pub use params::{build_params, ClipWindow, EncodeParams, ParamsError, Timecode};
pub use probe::{MediaProbe, ProbeError};
pub use profile::{select_profile, FallbackError, Profile, ProfileOption};
pub use progress::ProgressRecorder;
pub use records::{
    BatchCounts, Download, FileRecordStore, RecordStore, StoreError, TargetDescriptor, User,
    Video, VideoStatus,
};
