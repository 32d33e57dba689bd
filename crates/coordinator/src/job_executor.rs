//! Job state machine.
//!
//! One [`TranscodeWorker::run`] drives a single video record through
//! `Pending -> Processing -> Processed`: it resolves the profile for the
//! attempt, builds the encode plan, runs the engine on a blocking thread,
//! finalizes the artifact, persists Processed, reports it and evaluates the
//! batch barrier. A job whose artifact cannot be finalized never reaches
//! Processed.
//! Moving a job to `Failed` and retrying it belong to the invoking context.

use crate::aggregate::{aggregate, BarrierOutcome};
use crate::callback::{CallbackError, CallbackReporter, MediaProperties};
use crate::encode::{EncodeError, EncodeInvocation, EncodingEngine};
use crate::filters::{select_filter, Dimension};
use crate::finalize::{finalize_artifact, FinalizeError, FinalizedArtifact};
use crate::layout::{prepare_output_dir, resolve_output_path, LayoutError, ModeFlags};
use crate::params::{build_params, ClipWindow, ParamsError};
use crate::probe::ProbeError;
use crate::profile::{select_profile, FallbackError, Profile};
use crate::progress::ProgressRecorder;
use crate::records::{RecordStore, StoreError, User, Video, VideoStatus};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use transcode_coordinator_config::Config;

/// Error type for worker runs
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Profile selection failed: {0}")]
    Fallback(#[from] FallbackError),

    #[error("Invalid encode parameters: {0}")]
    Params(#[from] ParamsError),

    #[error("Output preparation failed: {0}")]
    Layout(#[from] LayoutError),

    #[error("Encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Finalization failed: {0}")]
    Finalize(#[from] FinalizeError),

    #[error("Callback failed: {0}")]
    Callback(#[from] CallbackError),

    /// The job descriptor lacks the extraction parameters of an auxiliary job.
    #[error("Job descriptor has no {0}")]
    MissingExtraction(&'static str),

    /// A blocking task panicked or was cancelled
    #[error("Worker task failed: {0}")]
    Task(String),
}

/// Storage and engine settings of a worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Root of uploaded sources.
    pub uploaded_dir: PathBuf,
    /// Root of produced artifacts.
    pub converted_dir: PathBuf,
    /// Encoder threads per job.
    pub threads: u32,
}

impl WorkerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            uploaded_dir: cfg.storage.uploaded_dir.clone(),
            converted_dir: cfg.storage.converted_dir.clone(),
            threads: cfg.ffmpeg.threads,
        }
    }
}

/// What the invoking context asks a worker to do.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub video_id: String,
    /// 1 for the first attempt.
    pub attempt: u32,
    pub dimension: Dimension,
    pub mode: ModeFlags,
}

/// Everything resolved for one run; never mutated once planned.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub video: Video,
    pub user: User,
    pub profile: Profile,
    pub mode: ModeFlags,
    /// Resolved output path, relative to the converted root.
    pub output_path: String,
    pub invocation: EncodeInvocation,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// The record as persisted at the end of the run.
    pub video: Video,
    pub artifact: FinalizedArtifact,
    /// Latest recorded progress percentage.
    pub progress: Option<u8>,
    pub barrier: BarrierOutcome,
}

/// Runs transcoding jobs against a record store and an encoding engine.
pub struct TranscodeWorker {
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) engine: Arc<dyn EncodingEngine>,
    pub(crate) reporter: CallbackReporter,
    pub(crate) settings: WorkerSettings,
}

impl TranscodeWorker {
    pub fn new(
        store: Arc<dyn RecordStore>,
        engine: Arc<dyn EncodingEngine>,
        reporter: CallbackReporter,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            engine,
            reporter,
            settings,
        }
    }

    /// Run one transcoding job to completion.
    pub async fn run(&self, request: &JobRequest) -> Result<JobOutcome, WorkerError> {
        let video = self.begin(&request.video_id)?;
        let ctx = self.plan(video, request)?;

        let recorder = self.encode(&ctx).await?;
        let artifact = self.finalize(&ctx).await?;
        let video = self.complete(&ctx, &artifact)?;

        self.report(&ctx, &video, &artifact).await?;
        let barrier = aggregate(
            self.store.as_ref(),
            &self.reporter,
            &ctx.user,
            &video.mediakey,
        )
        .await?;

        Ok(JobOutcome {
            video,
            artifact,
            progress: recorder.latest(),
            barrier,
        })
    }

    /// Load the record and persist the move to Processing.
    pub(crate) fn begin(&self, video_id: &str) -> Result<Video, WorkerError> {
        let mut video = self.store.video(video_id)?;
        video.set_status(VideoStatus::Processing);
        self.store.save_video(&video)?;
        info!("Job {} ({}) is processing", video.id, video.path);
        Ok(video)
    }

    /// Resolve profile, output path and parameters.
    ///
    /// The output directory of a segmented job is purged last, once the rest
    /// of the plan is known to be valid.
    pub fn plan(&self, video: Video, request: &JobRequest) -> Result<JobContext, WorkerError> {
        let user = self.store.user(&video.user_id)?;
        let primary = self.store.profile(&user.profile_id)?;
        let profile = select_profile(request.attempt, primary, |id| self.store.profile(id))?;

        let mode = request.mode;
        let output_path = resolve_output_path(&video.path, &video.target, mode);
        let absolute_output = self.settings.converted_dir.join(&output_path);

        let clip = if mode.preview {
            Some(self.clip_window(&video)?)
        } else {
            None
        };

        let params = build_params(
            &profile,
            mode,
            clip.as_ref(),
            &absolute_output.to_string_lossy(),
        )?;

        if mode.segmented_streaming {
            prepare_output_dir(&self.settings.converted_dir, &output_path)?;
        }

        let invocation = EncodeInvocation {
            input: self.settings.uploaded_dir.join(&video.path),
            output: absolute_output,
            video_codec: profile.encoder.clone(),
            audio_codec: crate::encode::ffmpeg::AUDIO_CODEC.to_string(),
            video_kbps: video.target.vbr,
            audio_kbps: video.target.abr,
            initial_params: params.initial,
            additional_params: params.additional,
            filter: select_filter(request.dimension, &profile.encoder),
            threads: self.settings.threads,
            clip_duration_secs: clip.map(|c| c.duration_secs),
        };

        Ok(JobContext {
            video,
            user,
            profile,
            mode,
            output_path,
            invocation,
        })
    }

    /// Clip window of a preview, read from the job's download batch.
    fn clip_window(&self, video: &Video) -> Result<ClipWindow, WorkerError> {
        let download_id = video
            .download_id
            .as_deref()
            .ok_or(ParamsError::MissingClip("window"))?;

        let download = match self.store.download(download_id) {
            Ok(download) => download,
            Err(e) if e.is_not_found() => return Err(ParamsError::MissingClip("window").into()),
            Err(e) => return Err(e.into()),
        };

        Ok(ClipWindow::from_payload(&download.payload)?)
    }

    async fn encode(&self, ctx: &JobContext) -> Result<ProgressRecorder, WorkerError> {
        info!(
            "Encoding {} with {} (profile {})",
            ctx.video.path, ctx.profile.encoder, ctx.profile.id
        );

        let engine = self.engine.clone();
        let invocation = ctx.invocation.clone();
        let mut recorder = ProgressRecorder::new(ctx.video.path.clone());

        tokio::task::spawn_blocking(move || {
            let result = engine.encode(&invocation, &mut |pct| recorder.observe(pct));
            result.map(|()| recorder)
        })
        .await
        .map_err(|e| WorkerError::Task(e.to_string()))?
        .map_err(WorkerError::from)
    }

    /// Bundle and checksum the encoder's output.
    async fn finalize(&self, ctx: &JobContext) -> Result<FinalizedArtifact, WorkerError> {
        let converted_dir = self.settings.converted_dir.clone();
        let source = ctx.video.path.clone();
        let target = ctx.video.target.clone();
        let mode = ctx.mode;
        let output_path = ctx.output_path.clone();

        let artifact = tokio::task::spawn_blocking(move || {
            finalize_artifact(&converted_dir, &source, &target, mode, &output_path)
        })
        .await
        .map_err(|e| WorkerError::Task(e.to_string()))??;

        Ok(artifact)
    }

    /// Persist Processed with the final artifact in one save.
    fn complete(
        &self,
        ctx: &JobContext,
        artifact: &FinalizedArtifact,
    ) -> Result<Video, WorkerError> {
        let mut video = ctx.video.clone();
        video.mark_processed(artifact.file.clone());
        self.store.save_video(&video)?;
        info!("Job {} processed: {}", video.id, artifact.file);
        Ok(video)
    }

    async fn report(
        &self,
        ctx: &JobContext,
        video: &Video,
        artifact: &FinalizedArtifact,
    ) -> Result<(), WorkerError> {
        if ctx.mode.segmented_streaming {
            self.reporter
                .report_streaming(&ctx.user, video, artifact)
                .await?;
            return Ok(());
        }

        let engine = self.engine.clone();
        let source_path = ctx.invocation.input.clone();
        let output_path = artifact.path.clone();
        let properties = tokio::task::spawn_blocking(move || {
            let source = engine.probe(&source_path)?;
            let output = engine.probe(&output_path)?;
            Ok::<_, ProbeError>(MediaProperties::from_probes(&source, &output))
        })
        .await
        .map_err(|e| WorkerError::Task(e.to_string()))??;

        self.reporter
            .report_encoded(&ctx.user, video, artifact, properties)
            .await?;
        Ok(())
    }

    /// Mark a job Failed and send the error report.
    ///
    /// Used by the invoking context once it stops retrying.
    pub async fn report_failure(&self, video_id: &str, message: &str) -> Result<(), WorkerError> {
        let mut video = self.store.video(video_id)?;
        video.set_status(VideoStatus::Failed);
        self.store.save_video(&video)?;

        let user = self.store.user(&video.user_id)?;
        self.reporter
            .report_error(&user, &video.mediakey, message)
            .await?;
        Ok(())
    }
}
