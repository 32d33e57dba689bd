//! CLI entry point for the transcoding worker
//!
//! Each invocation runs one job (or the artifact server). A failed job exits
//! non-zero so the dispatcher can retry it with the next attempt number; once
//! the configured attempts are used up the job is marked failed and the
//! owning service receives an error report.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transcode_coordinator::{
    run_file_server, CallbackError, CallbackReporter, Config, Dimension, FfmpegEngine,
    FileRecordStore, JobRequest, ModeFlags, TranscodeWorker, WorkerError, WorkerSettings,
};

const DEFAULT_LOG_FILTER: &str = "transcode_coordinator=info,transcode_worker=info";
const VERBOSE_LOG_FILTER: &str = "transcode_coordinator=debug,transcode_worker=debug";

/// Transcoding worker - runs one coordinator job per invocation
#[derive(Parser, Debug)]
#[command(name = "transcode-worker")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Transcode one video record
    Transcode {
        /// Video record id
        #[arg(long)]
        video: String,

        /// Attempt number, starting at 1
        #[arg(long, default_value = "1")]
        attempt: u32,

        /// Target width in pixels
        #[arg(long)]
        width: u32,

        /// Target height in pixels
        #[arg(long)]
        height: u32,

        /// Encode only the clip window of the download batch
        #[arg(long, default_value = "false")]
        preview: bool,

        /// Produce a segmented HLS playlist
        #[arg(long, default_value = "false")]
        hls: bool,
    },

    /// Extract the thumbnail frame of a video record
    Thumbnail {
        #[arg(long)]
        video: String,
    },

    /// Render the spritemap of a video record
    Spritemap {
        #[arg(long)]
        video: String,
    },

    /// Serve finished artifacts over HTTP
    Serve,
}

fn build_worker(config: &Config) -> Result<TranscodeWorker, CallbackError> {
    Ok(TranscodeWorker::new(
        Arc::new(FileRecordStore::new(config.storage.state_dir.clone())),
        Arc::new(FfmpegEngine::from_config(&config.ffmpeg)),
        CallbackReporter::from_config(config)?,
        WorkerSettings::from_config(config),
    ))
}

/// Handle a failed job run as the invoking context.
async fn handle_failure(
    worker: &TranscodeWorker,
    config: &Config,
    video_id: &str,
    attempt: u32,
    err: &WorkerError,
) {
    error!("Job {} failed on attempt {}: {}", video_id, attempt, err);

    if let WorkerError::Callback(_) = err {
        // The job itself completed; only the report was lost.
        return;
    }

    if attempt < config.worker.max_attempts {
        info!(
            "Job {} will be retried ({} of {} attempts used)",
            video_id, attempt, config.worker.max_attempts
        );
        return;
    }

    if let Err(e) = worker.report_failure(video_id, &err.to_string()).await {
        warn!("Could not report failure of job {}: {}", video_id, e);
    }
}

/// Run one worker subcommand to completion.
async fn run_job(worker: &TranscodeWorker, config: &Config, command: Commands) -> ExitCode {
    match command {
        Commands::Transcode {
            video,
            attempt,
            width,
            height,
            preview,
            hls,
        } => {
            let request = JobRequest {
                video_id: video.clone(),
                attempt,
                dimension: Dimension::new(width, height),
                mode: ModeFlags::new(preview, hls),
            };

            match worker.run(&request).await {
                Ok(outcome) => {
                    info!(
                        "Job {} delivered {} (batch: {:?})",
                        video, outcome.artifact.file, outcome.barrier
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    handle_failure(worker, config, &video, attempt, &e).await;
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Thumbnail { video } => {
            match worker.create_thumbnail(&video).await {
                Ok(record) => {
                    info!("Thumbnail of {} written to {:?}", video, record.file);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Thumbnail of {} failed: {}", video, e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Spritemap { video } => {
            match worker.create_spritemap(&video).await {
                Ok(record) => {
                    info!("Spritemap of {} written to {:?}", video, record.file);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Spritemap of {} failed: {}", video, e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Serve => ExitCode::SUCCESS,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = match Config::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Serve => {
            match run_file_server(&config.server.bind, config.storage.converted_dir.clone()).await
            {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("File server error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        command => {
            let worker = match build_worker(&config) {
                Ok(worker) => worker,
                Err(e) => {
                    error!("Failed to set up callback transport: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            run_job(&worker, &config, command).await
        }
    }
}
