//! Thumbnail and spritemap jobs.
//!
//! Both are one-shot frame extractions from the uploaded source; they share
//! the record lifecycle of encodes but never take part in batch aggregation.

use crate::encode::FrameRequest;
use crate::job_executor::{TranscodeWorker, WorkerError};
use crate::records::{SpritemapSpec, Video};
use tracing::info;

/// Default spritemap tile width.
pub const SPRITE_TILE_WIDTH: u32 = 142;
/// Default spritemap tile height.
pub const SPRITE_TILE_HEIGHT: u32 = 80;

/// `{source}_{source.created_at}_{key}.jpg`
pub fn thumbnail_name(source: &str, created_at: &str, key: &str) -> String {
    format!("{}_{}_{}.jpg", source, created_at, key)
}

/// `{source}_{source.created_at}_sprites.jpg`
pub fn spritemap_name(source: &str, created_at: &str) -> String {
    format!("{}_{}_sprites.jpg", source, created_at)
}

/// Tiling filter sampling `count` frames evenly over the source.
///
/// Sources shorter than one second are treated as one second long.
pub fn spritemap_filter(spec: &SpritemapSpec, duration_secs: f64) -> String {
    let width = spec.width.unwrap_or(SPRITE_TILE_WIDTH);
    let height = spec.height.unwrap_or(SPRITE_TILE_HEIGHT);
    let fps = spec.count as f64 / duration_secs.ceil().max(1.0);

    format!(
        "scale={}:{},fps={},tile=10x10:margin=2:padding=2",
        width, height, fps
    )
}

fn source_created_at(video: &Video) -> Result<&str, WorkerError> {
    video
        .target
        .source
        .as_ref()
        .map(|stamp| stamp.created_at.as_str())
        .ok_or(WorkerError::MissingExtraction("source stamp"))
}

impl TranscodeWorker {
    /// Extract the requested thumbnail frame and report it.
    pub async fn create_thumbnail(&self, video_id: &str) -> Result<Video, WorkerError> {
        let video = self.begin(video_id)?;

        let (key, item) = video
            .target
            .thumbnail_item
            .as_ref()
            .and_then(|items| items.iter().next())
            .ok_or(WorkerError::MissingExtraction("thumbnail item"))?;
        let name = thumbnail_name(&video.path, source_created_at(&video)?, key);

        let request = FrameRequest {
            input: self.settings.uploaded_dir.join(&video.path),
            output: self.settings.converted_dir.join(&name),
            at_secs: item.second,
            filter: None,
        };
        self.extract(request).await?;

        let video = self.mark_extracted(video, name)?;
        let user = self.store.user(&video.user_id)?;
        let file = video.file.clone().unwrap_or_default();
        self.reporter.report_thumbnail(&user, &video, &file).await?;
        Ok(video)
    }

    /// Render the spritemap of the source and report it.
    pub async fn create_spritemap(&self, video_id: &str) -> Result<Video, WorkerError> {
        let video = self.begin(video_id)?;

        let spec = video
            .target
            .spritemap
            .clone()
            .ok_or(WorkerError::MissingExtraction("spritemap"))?;
        let name = spritemap_name(&video.path, source_created_at(&video)?);
        let input = self.settings.uploaded_dir.join(&video.path);

        let engine = self.engine.clone();
        let probe_input = input.clone();
        let source = tokio::task::spawn_blocking(move || engine.probe(&probe_input))
            .await
            .map_err(|e| WorkerError::Task(e.to_string()))??;

        let request = FrameRequest {
            input,
            output: self.settings.converted_dir.join(&name),
            at_secs: 0.0,
            filter: Some(spritemap_filter(&spec, source.duration_secs)),
        };
        self.extract(request).await?;

        let video = self.mark_extracted(video, name)?;
        let user = self.store.user(&video.user_id)?;
        let file = video.file.clone().unwrap_or_default();
        self.reporter
            .report_spritemap(&user, &video, spec.count, &file)
            .await?;
        Ok(video)
    }

    async fn extract(&self, request: FrameRequest) -> Result<(), WorkerError> {
        info!("Extracting frame {:?} -> {:?}", request.input, request.output);
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.extract_frame(&request))
            .await
            .map_err(|e| WorkerError::Task(e.to_string()))??;
        Ok(())
    }

    fn mark_extracted(&self, mut video: Video, name: String) -> Result<Video, WorkerError> {
        video.mark_processed(name);
        self.store.save_video(&video)?;
        Ok(video)
    }
}
