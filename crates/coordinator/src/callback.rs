//! Callback reports to the owning service.
//!
//! Every report is a JSON object carrying the owner's `api_token` and the
//! job's `mediakey`, plus exactly one outcome shape. Reports are sent once;
//! a transport failure goes back to the caller and is never retried here.

use crate::finalize::FinalizedArtifact;
use crate::probe::MediaProbe;
use crate::records::{User, Video};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use transcode_coordinator_config::Config;

/// Route under which finished artifacts are served.
pub const FILE_ROUTE: &str = "/file";

#[derive(Debug, Error)]
pub enum CallbackError {
    /// The request could not be delivered.
    #[error("Callback request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The owning service answered with a non-success status.
    #[error("Callback rejected with status {status}: {body}")]
    Status { status: u16, body: String },
}

/// `medium` of a single-file encode.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EncodedMedium {
    pub label: String,
    pub url: String,
    pub checksum: String,
}

/// Metadata of a single-file encode and its source.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MediaProperties {
    pub source_width: u32,
    pub source_height: u32,
    /// Whole seconds.
    pub duration: i64,
    pub filesize: u64,
    pub width: u32,
    pub height: u32,
    pub source_is360video: bool,
}

impl MediaProperties {
    pub fn from_probes(source: &MediaProbe, output: &MediaProbe) -> Self {
        Self {
            source_width: source.width,
            source_height: source.height,
            duration: output.duration_secs.round() as i64,
            filesize: output.size_bytes,
            width: output.width,
            height: output.height,
            source_is360video: source.is_360_video(),
        }
    }
}

/// `medium` of a segmented-streaming encode; echoes the target descriptor.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamingMedium {
    pub label: String,
    pub url: String,
    pub hls: bool,
    pub vbr: u32,
    pub abr: u32,
    pub size: Option<serde_json::Value>,
    pub extension: String,
    pub created_at: String,
    pub default: bool,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThumbnailReady {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpritemapReady {
    pub count: u32,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorDetail {
    pub message: String,
}

/// Outcome carried by a report.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ReportBody {
    Encoded {
        medium: EncodedMedium,
        properties: MediaProperties,
    },
    Streaming {
        medium: StreamingMedium,
    },
    Thumbnail {
        thumbnail: ThumbnailReady,
    },
    Spritemap {
        spritemap: SpritemapReady,
    },
    Finished {
        finished: bool,
    },
    Error {
        error: ErrorDetail,
    },
}

/// A report as sent on the wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CallbackReport {
    pub api_token: String,
    pub mediakey: String,
    #[serde(flatten)]
    pub body: ReportBody,
}

/// Delivers reports to an endpoint.
#[async_trait]
pub trait CallbackTransport: Send + Sync {
    async fn send(&self, endpoint: &str, report: &CallbackReport) -> Result<(), CallbackError>;
}

/// JSON-over-HTTP transport.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, CallbackError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CallbackTransport for HttpTransport {
    async fn send(&self, endpoint: &str, report: &CallbackReport) -> Result<(), CallbackError> {
        let response = self.client.post(endpoint).json(report).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CallbackError::Status { status, body });
        }

        Ok(())
    }
}

/// Builds reports and hands them to a transport.
#[derive(Clone)]
pub struct CallbackReporter {
    transport: Arc<dyn CallbackTransport>,
    callback_path: String,
    public_url: String,
}

impl CallbackReporter {
    pub fn new(
        transport: Arc<dyn CallbackTransport>,
        callback_path: impl Into<String>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            callback_path: callback_path.into(),
            public_url: public_url.into(),
        }
    }

    /// Reporter sending over HTTP with the configured timeout.
    pub fn from_config(cfg: &Config) -> Result<Self, CallbackError> {
        let transport = HttpTransport::new(Duration::from_secs(cfg.callback.timeout_secs))?;
        Ok(Self::new(
            Arc::new(transport),
            cfg.callback.path.clone(),
            cfg.server.public_url.clone(),
        ))
    }

    /// Callback endpoint of a user.
    pub fn endpoint(&self, user: &User) -> String {
        format!("{}{}", user.url.trim_end_matches('/'), self.callback_path)
    }

    /// Public URL of a finished artifact.
    pub fn artifact_url(&self, file: &str) -> String {
        format!(
            "{}{}/{}",
            self.public_url.trim_end_matches('/'),
            FILE_ROUTE,
            file
        )
    }

    async fn send(
        &self,
        user: &User,
        mediakey: &str,
        body: ReportBody,
    ) -> Result<(), CallbackError> {
        let report = CallbackReport {
            api_token: user.api_token.clone(),
            mediakey: mediakey.to_string(),
            body,
        };
        self.transport.send(&self.endpoint(user), &report).await
    }

    /// Success report of a single-file encode.
    pub async fn report_encoded(
        &self,
        user: &User,
        video: &Video,
        artifact: &FinalizedArtifact,
        properties: MediaProperties,
    ) -> Result<(), CallbackError> {
        let medium = EncodedMedium {
            label: video.target.label.clone(),
            url: self.artifact_url(&artifact.file),
            checksum: artifact.checksum.clone(),
        };
        self.send(user, &video.mediakey, ReportBody::Encoded { medium, properties })
            .await
    }

    /// Success report of a segmented-streaming encode.
    pub async fn report_streaming(
        &self,
        user: &User,
        video: &Video,
        artifact: &FinalizedArtifact,
    ) -> Result<(), CallbackError> {
        let target = &video.target;
        let medium = StreamingMedium {
            label: target.label.clone(),
            url: self.artifact_url(&artifact.file),
            hls: true,
            vbr: target.vbr,
            abr: target.abr,
            size: target.size.clone(),
            extension: target.extension.clone(),
            created_at: target.created_at.clone(),
            default: target.default,
            checksum: artifact.checksum.clone(),
        };
        self.send(user, &video.mediakey, ReportBody::Streaming { medium })
            .await
    }

    pub async fn report_thumbnail(
        &self,
        user: &User,
        video: &Video,
        file: &str,
    ) -> Result<(), CallbackError> {
        let thumbnail = ThumbnailReady {
            url: self.artifact_url(file),
        };
        self.send(user, &video.mediakey, ReportBody::Thumbnail { thumbnail })
            .await
    }

    pub async fn report_spritemap(
        &self,
        user: &User,
        video: &Video,
        count: u32,
        file: &str,
    ) -> Result<(), CallbackError> {
        let spritemap = SpritemapReady {
            count,
            url: self.artifact_url(file),
        };
        self.send(user, &video.mediakey, ReportBody::Spritemap { spritemap })
            .await
    }

    /// Final report of a completed batch.
    pub async fn report_finished(&self, user: &User, mediakey: &str) -> Result<(), CallbackError> {
        info!("Executing final callback for mediakey {}", mediakey);
        self.send(user, mediakey, ReportBody::Finished { finished: true })
            .await
    }

    pub async fn report_error(
        &self,
        user: &User,
        mediakey: &str,
        message: &str,
    ) -> Result<(), CallbackError> {
        info!("Executing error callback for mediakey {}", mediakey);
        let error = ErrorDetail {
            message: message.to_string(),
        };
        self.send(user, mediakey, ReportBody::Error { error }).await
    }
}
