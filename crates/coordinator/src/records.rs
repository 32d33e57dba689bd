//! Persistent records consumed by the coordinator.
//!
//! Video (job), download, user and profile records are owned by an external
//! persistence layer. The coordinator talks to it through [`RecordStore`];
//! [`FileRecordStore`] keeps every record as a JSON file under a state
//! directory.

use crate::profile::Profile;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("{kind} record not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A record exists but cannot be decoded.
    #[error("Corrupt record at {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// IO error while reading or writing records.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// True when the error only says the record is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Processing status of a video record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    /// Created, not yet picked up by a worker.
    Pending,
    /// A worker has started on the job.
    Processing,
    /// The artifact has been produced.
    Processed,
    /// The invoking context gave up on the job.
    Failed,
}

impl Default for VideoStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoStatus::Pending => write!(f, "pending"),
            VideoStatus::Processing => write!(f, "processing"),
            VideoStatus::Processed => write!(f, "processed"),
            VideoStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Accepts either a JSON string or a JSON number and keeps its text form.
fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TextOrNumber {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match TextOrNumber::deserialize(deserializer)? {
        TextOrNumber::Text(text) => text,
        TextOrNumber::Number(number) => number.to_string(),
    })
}

/// Frame to extract for a thumbnail job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThumbnailItem {
    /// Offset into the source, in seconds.
    pub second: f64,
}

/// Tiled preview parameters for a spritemap job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpritemapSpec {
    /// Number of tiles requested.
    pub count: u32,
    /// Tile width in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Tile height in pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Source stamp carried by auxiliary job descriptors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceStamp {
    #[serde(deserialize_with = "text_or_number")]
    pub created_at: String,
}

/// Desired output rendition of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TargetDescriptor {
    #[serde(default)]
    pub label: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub created_at: String,
    #[serde(default)]
    pub extension: String,
    /// The default rendition carries no label suffix.
    #[serde(default)]
    pub default: bool,
    /// Video bitrate in kbit/s.
    #[serde(default)]
    pub vbr: u32,
    /// Audio bitrate in kbit/s.
    #[serde(default)]
    pub abr: u32,
    /// Echoed back to the owning service untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_item: Option<BTreeMap<String, ThumbnailItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spritemap: Option<SpritemapSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceStamp>,
}

/// One source-to-target transcoding unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Video {
    pub id: String,
    /// Storage key of the uploaded source asset.
    pub path: String,
    pub target: TargetDescriptor,
    #[serde(default)]
    pub status: VideoStatus,
    /// Group key shared by every job derived from one source.
    pub mediakey: String,
    /// Batch key shared by every job of one download event.
    #[serde(default)]
    pub download_id: Option<String>,
    pub user_id: String,
    /// Produced artifact, relative to the converted storage root.
    #[serde(default)]
    pub file: Option<String>,
    /// Unix milliseconds.
    #[serde(default)]
    pub converted_at: Option<i64>,
    /// Unix milliseconds; set externally once the artifact was fetched.
    #[serde(default)]
    pub downloaded_at: Option<i64>,
    #[serde(default)]
    pub updated_at: i64,
}

impl Video {
    /// Update the record's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    pub fn set_status(&mut self, status: VideoStatus) {
        self.status = status;
        self.touch();
    }

    /// Record a produced artifact and move to Processed.
    pub fn mark_processed(&mut self, file: String) {
        self.file = Some(file);
        self.converted_at = Some(current_timestamp_ms());
        self.set_status(VideoStatus::Processed);
    }

    /// Counts toward the completion barrier of its batch.
    pub fn is_delivered(&self) -> bool {
        self.status == VideoStatus::Processed && self.downloaded_at.is_some()
    }
}

/// Preview clip window stored in a download payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClipTarget {
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DownloadPayload {
    #[serde(default)]
    pub target: Option<ClipTarget>,
}

/// A download batch grouping sibling jobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Download {
    pub id: String,
    #[serde(default)]
    pub payload: DownloadPayload,
    /// Set exactly once, when the batch's final report is sent.
    #[serde(default)]
    pub processed: bool,
}

/// Owner of jobs and profiles, and addressee of callbacks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub profile_id: String,
    /// Base URL of the owning service.
    pub url: String,
    /// Callback credential.
    pub api_token: String,
}

/// Sibling counts of one download batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCounts {
    pub total: usize,
    /// Processed and downloaded.
    pub processed: usize,
}

impl BatchCounts {
    pub fn is_complete(&self) -> bool {
        self.total == self.processed
    }
}

/// Persistence capability used by the coordinator.
///
/// Implementations must make [`RecordStore::try_claim_download`] a
/// compare-and-set: of any number of concurrent callers, exactly one sees
/// `true`. A claim is held until it is committed or released.
pub trait RecordStore: Send + Sync {
    fn video(&self, id: &str) -> Result<Video, StoreError>;

    fn save_video(&self, video: &Video) -> Result<(), StoreError>;

    /// First video record carrying the given group key.
    fn video_by_mediakey(&self, mediakey: &str) -> Result<Video, StoreError>;

    fn batch_counts(&self, download_id: &str) -> Result<BatchCounts, StoreError>;

    fn download(&self, id: &str) -> Result<Download, StoreError>;

    /// Claim the right to send the batch's final report; `true` only for the
    /// caller that took the claim.
    fn try_claim_download(&self, id: &str) -> Result<bool, StoreError>;

    /// Give a claim back so a later caller can take it.
    fn release_download_claim(&self, id: &str) -> Result<(), StoreError>;

    /// Persist the processed flag of a claimed download.
    fn commit_download_processed(&self, id: &str) -> Result<(), StoreError>;

    fn user(&self, id: &str) -> Result<User, StoreError>;

    fn profile(&self, id: &str) -> Result<Profile, StoreError>;
}

/// JSON-file record store.
///
/// Layout under the root: `videos/`, `downloads/`, `users/`, `profiles/`,
/// one `{id}.json` per record. A claim on a download is a `downloads/{id}.claim`
/// marker created with exclusive create, which is the compare-and-set across
/// worker processes. Committed claims keep their marker.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{}.json", id))
    }

    fn marker_path(&self, download_id: &str) -> PathBuf {
        self.root
            .join("downloads")
            .join(format!("{}.claim", download_id))
    }

    pub fn save_download(&self, download: &Download) -> Result<(), StoreError> {
        write_record(&self.record_path("downloads", &download.id), download)
    }

    pub fn save_user(&self, user: &User) -> Result<(), StoreError> {
        write_record(&self.record_path("users", &user.id), user)
    }

    pub fn save_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        write_record(&self.record_path("profiles", &profile.id), profile)
    }

    /// All video records, ordered by id.
    pub fn videos(&self) -> Result<Vec<Video>, StoreError> {
        let dir = self.root.join("videos");
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            // Only process .json files; in-flight temp files are skipped
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut videos = Vec::with_capacity(paths.len());
        for path in paths {
            match read_record::<Video>(&path, "video") {
                Ok(video) => videos.push(video),
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(videos)
    }
}

impl RecordStore for FileRecordStore {
    fn video(&self, id: &str) -> Result<Video, StoreError> {
        read_record(&self.record_path("videos", id), "video")
    }

    fn save_video(&self, video: &Video) -> Result<(), StoreError> {
        write_record(&self.record_path("videos", &video.id), video)
    }

    fn video_by_mediakey(&self, mediakey: &str) -> Result<Video, StoreError> {
        self.videos()?
            .into_iter()
            .find(|video| video.mediakey == mediakey)
            .ok_or_else(|| StoreError::NotFound {
                kind: "video",
                id: mediakey.to_string(),
            })
    }

    fn batch_counts(&self, download_id: &str) -> Result<BatchCounts, StoreError> {
        let siblings: Vec<Video> = self
            .videos()?
            .into_iter()
            .filter(|video| video.download_id.as_deref() == Some(download_id))
            .collect();

        Ok(BatchCounts {
            total: siblings.len(),
            processed: siblings.iter().filter(|video| video.is_delivered()).count(),
        })
    }

    fn download(&self, id: &str) -> Result<Download, StoreError> {
        read_record(&self.record_path("downloads", id), "download")
    }

    fn try_claim_download(&self, id: &str) -> Result<bool, StoreError> {
        if self.download(id)?.processed {
            return Ok(false);
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.marker_path(id))
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn release_download_claim(&self, id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.marker_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn commit_download_processed(&self, id: &str) -> Result<(), StoreError> {
        let mut download = self.download(id)?;
        download.processed = true;
        self.save_download(&download)
    }

    fn user(&self, id: &str) -> Result<User, StoreError> {
        read_record(&self.record_path("users", id), "user")
    }

    fn profile(&self, id: &str) -> Result<Profile, StoreError> {
        read_record(&self.record_path("profiles", id), "profile")
    }
}

fn read_record<T: serde::de::DeserializeOwned>(
    path: &Path,
    kind: &'static str,
) -> Result<T, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Err(StoreError::NotFound { kind, id });
        }
        Err(e) => return Err(e.into()),
    };

    serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a record through a temp file and rename, so concurrent readers
/// never observe a half-written document.
fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", Uuid::new_v4()));
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, json)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
