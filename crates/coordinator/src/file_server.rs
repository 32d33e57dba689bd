//! Artifact HTTP server.
//!
//! Serves finished artifacts from the converted root at `GET /file/{name}`,
//! the URLs handed out in callback reports.

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// Errors that can occur when running the file server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Artifact names must stay below the converted root.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

fn content_type(name: &str) -> &'static str {
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("zip") => "application/zip",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Handler for GET /file/{name}
///
/// Artifacts are streamed from disk, never buffered whole.
async fn get_file(State(root): State<Arc<PathBuf>>, UrlPath(name): UrlPath<String>) -> Response {
    if !is_safe_name(&name) {
        warn!("Rejected artifact request for {:?}", name);
        return StatusCode::BAD_REQUEST.into_response();
    }

    match open_artifact(&root.join(&name)).await {
        Ok(Some((file, size))) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type(&name))
            .header(header::CONTENT_LENGTH, size.to_string())
            .body(Body::from_stream(ReaderStream::new(file)))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!("Failed to open artifact {}: {}", name, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Open a regular file with its size; `None` when there is no such file.
async fn open_artifact(path: &Path) -> std::io::Result<Option<(File, u64)>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let metadata = file.metadata().await?;
    if !metadata.is_file() {
        return Ok(None);
    }
    Ok(Some((file, metadata.len())))
}

/// Creates the axum Router serving artifacts below `converted_dir`
pub fn create_file_router(converted_dir: PathBuf) -> Router {
    Router::new()
        .route("/file/*name", get(get_file))
        .with_state(Arc::new(converted_dir))
}

/// Runs the artifact server on `bind` until it fails
pub async fn run_file_server(bind: &str, converted_dir: PathBuf) -> Result<(), ServerError> {
    let app = create_file_router(converted_dir);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Serving artifacts on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_serves_archive() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("clip1_720p_mp4.zip"), b"PK-archive").unwrap();
        let app = create_file_router(temp_dir.path().to_path_buf());

        let response = get(app, "/file/clip1_720p_mp4.zip").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/zip"
        );
        assert_eq!(response.headers().get("content-length").unwrap(), "10");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"PK-archive");
    }

    #[tokio::test]
    async fn test_serves_nested_preview_segment() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("preview_clip1")).unwrap();
        fs::write(temp_dir.path().join("preview_clip1/a_000.ts"), b"ts").unwrap();
        let app = create_file_router(temp_dir.path().to_path_buf());

        let response = get(app, "/file/preview_clip1/a_000.ts").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("content-type").unwrap(), "video/mp2t");
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_file_router(temp_dir.path().to_path_buf());

        let response = get(app, "/file/nope.mp4").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_large_artifact_is_streamed_intact() {
        let temp_dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        fs::write(temp_dir.path().join("clip1_2024.mp4"), &content).unwrap();
        let app = create_file_router(temp_dir.path().to_path_buf());

        let response = get(app, "/file/clip1_2024.mp4").await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-length").unwrap(),
            content.len().to_string().as_str()
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), content.len());
        assert!(body[..] == content[..]);
    }

    #[tokio::test]
    async fn test_directory_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("clip1")).unwrap();
        let app = create_file_router(temp_dir.path().to_path_buf());

        let response = get(app, "/file/clip1").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_parent_components_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_file_router(temp_dir.path().join("converted"));

        let response = get(app, "/file/a/../../secret.txt").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_safe_names() {
        assert!(is_safe_name("clip1_2024.mp4"));
        assert!(is_safe_name("clip1/clip1_2024_720p_mp4.m3u8"));
        assert!(!is_safe_name(""));
        assert!(!is_safe_name("../etc/passwd"));
        assert!(!is_safe_name("/etc/passwd"));
        assert!(!is_safe_name("a/../b"));
    }
}
