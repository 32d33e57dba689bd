//! Output layout resolution.
//!
//! Output names are derived only from the source key, the target descriptor
//! and the mode flags, so any component can recompute a job's path instead
//! of persisting it ahead of time. Paths are storage keys relative to the
//! converted root and always use `/` as separator.

use crate::records::TargetDescriptor;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Playlist extension of segmented-streaming outputs.
pub const PLAYLIST_EXTENSION: &str = "m3u8";

/// Prefix of preview (clipped) outputs.
pub const PREVIEW_PREFIX: &str = "preview_";

/// Errors raised while preparing an output directory.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// Stale output of an earlier run could not be removed.
    #[error("Failed to purge output directory {path:?}: {source}")]
    Purge { path: PathBuf, source: io::Error },

    /// The output directory could not be created.
    #[error("Failed to create output directory {path:?}: {source}")]
    Create { path: PathBuf, source: io::Error },
}

/// Mode flags supplied by the invoking context alongside a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeFlags {
    /// Encode only a clipped time range.
    pub preview: bool,
    /// Produce a segmented playlist instead of a single file.
    pub segmented_streaming: bool,
}

impl ModeFlags {
    pub fn new(preview: bool, segmented_streaming: bool) -> Self {
        Self {
            preview,
            segmented_streaming,
        }
    }
}

/// Resolve the output path of a job.
///
/// 1. `{source}_{created_at}{sep}{label}.{extension}`, with label and
///    separator empty for the default rendition.
/// 2. Segmented: `{source}/{source}_{created_at}{sep}{label}_{extension}.m3u8`.
/// 3. Preview: the result gets a `preview_` prefix.
pub fn resolve_output_path(source: &str, target: &TargetDescriptor, mode: ModeFlags) -> String {
    let (separator, label) = if target.default {
        ("", "")
    } else {
        ("_", target.label.as_str())
    };

    let stem = format!("{}_{}{}{}", source, target.created_at, separator, label);

    let path = if mode.segmented_streaming {
        format!(
            "{}/{}_{}.{}",
            source, stem, target.extension, PLAYLIST_EXTENSION
        )
    } else {
        format!("{}.{}", stem, target.extension)
    };

    if mode.preview {
        format!("{}{}", PREVIEW_PREFIX, path)
    } else {
        path
    }
}

/// Directory holding a segmented job's playlist and segments.
///
/// `None` for single-file outputs, which live directly under the root.
pub fn output_dir(output_path: &str) -> Option<&str> {
    output_path
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .filter(|dir| !dir.is_empty())
}

/// Purge and recreate the directory a segmented output will be written to.
///
/// Anything left by an earlier attempt for the same source is removed first.
/// Returns the absolute directory path, or `None` when the output has no
/// directory component.
pub fn prepare_output_dir(
    converted_root: &Path,
    output_path: &str,
) -> Result<Option<PathBuf>, LayoutError> {
    let Some(dir) = output_dir(output_path) else {
        return Ok(None);
    };
    let dir = converted_root.join(dir);

    match fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(LayoutError::Purge { path: dir, source }),
    }

    fs::create_dir_all(&dir).map_err(|source| LayoutError::Create {
        path: dir.clone(),
        source,
    })?;

    Ok(Some(dir))
}
