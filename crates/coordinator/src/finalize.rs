//! Artifact finalization.
//!
//! Segmented outputs are bundled into a single zip archive so the owning
//! service fetches one file; single-file outputs are delivered as is. Every
//! final artifact gets an MD5 checksum.

use crate::layout::{output_dir, ModeFlags, PREVIEW_PREFIX};
use crate::records::TargetDescriptor;
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Error)]
pub enum FinalizeError {
    /// The output directory could not be listed.
    #[error("Failed to list output directory: {0}")]
    List(#[from] walkdir::Error),

    /// A file could not be added to the archive.
    #[error("File {file:?} could not be added to the archive: {source}")]
    Archive {
        file: PathBuf,
        source: zip::result::ZipError,
    },

    /// The archive could not be completed.
    #[error("Failed to write archive {path:?}: {source}")]
    Finish {
        path: PathBuf,
        source: zip::result::ZipError,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The artifact delivered to the owning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedArtifact {
    /// Storage key relative to the converted root.
    pub file: String,
    /// Absolute path.
    pub path: PathBuf,
    /// Lowercase hex MD5 of the artifact.
    pub checksum: String,
    /// True when the artifact is an archive of a segmented output.
    pub archived: bool,
}

/// Archive name of a segmented output: `{source}_{label}_{extension}.zip`,
/// prefixed like the output directory for previews.
pub fn archive_name(source: &str, target: &TargetDescriptor, mode: ModeFlags) -> String {
    let name = format!("{}_{}_{}.zip", source, target.label, target.extension);
    if mode.preview {
        format!("{}{}", PREVIEW_PREFIX, name)
    } else {
        name
    }
}

/// Finalize the output of a completed encode.
pub fn finalize_artifact(
    converted_root: &Path,
    source: &str,
    target: &TargetDescriptor,
    mode: ModeFlags,
    output_path: &str,
) -> Result<FinalizedArtifact, FinalizeError> {
    let segmented_dir = output_dir(output_path).filter(|_| mode.segmented_streaming);

    let Some(dir) = segmented_dir else {
        let path = converted_root.join(output_path);
        return Ok(FinalizedArtifact {
            file: output_path.to_string(),
            checksum: file_checksum(&path)?,
            path,
            archived: false,
        });
    };

    let file = archive_name(source, target, mode);
    let path = converted_root.join(&file);
    let entries = archive_directory(&converted_root.join(dir), &path)?;
    info!("Archive: {} ({} files)", file, entries);

    Ok(FinalizedArtifact {
        checksum: file_checksum(&path)?,
        file,
        path,
        archived: true,
    })
}

/// Archive every regular file directly under `dir` into `archive_path`.
///
/// Entries are stored under their base names, in name order. The archive is
/// written under a temporary sibling name and renamed once complete; on any
/// failure the temporary file is removed and nothing appears at
/// `archive_path`. Returns the number of archived files.
pub fn archive_directory(dir: &Path, archive_path: &Path) -> Result<usize, FinalizeError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }

    let mut tmp = archive_path.as_os_str().to_owned();
    tmp.push(format!(".partial-{}", Uuid::new_v4()));
    let tmp = PathBuf::from(tmp);

    let result = write_archive(&files, &tmp).and_then(|()| {
        fs::rename(&tmp, archive_path)?;
        Ok(())
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map(|()| files.len())
}

fn write_archive(files: &[PathBuf], archive_path: &Path) -> Result<(), FinalizeError> {
    let mut writer = ZipWriter::new(File::create(archive_path)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);

    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        writer
            .start_file(name, options)
            .map_err(|source| FinalizeError::Archive {
                file: file.clone(),
                source,
            })?;
        let mut input = File::open(file)?;
        io::copy(&mut input, &mut writer)?;
    }

    writer.finish().map_err(|source| FinalizeError::Finish {
        path: archive_path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Lowercase hex MD5 of a file.
pub fn file_checksum(path: &Path) -> Result<String, io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target() -> TargetDescriptor {
        TargetDescriptor {
            label: "720p".to_string(),
            created_at: "2024".to_string(),
            extension: "mp4".to_string(),
            ..Default::default()
        }
    }

    fn write_segments(root: &Path, dir: &str) {
        let dir = root.join(dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("clip1_2024_720p_mp4.m3u8"), b"#EXTM3U\n").unwrap();
        fs::write(dir.join("clip1_2024_720p_mp4_001.ts"), b"segment-1").unwrap();
        fs::write(dir.join("clip1_2024_720p_mp4_000.ts"), b"segment-0").unwrap();
    }

    fn archive_entries(path: &Path) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn test_segmented_output_is_archived() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write_segments(root, "clip1");

        let artifact = finalize_artifact(
            root,
            "clip1",
            &target(),
            ModeFlags::new(false, true),
            "clip1/clip1_2024_720p_mp4.m3u8",
        )
        .unwrap();

        assert_eq!(artifact.file, "clip1_720p_mp4.zip");
        assert!(artifact.archived);
        assert!(artifact.path.is_file());
        assert_eq!(
            archive_entries(&artifact.path),
            vec![
                "clip1_2024_720p_mp4.m3u8",
                "clip1_2024_720p_mp4_000.ts",
                "clip1_2024_720p_mp4_001.ts",
            ]
        );
        assert_eq!(artifact.checksum, file_checksum(&artifact.path).unwrap());
    }

    #[test]
    fn test_archive_entry_contents_survive() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write_segments(root, "clip1");

        let archive_path = root.join("out.zip");
        assert_eq!(archive_directory(&root.join("clip1"), &archive_path).unwrap(), 3);

        let mut archive = zip::ZipArchive::new(File::open(&archive_path).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name("clip1_2024_720p_mp4_001.ts")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "segment-1");
    }

    #[test]
    fn test_preview_archive_name_is_prefixed() {
        assert_eq!(
            archive_name("clip1", &target(), ModeFlags::new(true, true)),
            "preview_clip1_720p_mp4.zip"
        );
        assert_eq!(
            archive_name("clip1", &target(), ModeFlags::new(false, true)),
            "clip1_720p_mp4.zip"
        );
    }

    #[test]
    fn test_single_file_is_not_archived() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("clip1_2024.mp4"), b"video").unwrap();

        let artifact =
            finalize_artifact(root, "clip1", &target(), ModeFlags::default(), "clip1_2024.mp4")
                .unwrap();

        assert_eq!(artifact.file, "clip1_2024.mp4");
        assert!(!artifact.archived);
        assert_eq!(artifact.path, root.join("clip1_2024.mp4"));
        assert_eq!(artifact.checksum.len(), 32);
        assert_eq!(artifact.checksum, file_checksum(&artifact.path).unwrap());
    }

    #[test]
    fn test_missing_output_directory_fails_without_partial_archive() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let result = finalize_artifact(
            root,
            "clip1",
            &target(),
            ModeFlags::new(false, true),
            "clip1/clip1_2024_720p_mp4.m3u8",
        );

        assert!(matches!(result, Err(FinalizeError::List(_))));
        assert!(!root.join("clip1_720p_mp4.zip").exists());
        assert_eq!(fs::read_dir(root).unwrap().count(), 0);
    }

    #[test]
    fn test_checksum_of_known_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("abc.txt");
        fs::write(&path, b"abc").unwrap();

        assert_eq!(
            file_checksum(&path).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }
}
