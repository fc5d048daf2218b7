//! Wheelhouse archive extraction with a path-escape guard.

use flate2::read::GzDecoder;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("failed to open archive {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("archive entry escapes the destination: {0}")]
    PathEscape(String),

    #[error("failed to extract archive: {0}")]
    Extract(std::io::Error),
}

/// Extract a `.tar.gz` wheelhouse into `destination/wheelhouse`.
///
/// Every entry path is checked before unpacking: absolute paths and
/// parent-traversal components are refused, so no member can land outside the
/// destination.
pub fn extract_wheelhouse(archive_path: &Path, destination: &Path) -> Result<PathBuf, ArchiveError> {
    let wheelhouse = destination.join("wheelhouse");
    std::fs::create_dir_all(&wheelhouse).map_err(ArchiveError::Extract)?;

    let file = std::fs::File::open(archive_path).map_err(|source| ArchiveError::Open {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut archive = Archive::new(GzDecoder::new(file));
    for entry in archive.entries().map_err(ArchiveError::Extract)? {
        let mut entry = entry.map_err(ArchiveError::Extract)?;
        let path = entry.path().map_err(ArchiveError::Extract)?.into_owned();
        if path.is_absolute()
            || path
                .components()
                .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(ArchiveError::PathEscape(path.display().to_string()));
        }
        entry
            .unpack_in(&wheelhouse)
            .map_err(ArchiveError::Extract)?;
    }
    Ok(wheelhouse)
}

/// The install set: every `.whl` under the wheelhouse, in stable order.
pub fn collect_wheels(wheelhouse: &Path) -> Vec<PathBuf> {
    let mut wheels: Vec<PathBuf> = WalkDir::new(wheelhouse)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .map(|ext| ext == "whl")
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();
    wheels.sort();
    wheels
}
