//! SHA-256 checksum manifests: `<sha256-hex>  <filename>` lines, two spaces.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

/// One parsed manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub sha256: String,
    pub filename: String,
}

/// Parse a checksum manifest. Blank lines and `#` comments are ignored;
/// malformed lines are dropped (the authoritative entry is matched by
/// filename, so junk lines cannot vouch for an asset).
pub fn parse_manifest(text: &str) -> Vec<ManifestEntry> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (digest, name) = line.split_once("  ")?;
            let digest = digest.trim().to_ascii_lowercase();
            // `sha256sum -b` prefixes binary-mode names with `*`.
            let name = name.trim().trim_start_matches('*').to_string();
            if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                return None;
            }
            Some(ManifestEntry {
                sha256: digest,
                filename: name,
            })
        })
        .collect()
}

/// Find the authoritative entry for `filename`.
pub fn entry_for<'a>(entries: &'a [ManifestEntry], filename: &str) -> Option<&'a ManifestEntry> {
    entries.iter().find(|entry| entry.filename == filename)
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String, ChecksumError> {
    let mut file = std::fs::File::open(path).map_err(|source| ChecksumError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|source| ChecksumError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory buffer, lowercase hex.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
