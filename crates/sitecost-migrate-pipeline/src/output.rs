//! Write-once JSON files and digests shared by snapshots and reports.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// A file written by [`write_json_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub sha256: String,
}

/// Serialize `value` as pretty JSON into `dir/file_name`, refusing to replace an existing file.
///
/// # Errors
/// Returns an error when the directory cannot be created, the file already exists, or the
/// write fails.
pub fn write_json_once<T: Serialize>(dir: &Path, file_name: &str, value: &T) -> Result<WrittenFile> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    let path = dir.join(file_name);
    let mut bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize {file_name}"))?;
    bytes.push(b'\n');

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("refusing to overwrite or failed to create {}", path.display()))?;
    file.write_all(&bytes).with_context(|| format!("failed to write {}", path.display()))?;
    file.flush().with_context(|| format!("failed to flush {}", path.display()))?;

    Ok(WrittenFile { path, sha256: sha256_hex(&bytes) })
}

/// # Errors
/// Returns an error when the file cannot be read or does not parse as `T`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse JSON {}", path.display()))
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// # Errors
/// Returns an error when the file cannot be read.
pub fn file_sha256(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(sha256_hex(&bytes))
}
