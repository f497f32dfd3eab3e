use crate::error::{PmwError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Prevents partial writes from corrupting plan artifacts.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Write a file only if it does not already exist. Returns true if written.
pub fn write_if_missing(path: &Path, data: &[u8]) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    atomic_write(path, data)?;
    Ok(true)
}

/// Serialize `value` as YAML and write it atomically.
pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_yaml::to_string(value)?;
    atomic_write(path, data.as_bytes())
}

/// Read a YAML artifact. A parse failure is reported as a schema violation
/// naming `artifact`, not as a bare serde error.
pub fn read_yaml<T: DeserializeOwned>(path: &Path, artifact: &str) -> Result<T> {
    let data = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&data).map_err(|e| PmwError::SchemaViolation {
        artifact: artifact.to_string(),
        reason: e.to_string(),
    })
}

/// Like [`read_yaml`] but yields `None` when the file does not exist or is empty.
pub fn read_yaml_optional<T: DeserializeOwned>(path: &Path, artifact: &str) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Ok(None);
    }
    serde_yaml::from_str(&data)
        .map(Some)
        .map_err(|e| PmwError::SchemaViolation {
            artifact: artifact.to_string(),
            reason: e.to_string(),
        })
}
