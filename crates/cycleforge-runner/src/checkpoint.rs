//! Resumable execution: an append-only file of processed row identifiers.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Raised while loading or appending to a checkpoint file.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CheckpointError {
    #[error("checkpoint I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Tracks which row identifiers have already been processed, backed by a
/// plain-text file (one identifier per line). Thread-safe: `mark_processed`
/// may be called concurrently from parallel row dispatch.
pub struct CheckpointManager {
    path: PathBuf,
    field: String,
    processed: Mutex<HashSet<String>>,
}

impl CheckpointManager {
    /// Loads `path` if it exists (treating a missing file as empty) and
    /// tracks `field` as the row attribute this checkpoint keys on.
    pub fn new(path: impl Into<PathBuf>, field: impl Into<String>) -> Result<Self, CheckpointError> {
        let path = path.into();
        let processed = load_checkpoint(&path)?;
        Ok(Self { path, field: field.into(), processed: Mutex::new(processed) })
    }

    /// The row field this checkpoint keys on.
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn is_processed(&self, row_id: &str) -> bool {
        self.processed.lock().contains(row_id)
    }

    /// Marks `row_id` processed, appending it to the checkpoint file. A
    /// no-op (no write) if already marked.
    pub fn mark_processed(&self, row_id: &str) -> Result<(), CheckpointError> {
        {
            let mut processed = self.processed.lock();
            if processed.contains(row_id) {
                return Ok(());
            }
            processed.insert(row_id.to_string());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|source| CheckpointError::Io { path: self.path.clone(), source })?;
            }
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| CheckpointError::Io { path: self.path.clone(), source })?;
        writeln!(file, "{row_id}").map_err(|source| CheckpointError::Io { path: self.path.clone(), source })
    }
}

fn load_checkpoint(path: &Path) -> Result<HashSet<String>, CheckpointError> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let contents =
        std::fs::read_to_string(path).map_err(|source| CheckpointError::Io { path: path.to_path_buf(), source })?;
    Ok(contents.lines().map(str::trim).filter(|line| !line.is_empty()).map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_and_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.jsonl");

        let manager = CheckpointManager::new(&path, "APPID").unwrap();
        assert!(!manager.is_processed("row-1"));
        manager.mark_processed("row-1").unwrap();
        assert!(manager.is_processed("row-1"));

        let reopened = CheckpointManager::new(&path, "APPID").unwrap();
        assert!(reopened.is_processed("row-1"));
        assert!(!reopened.is_processed("row-2"));
    }

    #[test]
    fn marking_twice_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.jsonl");
        let manager = CheckpointManager::new(&path, "APPID").unwrap();
        manager.mark_processed("row-1").unwrap();
        manager.mark_processed("row-1").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
