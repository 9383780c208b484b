//! Atomic pagination checkpoint file
//!
//! The checkpoint is a small JSON document replaced atomically: written to a
//! temporary sibling, `fsync`ed, renamed over the old file, and the directory
//! `fsync`ed. A crash at any point leaves either the old or the new version.

use crate::storage::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Persisted pagination progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,

    /// Highest page whose records are all durable; 0 when none
    pub last_completed_page: u32,

    pub total_pages_known: Option<u32>,

    /// Pages given up on, in the order they were abandoned
    #[serde(default)]
    pub abandoned_pages: Vec<u32>,

    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        last_completed_page: u32,
        total_pages_known: Option<u32>,
        abandoned_pages: Vec<u32>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            last_completed_page,
            total_pages_known,
            abandoned_pages,
            updated_at: Utc::now(),
        }
    }
}

/// Location of the checkpoint file
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the checkpoint
    ///
    /// # Returns
    ///
    /// * `Ok(None)` - No checkpoint file exists
    /// * `Ok(Some(checkpoint))` - A valid checkpoint
    /// * `Err(StorageError::CorruptCheckpoint)` - The file exists but cannot be trusted
    pub fn load(&self) -> StorageResult<Option<Checkpoint>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            StorageError::CorruptCheckpoint(format!("{}: {}", self.path.display(), e))
        })?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(StorageError::CorruptCheckpoint(format!(
                "{}: unsupported version {}",
                self.path.display(),
                checkpoint.version
            )));
        }

        Ok(Some(checkpoint))
    }

    /// Atomically replaces the checkpoint file
    pub fn save(&self, checkpoint: &Checkpoint) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let tmp_path = self.temp_path();
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&json)?;
            tmp.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;
        sync_dir(parent)?;

        debug!(
            last_completed_page = checkpoint.last_completed_page,
            "Checkpoint written"
        );
        Ok(())
    }

    /// Removes the checkpoint file if present
    pub fn clear(&self) -> StorageResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
