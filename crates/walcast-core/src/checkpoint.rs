//! Durable resume position.
//!
//! The session writes the highest fully dispatched WAL position here whenever
//! it acknowledges progress to the server, and reads it back at startup.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Last acknowledged position for a logical consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Slot prefix the position belongs to.
    pub consumer: String,
    /// The last fully dispatched LSN.
    pub lsn: u64,
    /// Number of events dispatched across runs.
    pub events_dispatched: u64,
    /// Last update timestamp.
    pub updated_at: Option<DateTime<Utc>>,
}

/// JSON file holding one checkpoint.
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

    /// Read the stored checkpoint. A missing file means no checkpoint yet.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint = serde_json::from_str(&content).map_err(|e| {
            Error::Checkpoint(format!("{}: {}", self.path.display(), e))
        })?;

        Ok(Some(checkpoint))
    }

    /// Replace the stored checkpoint. Written to a sibling file and renamed so a
    /// crash never leaves a truncated checkpoint behind.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut stamped = checkpoint.clone();
        stamped.updated_at = Some(Utc::now());

        let json = serde_json::to_vec_pretty(&stamped)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), lsn = stamped.lsn, "Saved checkpoint");
        Ok(())
    }
}
