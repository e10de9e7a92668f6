//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fsutil::write_atomic;
use crate::Result;

/// Persisted forwarder position in the reading log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorCheckpoint {
    /// Byte offset of the first record not yet consumed.
    pub offset: u64,
    /// When the checkpoint was written.
    pub updated_at: DateTime<Utc>,
}

/// File-backed store for the forwarder cursor.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    /// Store persisting to `path`.
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Last persisted offset; 0 when nothing has been persisted yet.
    pub fn load(&self) -> Result<u64> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let checkpoint: CursorCheckpoint = serde_json::from_slice(&bytes)?;
                Ok(checkpoint.offset)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically replace the persisted offset.
    pub fn persist(&self, offset: u64) -> Result<()> {
        let checkpoint = CursorCheckpoint {
            offset,
            updated_at: Utc::now(),
        };
        write_atomic(&self.path, &serde_json::to_vec(&checkpoint)?)?;
        debug!(cursor = %self.path.display(), offset, "cursor persisted");
        Ok(())
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_cursor_starts_at_zero() {
        let dir = tempdir().unwrap();
        let store = CursorStore::new(&dir.path().join("cursor.json"));
        assert_eq!(store.load().unwrap(), 0);
    }

    #[test]
    fn persisted_offset_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/cursor.json");
        CursorStore::new(&path).persist(4096).unwrap();
        assert_eq!(CursorStore::new(&path).load().unwrap(), 4096);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["offset"], 4096);
        assert!(raw["updated_at"].is_string());
    }

    #[test]
    fn garbage_cursor_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(CursorStore::new(&path).load().is_err());
    }
}
