//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Everything the gateway keeps on disk: the append-only reading log that
//! decouples acquisition from forwarding, the forwarder cursor, the
//! credential cache and the discovered device list.
#![warn(missing_docs)]

use std::path::PathBuf;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper for CSV encoding issues.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// The log header does not describe the configured parameters.
    #[error("schema mismatch in {path}: expected [{expected}], found [{found}]")]
    Schema {
        /// Log file.
        path: PathBuf,
        /// Header derived from configuration.
        expected: String,
        /// Header found on disk.
        found: String,
    },
    /// A committed record or the preamble could not be decoded.
    #[error("corrupt record in {path} at byte {offset}: {reason}")]
    Corrupt {
        /// Log file.
        path: PathBuf,
        /// Byte position of the offending line.
        offset: u64,
        /// What failed to decode.
        reason: String,
    },
    /// The cursor points past the end of the log.
    #[error("cursor {cursor} is beyond the end of {path} ({len} bytes)")]
    CursorBeyondEnd {
        /// Log file.
        path: PathBuf,
        /// Requested position.
        cursor: u64,
        /// Current file length.
        len: u64,
    },
}

mod fsutil;

pub mod checkpoint;
pub mod credential_cache;
pub mod device_list;
pub mod reading_log;

pub use checkpoint::{CursorCheckpoint, CursorStore};
pub use credential_cache::CredentialCache;
pub use device_list::{load_device_list, save_device_list};
pub use reading_log::{LogRecord, LogTail, ReadingLogReader, ReadingLogWriter, LOG_MARKER};
