//! Error types for stack operations
//!
//! Each concern gets its own enum so a store that never attached can be told
//! apart from a save that failed halfway through a population run. Variants
//! carry the store path and the underlying cause for diagnostics.

use std::path::{Path, PathBuf};

use rusqlite::ErrorCode;
use thiserror::Error;

/// Failure to dispatch work onto a lane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaneError {
    /// The lane thread has exited and no longer accepts work
    #[error("lane '{lane}' is closed")]
    Closed {
        /// Name of the lane
        lane: String,
    },

    /// Synchronous dispatch was issued from the lane onto itself
    #[error("synchronous dispatch onto lane '{lane}' from the lane itself")]
    Reentrant {
        /// Name of the lane
        lane: String,
    },

    /// The OS refused to start the lane thread
    #[error("failed to spawn lane '{lane}': {message}")]
    Spawn {
        /// Name of the lane
        lane: String,
        /// Description from the OS
        message: String,
    },
}

/// Unrecoverable failure while opening a store. Fatal at startup.
#[derive(Debug, Error)]
pub enum StoreOpenError {
    /// The schema file does not exist
    #[error("schema not found at {}", path.display())]
    SchemaMissing {
        /// Expected schema location
        path: PathBuf,
    },

    /// The schema could not be read or does not describe a record table
    #[error("schema '{source_name}' is invalid: {reason}")]
    SchemaInvalid {
        /// Schema name (file stem or "builtin")
        source_name: String,
        /// What is wrong with it
        reason: String,
    },

    /// The store file could not be created, opened or read
    #[error("failed to attach store at {}: {cause}", path.display())]
    Attach {
        /// Store file path
        path: PathBuf,
        /// Underlying cause
        cause: String,
    },

    /// A context lane could not be started while building a topology
    #[error(transparent)]
    Lane(#[from] LaneError),
}

/// Failure to persist a context's pending changes.
///
/// A save is all-or-nothing: when this is returned, the context still holds
/// its full pending change set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveError {
    /// Schema or uniqueness constraint violated. Retrying will not help.
    #[error("constraint violated in {}: {message}", path.display())]
    Constraint {
        /// Store file path
        path: PathBuf,
        /// SQLite diagnostic
        message: String,
    },

    /// Physical commit failed
    #[error("commit to {} failed: {message}", path.display())]
    Io {
        /// Store file path
        path: PathBuf,
        /// SQLite diagnostic
        message: String,
        /// Busy/locked database, worth retrying
        transient: bool,
    },

    /// The parent context's lane is gone
    #[error(transparent)]
    Lane(#[from] LaneError),
}

impl SaveError {
    /// Classify a SQLite failure raised while committing to `path`.
    pub(crate) fn from_sqlite(path: &Path, err: rusqlite::Error) -> Self {
        let code = err.sqlite_error_code();
        let message = err.to_string();
        match code {
            Some(ErrorCode::ConstraintViolation) => SaveError::Constraint {
                path: path.to_path_buf(),
                message,
            },
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => SaveError::Io {
                path: path.to_path_buf(),
                message,
                transient: true,
            },
            _ => SaveError::Io {
                path: path.to_path_buf(),
                message,
                transient: false,
            },
        }
    }

    /// Whether the same save may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, SaveError::Io { transient: true, .. })
    }
}

/// Failure to fetch a page. An empty page is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The page predicate cannot be built from these bounds
    #[error("invalid page range: start {start}, batch size {batch_size}")]
    InvalidRange {
        /// First number of the page
        start: i32,
        /// Numbers per page
        batch_size: i32,
    },

    /// The context's lane (or an ancestor's) is gone
    #[error(transparent)]
    Lane(#[from] LaneError),
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Result type alias for save operations
pub type SaveResult<T> = Result<T, SaveError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), Some("boom".into()))
    }

    #[test]
    fn test_error_display() {
        let err = StoreOpenError::Attach {
            path: PathBuf::from("/tmp/SessionsDB.sqlite"),
            cause: "disk I/O error".into(),
        };
        let display = err.to_string();
        assert!(display.contains("/tmp/SessionsDB.sqlite"));
        assert!(display.contains("disk I/O error"));

        let err = FetchError::InvalidRange { start: 5, batch_size: 0 };
        assert!(err.to_string().contains("batch size 0"));
    }

    #[test]
    fn test_constraint_classification() {
        let err = SaveError::from_sqlite(Path::new("a.sqlite"), sqlite_failure(ffi::SQLITE_CONSTRAINT));
        assert!(matches!(err, SaveError::Constraint { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_busy_is_transient() {
        let err = SaveError::from_sqlite(Path::new("a.sqlite"), sqlite_failure(ffi::SQLITE_BUSY));
        assert!(err.is_transient());

        let err = SaveError::from_sqlite(Path::new("a.sqlite"), sqlite_failure(ffi::SQLITE_IOERR));
        assert!(matches!(err, SaveError::Io { transient: false, .. }));
    }

    #[test]
    fn test_lane_error_conversion() {
        let lane = LaneError::Closed { lane: "main-1".into() };
        let save: SaveError = lane.clone().into();
        assert_eq!(save, SaveError::Lane(lane.clone()));
        let fetch: FetchError = lane.into();
        assert!(fetch.to_string().contains("main-1"));
    }
}
