use std::{io, path::PathBuf};

use rusqlite::ErrorCode;
use thiserror::Error;

use super::file_info::FileId;

/// Errors raised by the path index and its consistency checker.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("no entry for file id {0}")]
    NotFound(FileId),

    #[error("'{name}' already exists in directory {parent_id}")]
    AlreadyExists { parent_id: FileId, name: String },

    #[error("file id {0} is not a directory")]
    NotADirectory(FileId),

    #[error("file id {0} is not a file")]
    NotAFile(FileId),

    #[error("directory {0} still has children")]
    NotEmpty(FileId),

    #[error("invalid path component '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The index contents are unreadable or structurally invalid.
    #[error("index corruption: {reason}")]
    Corruption { reason: String },

    #[error("IO error at {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// The consistency checker found drift it could not repair.
    #[error("index is inconsistent: {reason}")]
    Inconsistent { reason: String },

    #[error("index database error: {0}")]
    Sqlite(#[source] rusqlite::Error),
}

impl IndexError {
    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        IndexError::Corruption {
            reason: reason.into(),
        }
    }

    pub(crate) fn inconsistent(reason: impl Into<String>) -> Self {
        IndexError::Inconsistent {
            reason: reason.into(),
        }
    }

    pub(crate) fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        IndexError::Io {
            source,
            path: path.into(),
        }
    }

    /// Whether this error means the database itself can no longer be
    /// trusted (Corruption/IOError), which triggers the recovery path.
    pub fn is_corruption(&self) -> bool {
        matches!(self, IndexError::Corruption { .. } | IndexError::Io { .. })
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
            _ => None,
        };
        match code {
            Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => IndexError::Corruption {
                reason: err.to_string(),
            },
            Some(
                ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::DiskFull
                | ErrorCode::ReadOnly
                | ErrorCode::PermissionDenied,
            ) => IndexError::Io {
                source: io::Error::other(err.to_string()),
                path: PathBuf::new(),
            },
            _ => IndexError::Sqlite(err),
        }
    }
}
