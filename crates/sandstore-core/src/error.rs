//! Error types surfaced by store operations.
//!
//! Each layer has its own error enum ([`IndexError`], [`UsageCacheError`],
//! [`QuotaError`], [`ConfigError`]). [`StoreError`] is what
//! [`ObfuscatedStore`](crate::ObfuscatedStore) returns: lower-layer errors
//! that have a user-facing meaning are mapped onto it with an [`OpContext`]
//! naming the virtual path involved, everything else is wrapped as is.

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::index::IndexError;
pub use crate::quota::QuotaError;
pub use crate::usage::UsageCacheError;

use crate::index::FileId;

/// Where a store operation failed, for error messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpContext {
    /// Virtual path the caller passed in.
    pub virtual_path: Option<String>,
    pub file_id: Option<FileId>,
    /// Backing file on disk.
    pub backing_path: Option<PathBuf>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_virtual_path(mut self, path: impl Into<String>) -> Self {
        self.virtual_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_file_id(mut self, id: FileId) -> Self {
        self.file_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_backing_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backing_path = Some(path.into());
        self
    }
}

impl fmt::Display for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ref path) = self.virtual_path {
            parts.push(format!("path '{path}'"));
        }
        if let Some(id) = self.file_id {
            parts.push(format!("file id {id}"));
        }
        if let Some(ref backing) = self.backing_path {
            parts.push(format!("at {:?}", backing.display()));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Path not found: '{path}'")]
    NotFound { path: String },

    #[error("Path already exists: '{path}'")]
    AlreadyExists { path: String },

    #[error("Expected directory but found file: '{path}'")]
    NotADirectory { path: String },

    #[error("Expected file but found directory: '{path}'")]
    NotAFile { path: String },

    #[error("Directory not empty: '{path}'")]
    NotEmpty { path: String },

    #[error("No space for {context}: requested {requested} bytes with {usage} of {quota} in use")]
    NoSpace {
        requested: i64,
        usage: i64,
        quota: i64,
        context: OpContext,
    },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid operation for {context}: {reason}")]
    InvalidOperation { reason: String, context: OpContext },

    #[error("Store corruption for {context}: {reason}")]
    Corruption { reason: String, context: OpContext },

    #[error("IO error for {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: OpContext,
    },

    /// A mutation reached disk but its usage could not be recorded.
    ///
    /// The store checks itself before its next mutation.
    #[error("Fatal inconsistency for {context}: {reason}")]
    FatalInconsistency { reason: String, context: OpContext },

    #[error("Path index error: {0}")]
    Index(#[from] IndexError),

    #[error("Usage cache error: {0}")]
    UsageCache(#[from] UsageCacheError),

    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl StoreError {
    pub(crate) fn io(source: io::Error, context: OpContext) -> Self {
        StoreError::Io { source, context }
    }

    pub(crate) fn invalid_operation(reason: impl Into<String>, path: &str) -> Self {
        StoreError::InvalidOperation {
            reason: reason.into(),
            context: OpContext::new().with_virtual_path(path),
        }
    }

    /// Map an index error onto the user-facing taxonomy for `path`.
    pub(crate) fn from_index(err: IndexError, path: &str) -> Self {
        let path_owned = || path.to_string();
        match err {
            IndexError::NotFound(_) => StoreError::NotFound { path: path_owned() },
            IndexError::AlreadyExists { .. } => StoreError::AlreadyExists { path: path_owned() },
            IndexError::NotADirectory(_) => StoreError::NotADirectory { path: path_owned() },
            IndexError::NotAFile(_) => StoreError::NotAFile { path: path_owned() },
            IndexError::NotEmpty(_) => StoreError::NotEmpty { path: path_owned() },
            IndexError::InvalidName { reason, .. } => StoreError::InvalidPath {
                path: path_owned(),
                reason: reason.to_string(),
            },
            IndexError::InvalidArgument(reason) => StoreError::invalid_operation(reason, path),
            IndexError::Corruption { reason } | IndexError::Inconsistent { reason } => StoreError::Corruption {
                reason,
                context: OpContext::new().with_virtual_path(path),
            },
            IndexError::Io { source, path: at } => StoreError::Io {
                source,
                context: OpContext::new().with_virtual_path(path).with_backing_path(at),
            },
            other @ IndexError::Sqlite(_) => StoreError::Index(other),
        }
    }

    /// Map a quota error onto the user-facing taxonomy for `path`.
    pub(crate) fn from_quota(err: QuotaError, path: &str) -> Self {
        match err {
            QuotaError::NoSpace {
                requested,
                usage,
                quota,
            } => StoreError::NoSpace {
                requested,
                usage,
                quota,
                context: OpContext::new().with_virtual_path(path),
            },
            other => StoreError::Quota(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_no_space(&self) -> bool {
        matches!(self, StoreError::NoSpace { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display() {
        assert_eq!(OpContext::new().to_string(), "(no context)");
        let ctx = OpContext::new()
            .with_virtual_path("a/b")
            .with_file_id(FileId::new(3))
            .with_backing_path("/s/00/00000003");
        assert_eq!(ctx.to_string(), "path 'a/b', file id 3, at \"/s/00/00000003\"");
    }

    #[test]
    fn test_index_errors_map_to_store_errors() {
        let err = StoreError::from_index(IndexError::NotFound(FileId::new(9)), "x/y");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Path not found: 'x/y'");

        let err = StoreError::from_index(
            IndexError::AlreadyExists {
                parent_id: FileId::ROOT,
                name: "y".into(),
            },
            "y",
        );
        assert!(matches!(err, StoreError::AlreadyExists { .. }));

        let err = StoreError::from_index(IndexError::corruption("bad"), "z");
        assert!(matches!(err, StoreError::Corruption { .. }));
    }

    #[test]
    fn test_no_space_keeps_numbers() {
        let err = StoreError::from_quota(
            QuotaError::NoSpace {
                requested: 10,
                usage: 95,
                quota: 100,
            },
            "big.bin",
        );
        assert!(err.is_no_space());
        assert!(err.to_string().contains("requested 10 bytes with 95 of 100 in use"));
    }
}
