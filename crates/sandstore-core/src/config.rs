//! Store configuration.
//!
//! [`StoreConfig`] is plain serde data so it can be embedded in whatever
//! configuration file the host application already has, or loaded on its
//! own from JSON with [`StoreConfig::from_json_file`].

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the directory (inside a store directory) holding the path index.
pub const INDEX_DIR_NAME: &str = "Paths";

/// Name of the SQLite database file inside [`INDEX_DIR_NAME`].
pub const INDEX_DB_FILE_NAME: &str = "index.db";

/// Name of the usage cache file inside a store directory.
pub const USAGE_FILE_NAME: &str = "FileSystem.usage";

/// Fixed quota cost charged for every path row.
pub const DEFAULT_PATH_CREATION_COST: i64 = 146;

/// Additional quota cost per byte of a path component name.
pub const DEFAULT_PATH_BYTE_COST: i64 = 2;

/// Default per-origin quota handed out by the in-memory authority (10 GiB).
pub const DEFAULT_QUOTA: i64 = 10 * 1024 * 1024 * 1024;

/// Errors raised while loading or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Handle caching policy for the usage cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageCacheConfig {
    /// Maximum number of usage files kept open at once.
    pub max_open_handles: usize,
    /// Idle time after which every cached handle is closed.
    pub close_delay_ms: u64,
}

impl Default for UsageCacheConfig {
    fn default() -> Self {
        Self {
            max_open_handles: 2,
            close_delay_ms: 5_000,
        }
    }
}

impl UsageCacheConfig {
    #[inline]
    pub fn close_delay(&self) -> Duration {
        Duration::from_millis(self.close_delay_ms)
    }
}

/// Top-level configuration of the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding every origin's stores.
    pub root_dir: PathBuf,
    /// Fixed cost of one path row.
    pub path_creation_cost: i64,
    /// Cost per byte of a path component.
    pub path_byte_cost: i64,
    /// Quota granted to origins without an explicit override.
    pub default_quota: i64,
    pub usage_cache: UsageCacheConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("sandstore"),
            path_creation_cost: DEFAULT_PATH_CREATION_COST,
            path_byte_cost: DEFAULT_PATH_BYTE_COST,
            default_quota: DEFAULT_QUOTA,
            usage_cache: UsageCacheConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Default configuration rooted at `root_dir`.
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        Self::from_json_str(&json)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path_creation_cost < 0 {
            return Err(ConfigError::Invalid {
                field: "path_creation_cost",
                reason: format!("must not be negative, got {}", self.path_creation_cost),
            });
        }
        if self.path_byte_cost < 0 {
            return Err(ConfigError::Invalid {
                field: "path_byte_cost",
                reason: format!("must not be negative, got {}", self.path_byte_cost),
            });
        }
        if self.default_quota < 0 {
            return Err(ConfigError::Invalid {
                field: "default_quota",
                reason: format!("must not be negative, got {}", self.default_quota),
            });
        }
        if self.usage_cache.max_open_handles == 0 {
            return Err(ConfigError::Invalid {
                field: "usage_cache.max_open_handles",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Quota cost of one path row whose last component is `name`.
    #[inline]
    pub fn path_cost(&self, name: &str) -> i64 {
        self.path_creation_cost + name.len() as i64 * self.path_byte_cost
    }
}
