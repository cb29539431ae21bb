//! Security principals and storage types that scope a store.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

/// The security principal a sandboxed store is scoped to (e.g.
/// `https://example.com`).
///
/// Origins are opaque to the engine; they are only compared and turned into
/// a directory name with [`Origin::storage_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Origin(String);

impl Origin {
    pub fn new(origin: impl Into<String>) -> Self {
        Origin(origin.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe directory name for this origin.
    ///
    /// URL-safe base64 without padding never contains `/`, `.` or `:`, so
    /// every origin maps to exactly one plain directory name.
    pub fn storage_key(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.as_bytes())
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Origin {
    fn from(s: &str) -> Self {
        Origin::new(s)
    }
}

/// Storage type; each origin has an independent store per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Temporary,
    Persistent,
}

impl StorageType {
    /// Directory name of this type inside an origin directory.
    pub fn dir_name(self) -> &'static str {
        match self {
            StorageType::Temporary => "t",
            StorageType::Persistent => "p",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Temporary => f.write_str("temporary"),
            StorageType::Persistent => f.write_str("persistent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_is_plain_name() {
        let origin = Origin::new("https://example.com:8443");
        let key = origin.storage_key();
        assert!(!key.contains('/'));
        assert!(!key.contains(':'));
        assert!(!key.contains('.'));
        assert_ne!(key, Origin::new("https://example.org:8443").storage_key());
    }

    #[test]
    fn test_storage_type_dirs() {
        assert_eq!(StorageType::Temporary.dir_name(), "t");
        assert_eq!(StorageType::Persistent.dir_name(), "p");
        assert_eq!(StorageType::Persistent.to_string(), "persistent");
    }
}
