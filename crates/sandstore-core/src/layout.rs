//! On-disk layout of the engine's root directory.
//!
//! ```text
//! <root>/<origin key>/<t|p>/            store directory
//!                          Paths/index.db   path index
//!                          FileSystem.usage usage cache
//!                          00/00000000      backing files
//! ```

use std::path::{Path, PathBuf};

use crate::config::{INDEX_DB_FILE_NAME, INDEX_DIR_NAME, USAGE_FILE_NAME};
use crate::origin::{Origin, StorageType};

/// Resolves store-level paths below a root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of every store belonging to `origin`.
    pub fn origin_dir(&self, origin: &Origin) -> PathBuf {
        self.root.join(origin.storage_key())
    }

    /// Directory of one origin+type store.
    pub fn store_dir(&self, origin: &Origin, storage_type: StorageType) -> PathBuf {
        self.origin_dir(origin).join(storage_type.dir_name())
    }

    /// Usage cache file of one origin+type store.
    pub fn usage_cache_path(&self, origin: &Origin, storage_type: StorageType) -> PathBuf {
        Self::usage_cache_path_in(&self.store_dir(origin, storage_type))
    }

    pub fn index_dir_in(store_dir: &Path) -> PathBuf {
        store_dir.join(INDEX_DIR_NAME)
    }

    pub fn index_db_in(store_dir: &Path) -> PathBuf {
        Self::index_dir_in(store_dir).join(INDEX_DB_FILE_NAME)
    }

    pub fn usage_cache_path_in(store_dir: &Path) -> PathBuf {
        store_dir.join(USAGE_FILE_NAME)
    }
}
