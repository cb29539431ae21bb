//! Shared table of open stores.
//!
//! Each origin+type store must see its operations one at a time. The
//! registry hands out a single `Arc<tokio::sync::Mutex<ObfuscatedStore>>`
//! per key, and that mutex is the sequence every caller goes through. The
//! store itself is opened once per key; callers arriving while it opens
//! wait for that open instead of running their own.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument};

use super::obfuscated::ObfuscatedStore;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::layout::StoreLayout;
use crate::origin::{Origin, StorageType};
use crate::quota::{QuotaAuthorityHandle, QuotaCoordinator};

pub type SharedStore = Arc<Mutex<ObfuscatedStore>>;

type StoreSlot = Arc<OnceCell<SharedStore>>;

/// Open stores keyed by origin and storage type.
///
/// Construct one per engine root and share it with `Arc`.
///
/// ```ignore
/// let registry = StoreRegistry::new(config, authority_handle);
/// let store = registry.get_or_open(&origin, StorageType::Persistent).await?;
/// store.lock().await.ensure_file_exists(&"notes.txt".into()).await?;
/// ```
#[derive(Debug)]
pub struct StoreRegistry {
    config: StoreConfig,
    coordinator: Arc<QuotaCoordinator>,
    stores: DashMap<(Origin, StorageType), StoreSlot>,
}

impl StoreRegistry {
    /// Registry over `config.root_dir`, talking to the given authority.
    pub fn new(config: StoreConfig, authority: QuotaAuthorityHandle) -> Self {
        let coordinator = QuotaCoordinator::new(
            authority,
            StoreLayout::new(&config.root_dir),
            &config.usage_cache,
        );
        Self {
            config,
            coordinator: Arc::new(coordinator),
            stores: DashMap::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[inline]
    pub fn coordinator(&self) -> &Arc<QuotaCoordinator> {
        &self.coordinator
    }

    /// The store for `origin`/`storage_type`, opening it on first use.
    ///
    /// Callers racing on the same key share one open. A failed open leaves
    /// nothing behind, so the next call tries again.
    #[instrument(level = "debug", skip(self), fields(%origin, %storage_type))]
    pub async fn get_or_open(&self, origin: &Origin, storage_type: StorageType) -> Result<SharedStore, StoreError> {
        let key = (origin.clone(), storage_type);
        let slot = Arc::clone(self.stores.entry(key.clone()).or_default().value());

        let opened = slot
            .get_or_try_init(|| async {
                let store =
                    ObfuscatedStore::open(&self.config, origin.clone(), storage_type, Arc::clone(&self.coordinator))
                        .await?;
                debug!("Store registered");
                Ok::<_, StoreError>(Arc::new(Mutex::new(store)))
            })
            .await;
        match opened {
            Ok(store) => Ok(Arc::clone(store)),
            Err(e) => {
                self.stores
                    .remove_if(&key, |_, current| Arc::ptr_eq(current, &slot) && !current.initialized());
                Err(e)
            }
        }
    }

    /// Drop a store from the registry. Outstanding handles stay usable.
    pub fn remove(&self, origin: &Origin, storage_type: StorageType) -> Option<SharedStore> {
        self.stores
            .remove(&(origin.clone(), storage_type))
            .and_then(|(_, slot)| slot.get().cloned())
    }

    /// Number of open stores.
    pub fn len(&self) -> usize {
        self.stores.iter().filter(|entry| entry.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of every open store, sorted.
    pub fn origins(&self) -> Vec<(Origin, StorageType)> {
        let mut keys: Vec<_> = self
            .stores
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drop every store and close cached usage file handles.
    pub fn clear(&self) {
        self.stores.clear();
        self.coordinator.close_cache_files();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::InMemoryQuotaAuthority;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> StoreRegistry {
        let config = StoreConfig::with_root(dir.path());
        let (handle, _task) = QuotaAuthorityHandle::spawn(InMemoryQuotaAuthority::new(config.default_quota));
        StoreRegistry::new(config, handle)
    }

    #[tokio::test]
    async fn test_same_key_shares_one_store() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let origin = Origin::new("https://a.test");

        let first = registry.get_or_open(&origin, StorageType::Temporary).await.unwrap();
        let second = registry.get_or_open(&origin, StorageType::Temporary).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = registry.get_or_open(&origin, StorageType::Persistent).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.origins(),
            vec![
                (origin.clone(), StorageType::Temporary),
                (origin.clone(), StorageType::Persistent)
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_first_opens_share_one_instance() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(registry(&dir));
        let origin = Origin::new("https://race.test");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let origin = origin.clone();
                tokio::spawn(async move { registry.get_or_open(&origin, StorageType::Temporary).await.unwrap() })
            })
            .collect();
        let mut stores = Vec::new();
        for task in tasks {
            stores.push(task.await.unwrap());
        }

        assert!(stores.iter().all(|store| Arc::ptr_eq(store, &stores[0])));
        assert_eq!(registry.len(), 1);
        let record = registry
            .coordinator()
            .usage_record(&origin, StorageType::Temporary)
            .unwrap();
        assert_eq!(record.dirty, 0);
        assert!(record.is_valid);
    }

    #[tokio::test]
    async fn test_failed_open_is_retried() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let origin = Origin::new("https://a.test");
        let origin_dir = registry.coordinator().layout().origin_dir(&origin);
        std::fs::write(&origin_dir, b"not a directory").unwrap();

        assert!(registry.get_or_open(&origin, StorageType::Temporary).await.is_err());
        assert!(registry.is_empty());
        assert!(registry.origins().is_empty());

        std::fs::remove_file(&origin_dir).unwrap();
        registry.get_or_open(&origin, StorageType::Temporary).await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let origin = Origin::new("https://a.test");

        let store = registry.get_or_open(&origin, StorageType::Temporary).await.unwrap();
        let removed = registry.remove(&origin, StorageType::Temporary).unwrap();
        assert!(Arc::ptr_eq(&store, &removed));
        assert!(registry.is_empty());
        assert!(registry.remove(&origin, StorageType::Temporary).is_none());

        registry.get_or_open(&origin, StorageType::Temporary).await.unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }
}
