//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use sandstore_core::{
    InMemoryQuotaAuthority, ObfuscatedStore, Origin, QuotaAuthorityHandle, QuotaCoordinator, QuotaLedger,
    StorageType, StoreConfig, StoreLayout,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const TYPE: StorageType = StorageType::Temporary;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn origin() -> Origin {
    Origin::new("https://example.test")
}

/// Everything one store needs, plus the pieces tests poke at directly.
pub struct Harness {
    pub dir: TempDir,
    pub config: StoreConfig,
    pub ledger: QuotaLedger,
    pub coordinator: Arc<QuotaCoordinator>,
    pub authority_task: JoinHandle<()>,
}

impl Harness {
    /// Default path costs and the given quota.
    pub fn new(quota: i64) -> Self {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            default_quota: quota,
            ..StoreConfig::with_root(dir.path())
        };
        Self::reusing(dir, config)
    }

    /// Paths cost nothing, so usage is the sum of the file sizes.
    pub fn without_path_cost(quota: i64) -> Self {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            default_quota: quota,
            path_creation_cost: 0,
            path_byte_cost: 0,
            ..StoreConfig::with_root(dir.path())
        };
        Self::reusing(dir, config)
    }

    /// A fresh authority and coordinator over an existing root.
    pub fn reusing(dir: TempDir, config: StoreConfig) -> Self {
        init_tracing();
        let authority = InMemoryQuotaAuthority::new(config.default_quota);
        let ledger = authority.ledger();
        let (handle, authority_task) = QuotaAuthorityHandle::spawn(authority);
        let coordinator = Arc::new(QuotaCoordinator::new(
            handle,
            StoreLayout::new(&config.root_dir),
            &config.usage_cache,
        ));
        Self {
            dir,
            config,
            ledger,
            coordinator,
            authority_task,
        }
    }

    pub async fn open(&self) -> ObfuscatedStore {
        ObfuscatedStore::open(&self.config, origin(), TYPE, Arc::clone(&self.coordinator))
            .await
            .unwrap()
    }

    /// Raw bytes of the usage cache file.
    pub fn usage_file(&self) -> Vec<u8> {
        std::fs::read(self.coordinator.usage_cache_path(&origin(), TYPE)).unwrap()
    }

    /// Usage the authority holds once every pending notification landed.
    pub async fn authority_usage(&self) -> i64 {
        self.coordinator.usage_and_quota(&origin(), TYPE).await.unwrap().usage
    }
}

/// Write a file of `len` bytes outside any store and return its path.
pub fn foreign_file(dir: &TempDir, name: &str, len: usize) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, vec![0xA5u8; len]).unwrap();
    path
}
