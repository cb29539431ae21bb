//! Quota-aware, sandboxed virtual filesystem storage.
//!
//! Each origin+type store maps virtual paths onto obfuscated backing files,
//! keeps its directory tree in an embedded ordered key-value index, and
//! tracks its byte usage in a small fixed-layout cache file. Storage growth
//! is brokered against an external quota authority through a
//! reserve/commit/release protocol.
//!
//! # Layers
//!
//! ```text
//! StoreRegistry ── ObfuscatedStore ──┬── PathIndex ── KvStore (SQLite)
//!                                    │       └── ConsistencyChecker
//!                                    └── QuotaCoordinator ──┬── UsageCache
//!                                                           └── QuotaAuthorityHandle ─(mpsc)─► authority task
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod layout;
pub mod origin;
pub mod quota;
pub mod store;
pub mod usage;

pub use config::StoreConfig;
pub use error::{OpContext, StoreError};
pub use index::{CheckReport, ConsistencyChecker, FileId, FileInfo, PathIndex};
pub use layout::StoreLayout;
pub use origin::{Origin, StorageType};
pub use quota::{
    InMemoryQuotaAuthority, QuotaAuthority, QuotaAuthorityHandle, QuotaCoordinator, QuotaLedger,
    QuotaReservation, UsageAndQuota,
};
pub use store::{CopyOrMoveMode, EntryMetadata, ObfuscatedStore, StoreRegistry, VirtualPath};
pub use usage::{UsageCache, UsageRecord};
