//! Cached per-store byte usage.

pub mod cache;

pub use cache::{USAGE_MAGIC, USAGE_RECORD_LEN, UsageCache, UsageCacheError, UsageRecord};
