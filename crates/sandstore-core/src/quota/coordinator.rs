//! Reserve, commit and release of storage growth.
//!
//! Growth is reserved before any mutation. A granted reservation is applied
//! to the authority's live counter straight away so overlapping
//! reservations see it. Once the mutation is done the caller commits the
//! realized delta, which is the only durable write to the usage cache, and
//! then releases the reservation, which takes the provisional amount back
//! out of the authority's counter.
//!
//! Nothing here serializes reservations for the same origin; callers do.
//!
//! Usage files stay open between accesses. When a tokio runtime is around,
//! a background task closes them once they have been idle for the
//! configured delay.

use std::{
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, trace, warn};

use super::authority::{QuotaAuthorityHandle, UsageAndQuota};
use super::error::QuotaError;
use crate::config::UsageCacheConfig;
use crate::layout::StoreLayout;
use crate::origin::{Origin, StorageType};
use crate::usage::{UsageCache, UsageCacheError, UsageRecord};

/// A granted, not yet released reservation.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation must be released with QuotaCoordinator::release_reserved_quota"]
pub struct QuotaReservation {
    pub origin: Origin,
    pub storage_type: StorageType,
    pub size: i64,
}

#[derive(Debug)]
pub struct QuotaCoordinator {
    authority: QuotaAuthorityHandle,
    usage_cache: Arc<Mutex<UsageCache>>,
    close_timer_armed: Arc<AtomicBool>,
    layout: StoreLayout,
}

impl QuotaCoordinator {
    pub fn new(authority: QuotaAuthorityHandle, layout: StoreLayout, cache_config: &UsageCacheConfig) -> Self {
        Self {
            authority,
            usage_cache: Arc::new(Mutex::new(UsageCache::new(cache_config))),
            close_timer_armed: Arc::new(AtomicBool::new(false)),
            layout,
        }
    }

    #[inline]
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn usage_cache_path(&self, origin: &Origin, storage_type: StorageType) -> PathBuf {
        self.layout.usage_cache_path(origin, storage_type)
    }

    /// What the authority currently holds for the store. Answered after
    /// every notification sent before this call.
    pub async fn usage_and_quota(
        &self,
        origin: &Origin,
        storage_type: StorageType,
    ) -> Result<UsageAndQuota, QuotaError> {
        self.authority.get_usage_and_quota(origin, storage_type).await
    }

    /// Ask the authority for room to grow by `delta` bytes.
    ///
    /// Denial changes nothing. A grant is applied to the authority's live
    /// counter before this returns.
    #[instrument(level = "debug", skip(self), fields(%origin, %storage_type))]
    pub async fn reserve_quota(
        &self,
        origin: &Origin,
        storage_type: StorageType,
        delta: i64,
    ) -> Result<QuotaReservation, QuotaError> {
        if delta < 0 {
            return Err(QuotaError::InvalidDelta(delta));
        }
        if delta > 0 {
            let current = self.usage_and_quota(origin, storage_type).await?;
            if current.usage.saturating_add(delta) > current.quota {
                warn!(
                    requested = delta,
                    usage = current.usage,
                    quota = current.quota,
                    "Quota reservation denied"
                );
                return Err(QuotaError::NoSpace {
                    requested: delta,
                    usage: current.usage,
                    quota: current.quota,
                });
            }
            self.authority.notify_storage_modified(origin, storage_type, delta)?;
            debug!(granted = delta, "Quota reserved");
        }
        Ok(QuotaReservation {
            origin: origin.clone(),
            storage_type,
            size: delta,
        })
    }

    /// Take a reservation's provisional amount back out of the authority.
    pub fn release_reserved_quota(&self, reservation: QuotaReservation) -> Result<(), QuotaError> {
        if reservation.size < 0 {
            return Err(QuotaError::InvalidDelta(reservation.size));
        }
        if reservation.size == 0 {
            return Ok(());
        }
        self.authority
            .notify_storage_modified(&reservation.origin, reservation.storage_type, -reservation.size)
    }

    /// Record a realized usage change durably and tell the authority.
    #[instrument(level = "debug", skip(self), fields(%origin, %storage_type))]
    pub fn commit_quota_usage(&self, origin: &Origin, storage_type: StorageType, delta: i64) -> Result<(), QuotaError> {
        if delta == 0 {
            return Ok(());
        }
        self.authority.notify_storage_modified(origin, storage_type, delta)?;
        let path = self.usage_cache_path(origin, storage_type);
        let usage = self.cache().atomic_update_usage_by_delta(&path, delta)?;
        debug!(delta, usage, "Quota usage committed");
        Ok(())
    }

    pub fn increment_dirty_count(&self, origin: &Origin, storage_type: StorageType) -> Result<u32, QuotaError> {
        let path = self.usage_cache_path(origin, storage_type);
        Ok(self.cache().increment_dirty(&path)?)
    }

    pub fn decrement_dirty_count(&self, origin: &Origin, storage_type: StorageType) -> Result<u32, QuotaError> {
        let path = self.usage_cache_path(origin, storage_type);
        Ok(self.cache().decrement_dirty(&path)?)
    }

    /// Store a freshly recomputed absolute usage (valid, dirty 0).
    pub fn update_usage(&self, origin: &Origin, storage_type: StorageType, usage: i64) -> Result<(), QuotaError> {
        let path = self.usage_cache_path(origin, storage_type);
        Ok(self.cache().update_usage(&path, usage)?)
    }

    /// Mark the cached usage untrustworthy. A missing cache is left missing.
    pub fn invalidate_usage(&self, origin: &Origin, storage_type: StorageType) -> Result<(), QuotaError> {
        let path = self.usage_cache_path(origin, storage_type);
        match self.cache().invalidate(&path) {
            Ok(()) | Err(UsageCacheError::Missing(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Cached usage, if the cache is valid and no mutation is in flight.
    pub fn cached_usage(&self, origin: &Origin, storage_type: StorageType) -> Option<i64> {
        let path = self.usage_cache_path(origin, storage_type);
        match self.cache().get_record(&path) {
            Ok(record) if record.is_valid && record.dirty == 0 => Some(record.usage),
            _ => None,
        }
    }

    /// Raw usage cache record, whatever its state.
    pub fn usage_record(&self, origin: &Origin, storage_type: StorageType) -> Result<UsageRecord, QuotaError> {
        let path = self.usage_cache_path(origin, storage_type);
        Ok(self.cache().get_record(&path)?)
    }

    /// Move the authority's live counter to `usage` bytes held plus
    /// `pending` bytes the caller still has reserved. Returns the correction
    /// that was applied.
    #[instrument(level = "debug", skip(self), fields(%origin, %storage_type))]
    pub async fn sync_authority(
        &self,
        origin: &Origin,
        storage_type: StorageType,
        usage: i64,
        pending: i64,
    ) -> Result<i64, QuotaError> {
        let current = self.usage_and_quota(origin, storage_type).await?;
        let drift = usage.saturating_add(pending) - current.usage;
        if drift != 0 {
            info!(drift, usage, authority_usage = current.usage, "Correcting authority usage");
            self.authority.notify_storage_modified(origin, storage_type, drift)?;
        }
        Ok(drift)
    }

    pub fn has_usage_cache(&self, origin: &Origin, storage_type: StorageType) -> bool {
        self.usage_cache.lock().exists(&self.usage_cache_path(origin, storage_type))
    }

    /// Whether the usage file of the store is currently held open.
    pub fn has_open_cache_handle(&self, origin: &Origin, storage_type: StorageType) -> bool {
        self.usage_cache
            .lock()
            .has_cache_file_handle(&self.usage_cache_path(origin, storage_type))
    }

    pub fn close_cache_files(&self) {
        self.usage_cache.lock().close_cache_files();
    }

    pub fn close_expired_handles(&self) {
        self.usage_cache.lock().close_expired_handles();
    }

    /// Lock the usage cache for one access and make sure its handles get
    /// closed once idle.
    fn cache(&self) -> MutexGuard<'_, UsageCache> {
        let cache = self.usage_cache.lock();
        self.arm_close_timer();
        cache
    }

    fn arm_close_timer(&self) {
        if self.close_timer_armed.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(close_idle_handles(
                    Arc::downgrade(&self.usage_cache),
                    Arc::clone(&self.close_timer_armed),
                ));
            }
            // Without a runtime the next access past the deadline closes them.
            Err(_) => self.close_timer_armed.store(false, Ordering::Release),
        }
    }
}

/// Sleep until the usage cache's close deadline and close its handles,
/// following the deadline while accesses keep pushing it back. Exits once
/// nothing is open or the coordinator is gone.
async fn close_idle_handles(cache: Weak<Mutex<UsageCache>>, armed: Arc<AtomicBool>) {
    loop {
        let Some(deadline) = current_deadline(&cache) else {
            armed.store(false, Ordering::Release);
            // An access that ran between the read and the disarm saw the
            // timer still armed and did not start another one.
            if current_deadline(&cache).is_some() && !armed.swap(true, Ordering::AcqRel) {
                continue;
            }
            return;
        };
        tokio::time::sleep(deadline.saturating_duration_since(Instant::now())).await;

        let Some(shared) = cache.upgrade() else {
            armed.store(false, Ordering::Release);
            return;
        };
        let mut guard = shared.lock();
        if guard.close_deadline() == Some(deadline) {
            trace!("Usage cache handles idle");
            guard.close_cache_files();
        }
    }
}

fn current_deadline(cache: &Weak<Mutex<UsageCache>>) -> Option<Instant> {
    cache.upgrade().and_then(|cache| cache.lock().close_deadline())
}
