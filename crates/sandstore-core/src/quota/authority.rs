//! The external quota authority and the channel used to reach it.
//!
//! The authority owns the live usage counter and the quota of every
//! origin+type. It runs as its own task and is only reached through a
//! [`QuotaAuthorityHandle`]. Requests travel over one unbounded FIFO
//! channel, so a notification sent before a usage query is always applied
//! before that query is answered.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::error::QuotaError;
use crate::origin::{Origin, StorageType};

/// Current usage and the ceiling it may not exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageAndQuota {
    pub usage: i64,
    pub quota: i64,
}

/// Source of truth for quota decisions.
///
/// Implementations are driven from a single task, one request at a time.
pub trait QuotaAuthority: Send + 'static {
    fn get_usage_and_quota(&mut self, origin: &Origin, storage_type: StorageType) -> UsageAndQuota;

    /// Apply `delta` bytes to the live usage counter.
    fn notify_storage_modified(&mut self, origin: &Origin, storage_type: StorageType, delta: i64);
}

enum QuotaRequest {
    GetUsageAndQuota {
        origin: Origin,
        storage_type: StorageType,
        reply: oneshot::Sender<UsageAndQuota>,
    },
    NotifyModified {
        origin: Origin,
        storage_type: StorageType,
        delta: i64,
    },
}

/// Cloneable sender side of the authority task.
#[derive(Debug, Clone)]
pub struct QuotaAuthorityHandle {
    tx: mpsc::UnboundedSender<QuotaRequest>,
}

impl std::fmt::Debug for QuotaRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaRequest::GetUsageAndQuota { origin, storage_type, .. } => f
                .debug_struct("GetUsageAndQuota")
                .field("origin", origin)
                .field("storage_type", storage_type)
                .finish_non_exhaustive(),
            QuotaRequest::NotifyModified {
                origin,
                storage_type,
                delta,
            } => f
                .debug_struct("NotifyModified")
                .field("origin", origin)
                .field("storage_type", storage_type)
                .field("delta", delta)
                .finish(),
        }
    }
}

impl QuotaAuthorityHandle {
    /// Move `authority` onto a new task on the current tokio runtime.
    ///
    /// The task exits once every handle has been dropped.
    pub fn spawn<A: QuotaAuthority>(authority: A) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_authority(authority, rx));
        (Self { tx }, task)
    }

    /// Ask the authority for the current usage and quota.
    pub async fn get_usage_and_quota(
        &self,
        origin: &Origin,
        storage_type: StorageType,
    ) -> Result<UsageAndQuota, QuotaError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QuotaRequest::GetUsageAndQuota {
                origin: origin.clone(),
                storage_type,
                reply,
            })
            .map_err(|_| QuotaError::AuthorityUnavailable)?;
        rx.await.map_err(|_| QuotaError::AuthorityUnavailable)
    }

    /// Queue a usage change. Does not wait for it to be applied.
    pub fn notify_storage_modified(
        &self,
        origin: &Origin,
        storage_type: StorageType,
        delta: i64,
    ) -> Result<(), QuotaError> {
        self.tx
            .send(QuotaRequest::NotifyModified {
                origin: origin.clone(),
                storage_type,
                delta,
            })
            .map_err(|_| QuotaError::AuthorityUnavailable)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_authority<A: QuotaAuthority>(mut authority: A, mut rx: mpsc::UnboundedReceiver<QuotaRequest>) {
    while let Some(request) = rx.recv().await {
        trace!(?request, "Quota request");
        match request {
            QuotaRequest::GetUsageAndQuota {
                origin,
                storage_type,
                reply,
            } => {
                let answer = authority.get_usage_and_quota(&origin, storage_type);
                // The caller may have given up waiting.
                let _ = reply.send(answer);
            }
            QuotaRequest::NotifyModified {
                origin,
                storage_type,
                delta,
            } => authority.notify_storage_modified(&origin, storage_type, delta),
        }
    }
    debug!("Quota authority stopped");
}

type QuotaKey = (Origin, StorageType);

/// Shared view of an [`InMemoryQuotaAuthority`]'s counters.
///
/// Stays usable after the authority has been moved onto its task.
#[derive(Debug, Clone, Default)]
pub struct QuotaLedger {
    quotas: Arc<DashMap<QuotaKey, i64>>,
    usage: Arc<DashMap<QuotaKey, i64>>,
}

impl QuotaLedger {
    /// Live usage as seen by the authority.
    pub fn usage(&self, origin: &Origin, storage_type: StorageType) -> i64 {
        self.usage
            .get(&(origin.clone(), storage_type))
            .map_or(0, |entry| *entry)
    }

    pub fn set_usage(&self, origin: &Origin, storage_type: StorageType, usage: i64) {
        self.usage.insert((origin.clone(), storage_type), usage);
    }

    /// Explicit quota override, if one was set.
    pub fn quota_override(&self, origin: &Origin, storage_type: StorageType) -> Option<i64> {
        self.quotas.get(&(origin.clone(), storage_type)).map(|entry| *entry)
    }

    pub fn set_quota(&self, origin: &Origin, storage_type: StorageType, quota: i64) {
        self.quotas.insert((origin.clone(), storage_type), quota);
    }
}

/// Quota authority keeping everything in memory.
///
/// Every origin+type gets `default_quota` unless overridden through the
/// [`QuotaLedger`].
#[derive(Debug, Clone)]
pub struct InMemoryQuotaAuthority {
    default_quota: i64,
    ledger: QuotaLedger,
}

impl InMemoryQuotaAuthority {
    pub fn new(default_quota: i64) -> Self {
        Self {
            default_quota,
            ledger: QuotaLedger::default(),
        }
    }

    #[must_use]
    pub fn with_quota(self, origin: &Origin, storage_type: StorageType, quota: i64) -> Self {
        self.ledger.set_quota(origin, storage_type, quota);
        self
    }

    pub fn ledger(&self) -> QuotaLedger {
        self.ledger.clone()
    }
}

impl QuotaAuthority for InMemoryQuotaAuthority {
    fn get_usage_and_quota(&mut self, origin: &Origin, storage_type: StorageType) -> UsageAndQuota {
        UsageAndQuota {
            usage: self.ledger.usage(origin, storage_type),
            quota: self
                .ledger
                .quota_override(origin, storage_type)
                .unwrap_or(self.default_quota),
        }
    }

    fn notify_storage_modified(&mut self, origin: &Origin, storage_type: StorageType, delta: i64) {
        let mut entry = self.ledger.usage.entry((origin.clone(), storage_type)).or_insert(0);
        *entry = entry.saturating_add(delta);
    }
}
