use thiserror::Error;

use crate::usage::UsageCacheError;

/// Errors raised by the quota protocol.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Granting the reservation would take usage over the quota.
    #[error("quota exceeded: requested {requested} bytes with {usage} of {quota} in use")]
    NoSpace { requested: i64, usage: i64, quota: i64 },

    /// The authority task has stopped and can no longer answer.
    #[error("quota authority is unavailable")]
    AuthorityUnavailable,

    #[error("invalid quota delta {0}")]
    InvalidDelta(i64),

    #[error(transparent)]
    UsageCache(#[from] UsageCacheError),
}
