//! Quota brokering between stores and the external quota authority.

pub mod authority;
pub mod coordinator;
pub mod error;

pub use authority::{InMemoryQuotaAuthority, QuotaAuthority, QuotaAuthorityHandle, QuotaLedger, UsageAndQuota};
pub use coordinator::{QuotaCoordinator, QuotaReservation};
pub use error::QuotaError;
