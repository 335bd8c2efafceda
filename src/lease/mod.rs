//! Exclusive leases: TTL-bound, at-most-one-holder locks keyed by string.
//!
//! A lease moves through two states per key:
//!
//! ```text
//! UNLOCKED ──try_obtain──▶ LOCKED ──cancel / TTL expiry──▶ UNLOCKED
//! ```
//!
//! TTL expiry is the only transition the holder does not drive. Backends
//! implement [`LeaseBackend`]; [`ExclusiveLease::in_lock`] layers bounded
//! retry and scoped release on top of any backend.
//!
//! # Usage
//!
//! ```ignore
//! use cronlease::lease::{ExclusiveLease, LockOptions, MemoryLeaseBackend};
//!
//! let lease = ExclusiveLease::new(Arc::new(MemoryLeaseBackend::new(clock)));
//! let total = lease
//!     .in_lock("project:1:counters:size:lock", LockOptions::default(), |_retried| async {
//!         Ok::<_, LeaseError>(flush().await)
//!     })
//!     .await?;
//! ```

pub mod guard;
pub mod memory;
pub mod sqlite;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::LeaseError;

pub use guard::{ExclusiveLease, LockOptions};
pub use memory::MemoryLeaseBackend;
pub use sqlite::SqliteLeaseBackend;

/// Opaque proof of holding a lease. Only the holder's token can release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LeaseToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A successfully obtained lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    pub key: String,
    pub token: LeaseToken,
    pub ttl: Duration,
}

/// Storage capability behind exclusive leases.
///
/// Implementations must make `try_obtain` atomic per key: two concurrent
/// callers can never both receive `Some`.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Take the lease if nobody holds it (or the holder's TTL ran out).
    async fn try_obtain(&self, key: &str, ttl: Duration) -> Result<Option<LeaseGuard>, LeaseError>;

    /// Release the lease if `guard` still holds it. A stale guard is a no-op
    /// returning `false`.
    async fn cancel(&self, guard: &LeaseGuard) -> Result<bool, LeaseError>;

    /// Push the expiry of a live lease out to `now + ttl`.
    async fn renew(&self, guard: &LeaseGuard, ttl: Duration) -> Result<bool, LeaseError>;

    /// Token of the live holder, if any.
    async fn holder(&self, key: &str) -> Result<Option<LeaseToken>, LeaseError>;

    async fn exists(&self, key: &str) -> Result<bool, LeaseError> {
        Ok(self.holder(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique() {
        assert_ne!(LeaseToken::generate(), LeaseToken::generate());
    }

    #[test]
    fn token_displays_as_inner_string() {
        let token = LeaseToken::from("abc".to_string());
        assert_eq!(token.to_string(), "abc");
        assert_eq!(token.as_str(), "abc");
    }
}
