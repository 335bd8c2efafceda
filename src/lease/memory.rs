//! In-process lease backend.

use std::time::Duration;

use async_trait::async_trait;
use cronlease_common::SharedClock;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{LeaseBackend, LeaseGuard, LeaseToken};
use crate::errors::LeaseError;

#[derive(Debug, Clone)]
struct Held {
    token: LeaseToken,
    /// Monotonic reading after which the lease is free.
    expires_at: Duration,
}

/// Leases held in a concurrent map, expiring against the given clock.
///
/// Shares nothing across processes. Used by tests and single-process
/// deployments.
#[derive(Debug)]
pub struct MemoryLeaseBackend {
    clock: SharedClock,
    held: DashMap<String, Held>,
}

impl MemoryLeaseBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            held: DashMap::new(),
        }
    }

    fn deadline(&self, ttl: Duration) -> Duration {
        self.clock.monotonic().saturating_add(ttl)
    }
}

#[async_trait]
impl LeaseBackend for MemoryLeaseBackend {
    async fn try_obtain(&self, key: &str, ttl: Duration) -> Result<Option<LeaseGuard>, LeaseError> {
        let now = self.clock.monotonic();
        let token = LeaseToken::generate();
        let held = Held {
            token: token.clone(),
            expires_at: self.deadline(ttl),
        };
        match self.held.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at > now {
                    return Ok(None);
                }
                entry.insert(held);
            }
            Entry::Vacant(entry) => {
                entry.insert(held);
            }
        }
        Ok(Some(LeaseGuard {
            key: key.to_string(),
            token,
            ttl,
        }))
    }

    async fn cancel(&self, guard: &LeaseGuard) -> Result<bool, LeaseError> {
        Ok(self
            .held
            .remove_if(&guard.key, |_, held| held.token == guard.token)
            .is_some())
    }

    async fn renew(&self, guard: &LeaseGuard, ttl: Duration) -> Result<bool, LeaseError> {
        let now = self.clock.monotonic();
        let deadline = self.deadline(ttl);
        match self.held.get_mut(&guard.key) {
            Some(mut held) if held.token == guard.token && held.expires_at > now => {
                held.expires_at = deadline;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<LeaseToken>, LeaseError> {
        let now = self.clock.monotonic();
        Ok(self
            .held
            .get(key)
            .filter(|held| held.expires_at > now)
            .map(|held| held.token.clone()))
    }
}
