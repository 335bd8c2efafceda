//! Lease backend on the shared SQLite database, so separate worker processes
//! on the same host exclude each other.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronlease_common::SharedClock;

use super::{LeaseBackend, LeaseGuard, LeaseToken};
use crate::errors::LeaseError;
use crate::store::DbHandle;

#[derive(Debug, Clone)]
pub struct SqliteLeaseBackend {
    db: DbHandle,
    clock: SharedClock,
}

impl SqliteLeaseBackend {
    pub fn new(db: DbHandle, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    fn window(&self, ttl: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        (now, expires_at)
    }
}

#[async_trait]
impl LeaseBackend for SqliteLeaseBackend {
    async fn try_obtain(&self, key: &str, ttl: Duration) -> Result<Option<LeaseGuard>, LeaseError> {
        let (now, expires_at) = self.window(ttl);
        let token = LeaseToken::generate();
        let obtained = {
            let key = key.to_string();
            let token = token.clone();
            self.db
                .call(move |db| db.try_obtain_lease(&key, token.as_str(), now, expires_at))
                .await
                .map_err(LeaseError::Backend)?
        };
        Ok(obtained.then(|| LeaseGuard {
            key: key.to_string(),
            token,
            ttl,
        }))
    }

    async fn cancel(&self, guard: &LeaseGuard) -> Result<bool, LeaseError> {
        let key = guard.key.clone();
        let token = guard.token.clone();
        self.db
            .call(move |db| db.cancel_lease(&key, token.as_str()))
            .await
            .map_err(LeaseError::Backend)
    }

    async fn renew(&self, guard: &LeaseGuard, ttl: Duration) -> Result<bool, LeaseError> {
        let (now, expires_at) = self.window(ttl);
        let key = guard.key.clone();
        let token = guard.token.clone();
        self.db
            .call(move |db| db.renew_lease(&key, token.as_str(), now, expires_at))
            .await
            .map_err(LeaseError::Backend)
    }

    async fn holder(&self, key: &str) -> Result<Option<LeaseToken>, LeaseError> {
        let now = self.clock.now();
        let key = key.to_string();
        let holder = self
            .db
            .call(move |db| db.lease_holder(&key, now))
            .await
            .map_err(LeaseError::Backend)?;
        Ok(holder.map(|(token, _)| LeaseToken::from(token)))
    }
}
