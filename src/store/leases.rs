use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{Db, from_millis, to_millis};

impl Db {
    // ── Leases ────────────────────────────────────────────────────────

    /// Take `key` for `token` until `expires_at`, unless a live lease exists.
    /// An expired lease is taken over. Returns true if `token` now holds it.
    pub fn try_obtain_lease(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO leases (key, token, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET token = excluded.token, expires_at = excluded.expires_at
                 WHERE leases.expires_at <= ?4",
                params![key, token, to_millis(expires_at), to_millis(now)],
            )
            .context("Failed to obtain lease")?;
        Ok(changed > 0)
    }

    /// Delete the lease only if `token` still holds it.
    pub fn cancel_lease(&self, key: &str, token: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM leases WHERE key = ?1 AND token = ?2",
                params![key, token],
            )
            .context("Failed to cancel lease")?;
        Ok(deleted > 0)
    }

    /// Extend a live lease held by `token`.
    pub fn renew_lease(
        &self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE leases SET expires_at = ?1 WHERE key = ?2 AND token = ?3 AND expires_at > ?4",
                params![to_millis(expires_at), key, token, to_millis(now)],
            )
            .context("Failed to renew lease")?;
        Ok(updated > 0)
    }

    /// Current live holder of `key` as `(token, expires_at)`.
    pub fn lease_holder(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(String, DateTime<Utc>)>> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT token, expires_at FROM leases WHERE key = ?1 AND expires_at > ?2",
                params![key, to_millis(now)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query lease holder")?;
        row.map(|(token, ms)| Ok((token, from_millis(ms)?)))
            .transpose()
    }

    /// Remove expired leases. Returns how many were removed.
    pub fn purge_expired_leases(&self, now: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM leases WHERE expires_at <= ?1",
                params![to_millis(now)],
            )
            .context("Failed to purge expired leases")
    }
}
