use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::Db;

/// Outcome of moving flushed increments into the durable counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushedCounter {
    pub increment: i64,
    pub previous_value: i64,
    pub new_value: i64,
}

impl Db {
    // ── Counter buffers ───────────────────────────────────────────────

    /// Add `by` to the pending buffer for `counter_key` and return the new
    /// pending total.
    pub fn increment_pending(&self, counter_key: &str, by: i64) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO counter_increments (counter_key, pending) VALUES (?1, ?2)
                 ON CONFLICT(counter_key) DO UPDATE SET pending = pending + excluded.pending",
                params![counter_key, by],
            )
            .context("Failed to increment pending counter")?;
        self.pending_increment(counter_key)
    }

    pub fn pending_increment(&self, counter_key: &str) -> Result<i64> {
        let pending: Option<i64> = self
            .conn
            .query_row(
                "SELECT pending FROM counter_increments WHERE counter_key = ?1",
                params![counter_key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read pending counter")?;
        Ok(pending.unwrap_or(0))
    }

    /// Atomically move the pending buffer into the flushed buffer and return
    /// the flushed total. New increments keep landing in `pending` while the
    /// flushed amount is written out. A zero total removes the row.
    pub fn steal_increments(&self, counter_key: &str) -> Result<i64> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE counter_increments SET flushed = flushed + pending, pending = 0
             WHERE counter_key = ?1",
            params![counter_key],
        )
        .context("Failed to move pending increments")?;
        let flushed: i64 = tx
            .query_row(
                "SELECT flushed FROM counter_increments WHERE counter_key = ?1",
                params![counter_key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read flushed increments")?
            .unwrap_or(0);
        if flushed == 0 {
            tx.execute(
                "DELETE FROM counter_increments WHERE counter_key = ?1",
                params![counter_key],
            )
            .context("Failed to delete empty counter buffer")?;
        }
        tx.commit().context("Failed to commit steal_increments")?;
        Ok(flushed)
    }

    /// Add the flushed buffer to the durable value and clear it, in one
    /// transaction.
    pub fn commit_flushed_increments(
        &self,
        record_key: &str,
        attribute: &str,
        counter_key: &str,
    ) -> Result<FlushedCounter> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let increment: i64 = tx
            .query_row(
                "SELECT flushed FROM counter_increments WHERE counter_key = ?1",
                params![counter_key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read flushed increments")?
            .unwrap_or(0);
        let previous_value: i64 = tx
            .query_row(
                "SELECT value FROM counters WHERE record_key = ?1 AND attribute = ?2",
                params![record_key, attribute],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read counter value")?
            .unwrap_or(0);
        tx.execute(
            "INSERT INTO counters (record_key, attribute, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(record_key, attribute) DO UPDATE SET value = value + excluded.value",
            params![record_key, attribute, increment],
        )
        .context("Failed to update counter value")?;
        tx.execute(
            "UPDATE counter_increments SET flushed = 0 WHERE counter_key = ?1",
            params![counter_key],
        )
        .context("Failed to clear flushed increments")?;
        let new_value: i64 = tx
            .query_row(
                "SELECT value FROM counters WHERE record_key = ?1 AND attribute = ?2",
                params![record_key, attribute],
                |row| row.get(0),
            )
            .context("Failed to read updated counter value")?;
        tx.commit().context("Failed to commit flushed increments")?;
        Ok(FlushedCounter {
            increment,
            previous_value,
            new_value,
        })
    }

    /// Drop pending increments that have not been flushed yet.
    pub fn clear_pending(&self, counter_key: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE counter_increments SET pending = 0 WHERE counter_key = ?1",
                params![counter_key],
            )
            .context("Failed to clear pending counter")?;
        Ok(())
    }

    pub fn counter_value(&self, record_key: &str, attribute: &str) -> Result<i64> {
        let value: Option<i64> = self
            .conn
            .query_row(
                "SELECT value FROM counters WHERE record_key = ?1 AND attribute = ?2",
                params![record_key, attribute],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read counter value")?;
        Ok(value.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_pending_accumulates() -> Result<()> {
        let db = Db::new_in_memory()?;
        assert_eq!(db.pending_increment("k")?, 0);
        assert_eq!(db.increment_pending("k", 3)?, 3);
        assert_eq!(db.increment_pending("k", -1)?, 2);
        Ok(())
    }

    #[test]
    fn test_steal_then_commit() -> Result<()> {
        let db = Db::new_in_memory()?;
        db.increment_pending("p:1:counters:size", 5)?;

        assert_eq!(db.steal_increments("p:1:counters:size")?, 5);
        assert_eq!(db.pending_increment("p:1:counters:size")?, 0);

        // Increments that arrive mid-flush stay pending.
        db.increment_pending("p:1:counters:size", 2)?;

        let flushed = db.commit_flushed_increments("p:1", "size", "p:1:counters:size")?;
        assert_eq!(
            flushed,
            FlushedCounter {
                increment: 5,
                previous_value: 0,
                new_value: 5
            }
        );
        assert_eq!(db.counter_value("p:1", "size")?, 5);
        assert_eq!(db.pending_increment("p:1:counters:size")?, 2);
        Ok(())
    }

    #[test]
    fn test_steal_keeps_flushed_from_failed_previous_flush() -> Result<()> {
        let db = Db::new_in_memory()?;
        db.increment_pending("k", 4)?;
        assert_eq!(db.steal_increments("k")?, 4);
        // Commit never happened; the next steal picks it up again.
        db.increment_pending("k", 1)?;
        assert_eq!(db.steal_increments("k")?, 5);
        Ok(())
    }

    #[test]
    fn test_steal_with_nothing_pending_returns_zero() -> Result<()> {
        let db = Db::new_in_memory()?;
        assert_eq!(db.steal_increments("missing")?, 0);

        db.increment_pending("k", 3)?;
        db.increment_pending("k", -3)?;
        assert_eq!(db.steal_increments("k")?, 0);
        Ok(())
    }

    #[test]
    fn test_clear_pending() -> Result<()> {
        let db = Db::new_in_memory()?;
        db.increment_pending("k", 9)?;
        db.clear_pending("k")?;
        assert_eq!(db.pending_increment("k")?, 0);
        Ok(())
    }
}
