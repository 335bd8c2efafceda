use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::{Db, from_millis, from_optional_millis, to_millis};
use crate::aggregation::model::{Aggregation, AggregationMode, Event, EventCursor, RunStats};

const AGGREGATION_COLUMNS: &str = "id, target_id, enabled, last_incremental_run_at, last_full_run_at, \
     cursor_updated_at, cursor_event_id, total_value, processed_records, incremental_stats, full_stats";

impl Db {
    // ── Aggregations ──────────────────────────────────────────────────

    /// Register a target for aggregation. Returns the existing row when the
    /// target is already registered.
    pub fn create_aggregation(&self, target_id: i64) -> Result<Aggregation> {
        self.conn
            .execute(
                "INSERT INTO aggregations (target_id) VALUES (?1) ON CONFLICT(target_id) DO NOTHING",
                params![target_id],
            )
            .context("Failed to insert aggregation")?;
        self.get_aggregation_by_target(target_id)?
            .context("Aggregation not found after insert")
    }

    pub fn get_aggregation(&self, id: i64) -> Result<Option<Aggregation>> {
        let sql = format!("SELECT {} FROM aggregations WHERE id = ?1", AGGREGATION_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], AggregationRow::from_row)
            .optional()
            .context("Failed to query aggregation")?;
        row.map(AggregationRow::into_aggregation).transpose()
    }

    pub fn get_aggregation_by_target(&self, target_id: i64) -> Result<Option<Aggregation>> {
        let sql = format!(
            "SELECT {} FROM aggregations WHERE target_id = ?1",
            AGGREGATION_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![target_id], AggregationRow::from_row)
            .optional()
            .context("Failed to query aggregation by target")?;
        row.map(AggregationRow::into_aggregation).transpose()
    }

    pub fn list_aggregations(&self) -> Result<Vec<Aggregation>> {
        let sql = format!("SELECT {} FROM aggregations ORDER BY id", AGGREGATION_COLUMNS);
        self.query_aggregations(&sql, [])
    }

    pub fn set_aggregation_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.conn
            .execute(
                "UPDATE aggregations SET enabled = ?1 WHERE id = ?2",
                params![enabled, id],
            )
            .context("Failed to update aggregation enabled flag")?;
        Ok(())
    }

    /// Next batch of enabled aggregations whose run marker for `mode` is
    /// missing or older than `cutoff`. Never-run rows come first, then the
    /// oldest.
    pub fn load_aggregation_batch(
        &self,
        mode: AggregationMode,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Aggregation>> {
        let column = match mode {
            AggregationMode::Incremental => "last_incremental_run_at",
            AggregationMode::Full => "last_full_run_at",
        };
        let sql = format!(
            "SELECT {cols} FROM aggregations
             WHERE enabled = 1 AND ({col} IS NULL OR {col} < ?1)
             ORDER BY {col} IS NOT NULL, {col}, id
             LIMIT ?2",
            cols = AGGREGATION_COLUMNS,
            col = column
        );
        self.query_aggregations(&sql, params![to_millis(cutoff), limit as i64])
    }

    pub fn save_aggregation(&self, aggregation: &Aggregation) -> Result<()> {
        let incremental_stats = serde_json::to_string(&aggregation.incremental_stats)
            .context("Failed to serialize incremental stats")?;
        let full_stats = serde_json::to_string(&aggregation.full_stats)
            .context("Failed to serialize full stats")?;
        let updated = self
            .conn
            .execute(
                "UPDATE aggregations SET
                    enabled = ?1,
                    last_incremental_run_at = ?2,
                    last_full_run_at = ?3,
                    cursor_updated_at = ?4,
                    cursor_event_id = ?5,
                    total_value = ?6,
                    processed_records = ?7,
                    incremental_stats = ?8,
                    full_stats = ?9
                 WHERE id = ?10",
                params![
                    aggregation.enabled,
                    aggregation.last_incremental_run_at.map(to_millis),
                    aggregation.last_full_run_at.map(to_millis),
                    aggregation.cursor.map(|c| to_millis(c.updated_at)),
                    aggregation.cursor.map(|c| c.event_id),
                    aggregation.total_value,
                    aggregation.processed_records,
                    incremental_stats,
                    full_stats,
                    aggregation.id,
                ],
            )
            .context("Failed to update aggregation")?;
        if updated == 0 {
            anyhow::bail!("Aggregation {} not found", aggregation.id);
        }
        Ok(())
    }

    /// Stamp only the run marker for `mode`, leaving cursor and totals alone.
    pub fn mark_aggregation_run(
        &self,
        id: i64,
        mode: AggregationMode,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let sql = match mode {
            AggregationMode::Incremental => {
                "UPDATE aggregations SET last_incremental_run_at = ?1 WHERE id = ?2"
            }
            AggregationMode::Full => "UPDATE aggregations SET last_full_run_at = ?1 WHERE id = ?2",
        };
        let updated = self
            .conn
            .execute(sql, params![to_millis(at), id])
            .context("Failed to mark aggregation run")?;
        if updated == 0 {
            anyhow::bail!("Aggregation {} not found", id);
        }
        Ok(())
    }

    fn query_aggregations<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<Aggregation>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare aggregation query")?;
        let rows = stmt
            .query_map(params, AggregationRow::from_row)
            .context("Failed to query aggregations")?;
        let mut aggregations = Vec::new();
        for row in rows {
            let r = row.context("Failed to read aggregation row")?;
            aggregations.push(r.into_aggregation()?);
        }
        Ok(aggregations)
    }

    // ── Events ────────────────────────────────────────────────────────

    pub fn add_event(&self, target_id: i64, value: i64, updated_at: DateTime<Utc>) -> Result<Event> {
        self.conn
            .execute(
                "INSERT INTO events (target_id, updated_at, value) VALUES (?1, ?2, ?3)",
                params![target_id, to_millis(updated_at), value],
            )
            .context("Failed to insert event")?;
        let id = self.conn.last_insert_rowid();
        Ok(Event {
            id,
            target_id,
            updated_at: from_millis(to_millis(updated_at))?,
            value,
        })
    }

    /// Events for `target_id` strictly after `cursor`, in cursor order.
    pub fn events_after(
        &self,
        target_id: i64,
        cursor: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let (after_ms, after_id) = match cursor {
            Some(c) => (to_millis(c.updated_at), c.event_id),
            None => (i64::MIN, i64::MIN),
        };
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, target_id, updated_at, value FROM events
                 WHERE target_id = ?1
                   AND (updated_at > ?2 OR (updated_at = ?2 AND id > ?3))
                 ORDER BY updated_at, id
                 LIMIT ?4",
            )
            .context("Failed to prepare events_after")?;
        let rows = stmt
            .query_map(params![target_id, after_ms, after_id, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            let (id, target_id, updated_at, value) = row.context("Failed to read event row")?;
            events.push(Event {
                id,
                target_id,
                updated_at: from_millis(updated_at)?,
                value,
            });
        }
        Ok(events)
    }
}

/// Intermediate row struct for aggregations.
struct AggregationRow {
    id: i64,
    target_id: i64,
    enabled: bool,
    last_incremental_run_at: Option<i64>,
    last_full_run_at: Option<i64>,
    cursor_updated_at: Option<i64>,
    cursor_event_id: Option<i64>,
    total_value: i64,
    processed_records: i64,
    incremental_stats: String,
    full_stats: String,
}

impl AggregationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            target_id: row.get(1)?,
            enabled: row.get(2)?,
            last_incremental_run_at: row.get(3)?,
            last_full_run_at: row.get(4)?,
            cursor_updated_at: row.get(5)?,
            cursor_event_id: row.get(6)?,
            total_value: row.get(7)?,
            processed_records: row.get(8)?,
            incremental_stats: row.get(9)?,
            full_stats: row.get(10)?,
        })
    }

    fn into_aggregation(self) -> Result<Aggregation> {
        let cursor = match (self.cursor_updated_at, self.cursor_event_id) {
            (Some(ms), Some(event_id)) => Some(EventCursor {
                updated_at: from_millis(ms)?,
                event_id,
            }),
            _ => None,
        };
        Ok(Aggregation {
            id: self.id,
            target_id: self.target_id,
            enabled: self.enabled,
            last_incremental_run_at: from_optional_millis(self.last_incremental_run_at)?,
            last_full_run_at: from_optional_millis(self.last_full_run_at)?,
            cursor,
            total_value: self.total_value,
            processed_records: self.processed_records,
            incremental_stats: parse_stats(&self.incremental_stats)
                .context("Failed to parse incremental stats")?,
            full_stats: parse_stats(&self.full_stats).context("Failed to parse full stats")?,
        })
    }
}

fn parse_stats(raw: &str) -> Result<RunStats> {
    if raw.trim().is_empty() || raw.trim() == "{}" {
        return Ok(RunStats::default());
    }
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_create_aggregation_is_idempotent_per_target() -> Result<()> {
        let db = Db::new_in_memory()?;
        let a = db.create_aggregation(7)?;
        let b = db.create_aggregation(7)?;
        assert_eq!(a.id, b.id);
        assert!(a.enabled);
        assert_eq!(a.cursor, None);
        assert_eq!(a.incremental_stats, RunStats::default());
        assert_eq!(db.list_aggregations()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_save_and_reload_aggregation() -> Result<()> {
        let db = Db::new_in_memory()?;
        let mut agg = db.create_aggregation(1)?;
        agg.cursor = Some(EventCursor {
            updated_at: at(5),
            event_id: 3,
        });
        agg.total_value = 42;
        agg.processed_records = 4;
        agg.mark_run(AggregationMode::Incremental, at(10));
        agg.incremental_stats.record(Duration::from_millis(1500), 4);
        db.save_aggregation(&agg)?;

        let reloaded = db.get_aggregation(agg.id)?.expect("aggregation should exist");
        assert_eq!(reloaded, agg);
        Ok(())
    }

    #[test]
    fn test_save_missing_aggregation_fails() -> Result<()> {
        let db = Db::new_in_memory()?;
        let mut agg = db.create_aggregation(1)?;
        agg.id = 999;
        assert!(db.save_aggregation(&agg).is_err());
        Ok(())
    }

    #[test]
    fn test_load_batch_orders_never_run_first_then_oldest() -> Result<()> {
        let db = Db::new_in_memory()?;
        let mut old = db.create_aggregation(1)?;
        let mut newer = db.create_aggregation(2)?;
        let never = db.create_aggregation(3)?;
        let mut fresh = db.create_aggregation(4)?;

        old.mark_run(AggregationMode::Incremental, at(10));
        newer.mark_run(AggregationMode::Incremental, at(20));
        fresh.mark_run(AggregationMode::Incremental, at(100));
        for a in [&old, &newer, &fresh] {
            db.save_aggregation(a)?;
        }

        let batch = db.load_aggregation_batch(AggregationMode::Incremental, at(50), 10)?;
        let ids: Vec<i64> = batch.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![never.id, old.id, newer.id]);

        let limited = db.load_aggregation_batch(AggregationMode::Incremental, at(50), 2)?;
        assert_eq!(limited.len(), 2);
        Ok(())
    }

    #[test]
    fn test_load_batch_skips_disabled_and_uses_mode_column() -> Result<()> {
        let db = Db::new_in_memory()?;
        let disabled = db.create_aggregation(1)?;
        db.set_aggregation_enabled(disabled.id, false)?;
        let mut agg = db.create_aggregation(2)?;
        agg.mark_run(AggregationMode::Incremental, at(100));
        db.save_aggregation(&agg)?;

        let incremental = db.load_aggregation_batch(AggregationMode::Incremental, at(50), 10)?;
        assert!(incremental.is_empty());

        let full = db.load_aggregation_batch(AggregationMode::Full, at(50), 10)?;
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].id, agg.id);
        Ok(())
    }

    #[test]
    fn test_mark_run_leaves_cursor_alone() -> Result<()> {
        let db = Db::new_in_memory()?;
        let mut agg = db.create_aggregation(1)?;
        agg.total_value = 5;
        db.save_aggregation(&agg)?;

        db.mark_aggregation_run(agg.id, AggregationMode::Full, at(30))?;
        let reloaded = db.get_aggregation(agg.id)?.unwrap();
        assert_eq!(reloaded.last_full_run_at, Some(at(30)));
        assert_eq!(reloaded.last_incremental_run_at, None);
        assert_eq!(reloaded.total_value, 5);

        assert!(db.mark_aggregation_run(999, AggregationMode::Full, at(30)).is_err());
        Ok(())
    }

    #[test]
    fn test_events_after_respects_cursor_and_ties() -> Result<()> {
        let db = Db::new_in_memory()?;
        let e1 = db.add_event(1, 10, at(1))?;
        let e2 = db.add_event(1, 20, at(2))?;
        let e3 = db.add_event(1, 30, at(2))?;
        db.add_event(2, 99, at(1))?;

        let all = db.events_after(1, None, 100)?;
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![e1.id, e2.id, e3.id]);

        let after_e2 = db.events_after(1, Some(e2.cursor()), 100)?;
        assert_eq!(after_e2.iter().map(|e| e.id).collect::<Vec<_>>(), vec![e3.id]);

        let page = db.events_after(1, None, 2)?;
        assert_eq!(page.len(), 2);
        Ok(())
    }
}
