use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::{Db, from_millis, from_optional_millis, to_millis};
use crate::hooks::model::WebHook;

impl Db {
    // ── Web hooks ─────────────────────────────────────────────────────

    pub fn create_web_hook(&self, project_id: i64, url: &str) -> Result<WebHook> {
        self.conn
            .execute(
                "INSERT INTO web_hooks (project_id, url) VALUES (?1, ?2)",
                params![project_id, url],
            )
            .context("Failed to insert web hook")?;
        let id = self.conn.last_insert_rowid();
        self.get_web_hook(id)?
            .context("Web hook not found after insert")
    }

    pub fn get_web_hook(&self, id: i64) -> Result<Option<WebHook>> {
        self.conn
            .query_row(
                "SELECT id, project_id, url, recent_failures, backoff_count, disabled_until
                 FROM web_hooks WHERE id = ?1",
                params![id],
                hook_from_row,
            )
            .optional()
            .context("Failed to query web hook")?
            .map(|(hook, disabled_until)| with_disabled_until(hook, disabled_until))
            .transpose()
    }

    pub fn list_web_hooks(&self) -> Result<Vec<WebHook>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, url, recent_failures, backoff_count, disabled_until
                 FROM web_hooks ORDER BY id",
            )
            .context("Failed to prepare list_web_hooks")?;
        let rows = stmt
            .query_map([], hook_from_row)
            .context("Failed to query web hooks")?;
        let mut hooks = Vec::new();
        for row in rows {
            let (hook, disabled_until) = row.context("Failed to read web hook row")?;
            hooks.push(with_disabled_until(hook, disabled_until)?);
        }
        Ok(hooks)
    }

    /// Persist the failure-state columns of a hook.
    pub fn save_web_hook_failure_state(&self, hook: &WebHook) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE web_hooks SET recent_failures = ?1, backoff_count = ?2, disabled_until = ?3
                 WHERE id = ?4",
                params![
                    hook.recent_failures,
                    hook.backoff_count,
                    hook.disabled_until.map(to_millis),
                    hook.id
                ],
            )
            .context("Failed to update web hook failure state")?;
        if updated == 0 {
            anyhow::bail!("Web hook {} not found", hook.id);
        }
        Ok(())
    }

    /// Move the project's last-failure marker forward to `at`. Earlier
    /// timestamps are ignored. Returns true if the marker moved.
    pub fn record_hook_last_failure(&self, project_id: i64, at: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO hook_last_failures (project_id, failed_at) VALUES (?1, ?2)
                 ON CONFLICT(project_id) DO UPDATE SET failed_at = excluded.failed_at
                 WHERE excluded.failed_at > hook_last_failures.failed_at",
                params![project_id, to_millis(at)],
            )
            .context("Failed to record hook last failure")?;
        Ok(changed > 0)
    }

    pub fn hook_last_failure(&self, project_id: i64) -> Result<Option<DateTime<Utc>>> {
        let ms: Option<i64> = self
            .conn
            .query_row(
                "SELECT failed_at FROM hook_last_failures WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query hook last failure")?;
        from_optional_millis(ms)
    }
}

fn hook_from_row(row: &Row<'_>) -> rusqlite::Result<(WebHook, Option<i64>)> {
    Ok((
        WebHook {
            id: row.get(0)?,
            project_id: row.get(1)?,
            url: row.get(2)?,
            recent_failures: row.get(3)?,
            backoff_count: row.get(4)?,
            disabled_until: None,
        },
        row.get(5)?,
    ))
}

fn with_disabled_until(mut hook: WebHook, disabled_until: Option<i64>) -> Result<WebHook> {
    hook.disabled_until = disabled_until.map(from_millis).transpose()?;
    Ok(hook)
}
