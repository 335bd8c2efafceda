//! Buffered counter attributes.
//!
//! Hot counters (for example a project's build artifact size) are not
//! written on every change. Increments accumulate in a pending buffer and
//! a worker later flushes them into the durable value:
//!
//! 1. under the counter's lease, the pending buffer is moved into a
//!    "flushed" buffer, so new increments keep landing in `pending`;
//! 2. the flushed amount is added to the durable value and the flushed
//!    buffer is cleared, in one transaction.
//!
//! A flushed buffer left behind by a crashed flush is picked up again by
//! the next one, so no increment is lost.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::errors::{CounterError, LeaseError};
use crate::lease::{ExclusiveLease, LockOptions};
use crate::store::{DbHandle, FlushedCounter};

pub const WORKER_LOCK_TTL: Duration = Duration::from_secs(10 * 60);

pub fn counter_key(record: &str, attribute: &str) -> String {
    format!("{}:counters:{}", record, attribute)
}

pub fn lock_key(record: &str, attribute: &str) -> String {
    format!("{}:lock", counter_key(record, attribute))
}

/// Called after every flush that moved a non-zero amount.
pub type AfterFlush = Arc<dyn Fn(&str, &str, &FlushedCounter) + Send + Sync>;

#[derive(Clone)]
pub struct CounterAttribute {
    db: DbHandle,
    lease: ExclusiveLease,
    attributes: BTreeSet<String>,
    lock_options: LockOptions,
    after_flush: Vec<AfterFlush>,
}

impl fmt::Debug for CounterAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterAttribute")
            .field("attributes", &self.attributes)
            .field("lock_options", &self.lock_options)
            .field("after_flush", &self.after_flush.len())
            .finish_non_exhaustive()
    }
}

impl CounterAttribute {
    pub fn new<I, S>(db: DbHandle, lease: ExclusiveLease, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            db,
            lease,
            attributes: attributes.into_iter().map(Into::into).collect(),
            lock_options: LockOptions::new(WORKER_LOCK_TTL),
            after_flush: Vec::new(),
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    pub fn after_flush(mut self, callback: AfterFlush) -> Self {
        self.after_flush.push(callback);
        self
    }

    pub fn enabled(&self, attribute: &str) -> bool {
        self.attributes.contains(attribute)
    }

    fn ensure_enabled(&self, attribute: &str) -> Result<(), CounterError> {
        if self.enabled(attribute) {
            Ok(())
        } else {
            Err(CounterError::UnknownAttribute {
                attribute: attribute.to_string(),
            })
        }
    }

    /// Buffer `by` for a later flush. Returns the new pending total, or
    /// `None` when `by` is zero and nothing was recorded.
    pub async fn delayed_increment(
        &self,
        record: &str,
        attribute: &str,
        by: i64,
    ) -> Result<Option<i64>, CounterError> {
        self.ensure_enabled(attribute)?;
        if by == 0 {
            return Ok(None);
        }

        let key = counter_key(record, attribute);
        let (record_key, attr) = (record.to_string(), attribute.to_string());
        let (new_value, current_db_value) = self
            .db
            .call(move |db| {
                let pending = db.increment_pending(&key, by)?;
                Ok((pending, db.counter_value(&record_key, &attr)?))
            })
            .await
            .map_err(CounterError::Store)?;

        info!(
            attribute,
            record,
            increment = by,
            new_counter_value = new_value,
            current_db_value,
            "Increment counter attribute"
        );
        Ok(Some(new_value))
    }

    /// Move buffered increments into the durable value.
    ///
    /// Returns `None` when there was nothing to flush or another worker
    /// holds the counter's lease; in the latter case that worker flushes.
    pub async fn flush(
        &self,
        record: &str,
        attribute: &str,
    ) -> Result<Option<FlushedCounter>, CounterError> {
        self.ensure_enabled(attribute)?;

        let result = self
            .lease
            .in_lock(&lock_key(record, attribute), self.lock_options, |_| async move {
                let key = counter_key(record, attribute);
                let steal_key = key.clone();
                let increment = self
                    .db
                    .call(move |db| db.steal_increments(&steal_key))
                    .await
                    .map_err(CounterError::Store)?;
                if increment == 0 {
                    return Ok(None);
                }

                let (record_key, attr) = (record.to_string(), attribute.to_string());
                let flushed = self
                    .db
                    .call(move |db| db.commit_flushed_increments(&record_key, &attr, &key))
                    .await
                    .map_err(CounterError::Store)?;

                for callback in &self.after_flush {
                    callback(record, attribute, &flushed);
                }

                info!(
                    attribute,
                    record,
                    increment = flushed.increment,
                    previous_db_value = flushed.previous_value,
                    new_db_value = flushed.new_value,
                    "Flush counter attribute to database"
                );
                Ok::<_, CounterError>(Some(flushed))
            })
            .await;

        match result {
            Err(CounterError::Lease(LeaseError::LockNotObtained { .. })) => {
                debug!(attribute, record, "Counter flush already in progress");
                Ok(None)
            }
            other => other,
        }
    }

    /// Drop pending increments that were not flushed yet.
    pub async fn clear(&self, record: &str, attribute: &str) -> Result<(), CounterError> {
        self.ensure_enabled(attribute)?;
        let key = counter_key(record, attribute);
        self.db
            .call(move |db| db.clear_pending(&key))
            .await
            .map_err(CounterError::Store)?;
        info!(attribute, record, "Clear counter attribute");
        Ok(())
    }

    pub async fn pending(&self, record: &str, attribute: &str) -> Result<i64, CounterError> {
        self.ensure_enabled(attribute)?;
        let key = counter_key(record, attribute);
        self.db
            .call(move |db| db.pending_increment(&key))
            .await
            .map_err(CounterError::Store)
    }

    /// Durable value, excluding anything still pending.
    pub async fn value(&self, record: &str, attribute: &str) -> Result<i64, CounterError> {
        self.ensure_enabled(attribute)?;
        let (record_key, attr) = (record.to_string(), attribute.to_string());
        self.db
            .call(move |db| db.counter_value(&record_key, &attr))
            .await
            .map_err(CounterError::Store)
    }
}
