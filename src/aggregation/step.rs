//! One unit of aggregation work: fold new source events into a cursor.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronlease_common::{RuntimeLimiter, SharedClock};
use tracing::debug;

use super::model::{Aggregation, AggregationMode};
use crate::store::DbHandle;

pub const DEFAULT_STEP_PAGE_SIZE: usize = 1000;

/// What a step did to one aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    /// Source records folded during this step.
    pub processed: i64,
    /// False when the step stopped early because the limiter ran out.
    pub caught_up: bool,
}

/// Advances one aggregation and persists the result, including the run
/// marker for `mode`. The marker is never earlier than `current_time`, the
/// cutoff the invocation loads batches against.
///
/// A step may stop early when `limiter` is over time, but must leave the
/// aggregation in a consistent, saved state when it returns `Ok`.
#[async_trait]
pub trait AggregationStep: Send + Sync {
    async fn execute(
        &self,
        aggregation: Aggregation,
        mode: AggregationMode,
        current_time: DateTime<Utc>,
        limiter: &RuntimeLimiter,
    ) -> Result<StepOutcome>;
}

/// Sums event values per target, reading events in cursor order.
#[derive(Debug, Clone)]
pub struct IncrementalStep {
    db: DbHandle,
    clock: SharedClock,
    page_size: usize,
}

impl IncrementalStep {
    pub fn new(db: DbHandle, clock: SharedClock) -> Self {
        Self {
            db,
            clock,
            page_size: DEFAULT_STEP_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn save(&self, aggregation: &Aggregation) -> Result<()> {
        let snapshot = aggregation.clone();
        self.db.call(move |db| db.save_aggregation(&snapshot)).await
    }
}

#[async_trait]
impl AggregationStep for IncrementalStep {
    async fn execute(
        &self,
        mut aggregation: Aggregation,
        mode: AggregationMode,
        current_time: DateTime<Utc>,
        limiter: &RuntimeLimiter,
    ) -> Result<StepOutcome> {
        let started = self.clock.monotonic();
        if mode == AggregationMode::Full {
            aggregation.reset_totals();
        }

        let mut processed = 0i64;
        let caught_up = loop {
            let target_id = aggregation.target_id;
            let cursor = aggregation.cursor;
            let page_size = self.page_size;
            let events = self
                .db
                .call(move |db| db.events_after(target_id, cursor, page_size))
                .await?;

            let exhausted = events.len() < page_size;
            for event in &events {
                aggregation.total_value += event.value;
                aggregation.processed_records += 1;
                aggregation.cursor = Some(event.cursor());
            }
            processed += events.len() as i64;

            if exhausted {
                break true;
            }
            // Keep the page durable before deciding whether to go on.
            self.save(&aggregation).await?;
            if limiter.over_time() {
                debug!(
                    aggregation_id = aggregation.id,
                    processed, "Step stopped between pages"
                );
                break false;
            }
        };

        let runtime = self.clock.monotonic().saturating_sub(started);
        aggregation.stats_mut(mode).record(runtime, processed);
        aggregation.mark_run(mode, self.clock.now().max(current_time));
        self.save(&aggregation).await?;

        Ok(StepOutcome {
            processed,
            caught_up,
        })
    }
}
