//! Time-boxed batch aggregator loop.
//!
//! One `perform` call is one cron invocation: it keeps loading batches of
//! due aggregations and stepping each one until nothing is due or the
//! runtime budget is spent. Each processed aggregation's run marker moves
//! to at least the invocation's start time, so nothing is loaded twice in
//! the same invocation and a later invocation picks up where this one
//! stopped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cronlease_common::{RuntimeUsage, WorkerContext};
use serde::Serialize;
use tracing::{info, warn};

use super::model::AggregationMode;
use super::step::AggregationStep;
use crate::errors::{AggregationError, LeaseError};
use crate::lease::{ExclusiveLease, LockOptions};
use crate::store::DbHandle;

pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(250);
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Lease TTL beyond the runtime budget, so the lease outlives a slow last step.
const LEASE_TTL_MARGIN: Duration = Duration::from_secs(60);

/// One worker per mode runs at a time.
pub fn lease_key(mode: AggregationMode) -> String {
    format!("cronlease:aggregation_worker:{}", mode)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The last batch came back empty.
    CaughtUp,
    /// The runtime budget ran out; remaining aggregations wait for the next run.
    OverTime,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CaughtUp => "caught_up",
            Self::OverTime => "over_time",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    pub mode: AggregationMode,
    pub max_runtime: Duration,
    pub batch_size: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            mode: AggregationMode::Incremental,
            max_runtime: DEFAULT_MAX_RUNTIME,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Summary of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationReport {
    pub mode: AggregationMode,
    /// Aggregations whose step succeeded.
    pub processed: usize,
    /// Aggregations whose step returned an error.
    pub failed: usize,
    /// Source records folded across all successful steps.
    pub records: i64,
    pub stop_reason: StopReason,
    pub usage: RuntimeUsage,
}

pub struct AggregationWorker {
    db: DbHandle,
    step: Arc<dyn AggregationStep>,
    options: WorkerOptions,
}

impl fmt::Debug for AggregationWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationWorker")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AggregationWorker {
    pub fn new(db: DbHandle, step: Arc<dyn AggregationStep>, options: WorkerOptions) -> Self {
        Self {
            db,
            step,
            options: WorkerOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
        }
    }

    /// Run one invocation.
    ///
    /// A failing step is logged and counted, and its run marker is still
    /// stamped so the loop moves past it; it is retried on the next
    /// invocation. Failing to load a batch or to stamp a failed aggregation
    /// aborts the invocation.
    #[tracing::instrument(
        skip(self, ctx),
        fields(worker = %ctx.worker, correlation_id = %ctx.correlation_id, mode = %self.options.mode)
    )]
    pub async fn perform(&self, ctx: WorkerContext) -> Result<AggregationReport, AggregationError> {
        let WorkerOptions {
            mode,
            max_runtime,
            batch_size,
        } = self.options;
        let current_time = ctx.clock.now();
        let limiter = ctx.limiter(max_runtime);

        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut records = 0i64;

        let stop_reason = 'batches: loop {
            let batch = self
                .db
                .call(move |db| db.load_aggregation_batch(mode, current_time, batch_size))
                .await
                .map_err(AggregationError::Store)?;
            if batch.is_empty() {
                break StopReason::CaughtUp;
            }

            for aggregation in batch {
                let aggregation_id = aggregation.id;
                match self
                    .step
                    .execute(aggregation, mode, current_time, &limiter)
                    .await
                {
                    Ok(outcome) => {
                        processed += 1;
                        records += outcome.processed;
                    }
                    Err(source) => {
                        let err = AggregationError::Step {
                            aggregation_id,
                            source,
                        };
                        warn!(aggregation_id, error = %err, "Aggregation step failed");
                        failed += 1;
                        let at = ctx.clock.now().max(current_time);
                        self.db
                            .call(move |db| db.mark_aggregation_run(aggregation_id, mode, at))
                            .await
                            .map_err(AggregationError::Store)?;
                    }
                }

                if limiter.over_time() {
                    break 'batches StopReason::OverTime;
                }
            }
        };

        let report = AggregationReport {
            mode,
            processed,
            failed,
            records,
            stop_reason,
            usage: limiter.usage(),
        };
        info!(
            processed,
            failed,
            records,
            stop_reason = %stop_reason,
            elapsed_seconds = report.usage.elapsed_seconds,
            "Aggregation invocation finished"
        );
        Ok(report)
    }

    /// Like [`perform`](Self::perform), but only while holding the mode's
    /// exclusive lease. Returns `Ok(None)` without doing any work when
    /// another invocation already holds it.
    ///
    /// The lease TTL is raised to outlast the runtime budget.
    pub async fn perform_exclusive(
        &self,
        ctx: WorkerContext,
        lease: &ExclusiveLease,
        options: LockOptions,
    ) -> Result<Option<AggregationReport>, AggregationError> {
        let key = lease_key(self.options.mode);
        let options = LockOptions {
            ttl: options.ttl.max(self.options.max_runtime + LEASE_TTL_MARGIN),
            ..options
        };

        let result = lease
            .in_lock(&key, options, |_retried| async move {
                self.perform(ctx).await.map(Some)
            })
            .await;

        match result {
            Err(AggregationError::Lease(LeaseError::LockNotObtained { .. })) => {
                info!(
                    lease_key = %key,
                    "Cannot obtain an exclusive lease. There must be another instance already in execution."
                );
                Ok(None)
            }
            other => other,
        }
    }
}
