//! Incremental aggregation of source events into per-target cursors.
//!
//! - `model`: aggregation cursors, source events, rolling run statistics
//! - `step`: the unit of work applied to one aggregation
//! - `worker`: the time-boxed loop that drives steps over due aggregations

pub mod model;
pub mod step;
pub mod worker;

pub use model::{Aggregation, AggregationMode, Event, EventCursor, RunStats};
pub use step::{AggregationStep, IncrementalStep, StepOutcome};
pub use worker::{AggregationReport, AggregationWorker, StopReason, WorkerOptions};
