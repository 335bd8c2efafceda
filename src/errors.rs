//! Typed error hierarchy for cronlease workers.
//!
//! One enum per subsystem:
//! - `LeaseError` for exclusive lease acquisition and backend failures
//! - `AggregationError` for the batch aggregator loop and its steps
//! - `HookError` for webhook failure-state updates and delivery
//! - `CounterError` for buffered counter attributes
//!
//! Running out of runtime budget is deliberately absent: it is reported as
//! a stop reason, not an error.

use thiserror::Error;

/// Errors from the exclusive lease guard.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("Failed to obtain a lock '{key}' after {attempts} attempts")]
    LockNotObtained { key: String, attempts: u32 },

    #[error("Lease backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl LeaseError {
    pub fn is_lock_not_obtained(&self) -> bool {
        matches!(self, LeaseError::LockNotObtained { .. })
    }
}

/// Errors from the aggregation worker.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("Aggregation store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Aggregation {aggregation_id} step failed: {source}")]
    Step {
        aggregation_id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Lease(#[from] LeaseError),
}

/// Errors from webhook failure-state updates and delivery.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Web hook {id} not found")]
    NotFound { id: i64 },

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("Hook store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Hook delivery failed: {0}")]
    Delivery(#[from] reqwest::Error),
}

/// Errors from buffered counter attributes.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("{attribute} is not a counter attribute")]
    UnknownAttribute { attribute: String },

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("Counter store error: {0}")]
    Store(#[source] anyhow::Error),
}
