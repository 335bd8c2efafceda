//! Explicit per-invocation context for workers.

use std::time::Duration;

use uuid::Uuid;

use crate::clock::SharedClock;
use crate::limiter::RuntimeLimiter;

/// Everything a single worker invocation needs from its environment.
///
/// Built once by the caller (CLI, scheduler, test) and passed by value, so
/// workers never reach for global state.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Worker name, used as a log field.
    pub worker: String,
    /// Identifies one invocation across all of its log lines.
    pub correlation_id: Uuid,
    pub clock: SharedClock,
}

impl WorkerContext {
    pub fn new(worker: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            worker: worker.into(),
            correlation_id: Uuid::new_v4(),
            clock,
        }
    }

    /// Start a runtime budget for this invocation.
    pub fn limiter(&self, max_runtime: Duration) -> RuntimeLimiter {
        RuntimeLimiter::new(max_runtime, self.clock.clone())
    }
}
