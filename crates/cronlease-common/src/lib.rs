//! Pure building blocks shared by cronlease workers.
//!
//! Nothing in this crate performs I/O. Time is read through the [`Clock`]
//! trait so that workers and their tests agree on a single source of "now".

pub mod clock;
pub mod context;
pub mod limiter;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use context::WorkerContext;
pub use limiter::{DEFAULT_MAX_RUNTIME, RuntimeLimiter, RuntimeUsage};
