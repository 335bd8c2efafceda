//! Webhooks: failure and backoff state, lease-guarded updates, delivery.
//!
//! A delivery outcome is classified into a [`ResponseCategory`] and fed to
//! [`FailureStateUpdater::update`], which applies the matching transition
//! while holding the hook's exclusive lease:
//!
//! | outcome  | transition  |
//! |----------|-------------|
//! | `ok`     | `enable`    |
//! | `error`  | `backoff`   |
//! | `failed` | `failed`    |
//!
//! Updates for different hooks never contend; updates for the same hook
//! are serialized by the lease.

pub mod delivery;
pub mod failure_state;
pub mod model;

pub use delivery::{DeliveryOutcome, HookDelivery};
pub use failure_state::{FailureStateUpdate, FailureStateUpdater};
pub use model::{HookStatus, ResponseCategory, WebHook};
