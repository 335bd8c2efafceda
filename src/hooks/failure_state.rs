//! Lease-guarded updates of a webhook's failure and backoff state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cronlease_common::SharedClock;
use tracing::{debug, info};

use super::model::{ResponseCategory, WebHook};
use crate::errors::{HookError, LeaseError};
use crate::lease::{ExclusiveLease, LockOptions};
use crate::store::DbHandle;

pub const LOCK_TTL: Duration = Duration::from_secs(15);
pub const LOCK_SLEEP: Duration = Duration::from_millis(250);
pub const LOCK_RETRIES: u32 = 65;

/// Lease key guarding one hook's failure state.
pub fn lease_key(hook_id: i64) -> String {
    format!("web_hooks:update_hook_failure_state:{}", hook_id)
}

pub fn default_lock_options() -> LockOptions {
    LockOptions::new(LOCK_TTL)
        .with_sleep(LOCK_SLEEP)
        .with_retries(LOCK_RETRIES)
}

/// Result of a successful `update` call.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureStateUpdate {
    /// The transition ran under the lease. `changed` is false when the
    /// hook already was in the target state.
    Applied { hook: WebHook, changed: bool },
    /// The lease was busy, but the hook's state already agrees with the
    /// outcome, so nothing needed to happen.
    AlreadyConsistent { hook: WebHook },
}

impl FailureStateUpdate {
    pub fn hook(&self) -> &WebHook {
        match self {
            Self::Applied { hook, .. } | Self::AlreadyConsistent { hook } => hook,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureStateUpdater {
    db: DbHandle,
    lease: ExclusiveLease,
    clock: SharedClock,
    options: LockOptions,
}

impl FailureStateUpdater {
    pub fn new(db: DbHandle, lease: ExclusiveLease, clock: SharedClock) -> Self {
        Self {
            db,
            lease,
            clock,
            options: default_lock_options(),
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    /// Record a delivery outcome for `hook_id`.
    ///
    /// The hook is reloaded inside the lease so concurrent deliveries never
    /// apply transitions to stale state. When the lease cannot be obtained
    /// the error is swallowed only if the hook is already executable for an
    /// `Ok` outcome, or already not executable for any other outcome.
    pub async fn update(
        &self,
        hook_id: i64,
        category: ResponseCategory,
    ) -> Result<FailureStateUpdate, HookError> {
        let key = lease_key(hook_id);
        let result = self
            .lease
            .in_lock(&key, self.options, |retried| async move {
                let mut hook = self.find(hook_id).await?;
                let before = hook.clone();
                let now = self.clock.now();

                hook.apply(category, now);
                let changed = hook != before;
                if changed {
                    let snapshot = hook.clone();
                    self.db
                        .call(move |db| db.save_web_hook_failure_state(&snapshot))
                        .await
                        .map_err(HookError::Store)?;
                }
                self.update_last_failure(&hook, now).await?;

                debug!(
                    hook_id,
                    category = %category,
                    retried,
                    changed,
                    status = %hook.status(now),
                    "Updated web hook failure state"
                );
                Ok::<_, HookError>(FailureStateUpdate::Applied { hook, changed })
            })
            .await;

        match result {
            Err(HookError::Lease(err @ LeaseError::LockNotObtained { .. })) => {
                self.reconcile(hook_id, category, err).await
            }
            other => other,
        }
    }

    async fn reconcile(
        &self,
        hook_id: i64,
        category: ResponseCategory,
        err: LeaseError,
    ) -> Result<FailureStateUpdate, HookError> {
        let hook = self.find(hook_id).await?;
        let executable = hook.executable(self.clock.now());
        if executable == (category == ResponseCategory::Ok) {
            info!(
                hook_id,
                category = %category,
                executable,
                "Failed to obtain lock for web hook failure state, but state is consistent"
            );
            return Ok(FailureStateUpdate::AlreadyConsistent { hook });
        }
        Err(err.into())
    }

    /// Move the project's last-failure marker forward when the hook can no
    /// longer execute.
    async fn update_last_failure(&self, hook: &WebHook, now: DateTime<Utc>) -> Result<(), HookError> {
        if hook.executable(now) {
            return Ok(());
        }
        let project_id = hook.project_id;
        self.db
            .call(move |db| db.record_hook_last_failure(project_id, now))
            .await
            .map_err(HookError::Store)?;
        Ok(())
    }

    async fn find(&self, hook_id: i64) -> Result<WebHook, HookError> {
        self.db
            .call(move |db| db.get_web_hook(hook_id))
            .await
            .map_err(HookError::Store)?
            .ok_or(HookError::NotFound { id: hook_id })
    }
}
