//! Scoped lease acquisition with bounded retry.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use super::{LeaseBackend, LeaseGuard};
use crate::errors::LeaseError;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_SLEEP: Duration = Duration::from_millis(10);
pub const DEFAULT_RETRIES: u32 = 10;

/// How long to hold a lease and how hard to try for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Pause between failed attempts.
    pub sleep: Duration,
    /// Attempts after the first. Zero means try exactly once.
    pub retries: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            sleep: DEFAULT_SLEEP,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl LockOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Runs units of work while holding an exclusive lease.
#[derive(Clone)]
pub struct ExclusiveLease {
    backend: Arc<dyn LeaseBackend>,
}

impl std::fmt::Debug for ExclusiveLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveLease").finish_non_exhaustive()
    }
}

impl ExclusiveLease {
    pub fn new(backend: Arc<dyn LeaseBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn LeaseBackend> {
        &self.backend
    }

    /// Obtain `key`, run `f` exactly once while holding it, then release.
    ///
    /// `f` receives `true` when the lease was only obtained after at least
    /// one retry. The lease is released whether `f` returns `Ok`, returns
    /// `Err`, or panics (the panic is resumed after release). If this future
    /// is dropped mid-work, release is spawned onto the current runtime. If
    /// the lease cannot be obtained within `options.attempts()` tries, `f`
    /// never runs and `LeaseError::LockNotObtained` is returned through `E`.
    pub async fn in_lock<F, Fut, T, E>(&self, key: &str, options: LockOptions, f: F) -> Result<T, E>
    where
        F: FnOnce(bool) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LeaseError>,
    {
        let (guard, retried) = self.obtain(key, &options).await?;
        debug!(key = %guard.key, retried, "Obtained exclusive lease");
        let mut held = HeldLease::new(self.backend.clone(), guard);

        let outcome = AssertUnwindSafe(async move { f(retried).await })
            .catch_unwind()
            .await;

        if let Some(guard) = held.disarm() {
            release(self.backend.as_ref(), &guard).await;
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn obtain(&self, key: &str, options: &LockOptions) -> Result<(LeaseGuard, bool), LeaseError> {
        let attempts = options.attempts();
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(options.sleep).await;
            }
            if let Some(guard) = self.backend.try_obtain(key, options.ttl).await? {
                return Ok((guard, attempt > 0));
            }
            debug!(key, attempt = attempt + 1, attempts, "Lease is held elsewhere");
        }
        Err(LeaseError::LockNotObtained {
            key: key.to_string(),
            attempts,
        })
    }
}

/// Release failures are logged, not returned: the work already ran, and
/// the TTL frees the key eventually.
async fn release(backend: &dyn LeaseBackend, guard: &LeaseGuard) {
    match backend.cancel(guard).await {
        Ok(true) => debug!(key = %guard.key, "Released exclusive lease"),
        Ok(false) => warn!(
            key = %guard.key,
            ttl_secs = guard.ttl.as_secs_f64(),
            "Lease expired before release; work may have outlived its TTL"
        ),
        Err(e) => warn!(key = %guard.key, error = %e, "Failed to release lease"),
    }
}

/// Lease held across the `in_lock` await point.
///
/// Dropping it while armed means the caller's future was cancelled; the
/// release is then spawned on the current runtime. Outside a runtime the
/// TTL frees the key.
struct HeldLease {
    backend: Arc<dyn LeaseBackend>,
    guard: Option<LeaseGuard>,
}

impl HeldLease {
    fn new(backend: Arc<dyn LeaseBackend>, guard: LeaseGuard) -> Self {
        Self {
            backend,
            guard: Some(guard),
        }
    }

    fn disarm(&mut self) -> Option<LeaseGuard> {
        self.guard.take()
    }
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %guard.key, "Lease dropped outside a runtime; left to expire");
            return;
        };
        debug!(key = %guard.key, "Work cancelled while holding lease; releasing");
        let backend = self.backend.clone();
        handle.spawn(async move {
            release(backend.as_ref(), &guard).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::MemoryLeaseBackend;
    use chrono::Utc;
    use cronlease_common::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn lease() -> ExclusiveLease {
        let clock = ManualClock::new(Utc::now());
        ExclusiveLease::new(Arc::new(MemoryLeaseBackend::new(clock.shared())))
    }

    fn quick() -> LockOptions {
        LockOptions::new(Duration::from_secs(30))
            .with_sleep(Duration::from_millis(1))
            .with_retries(2)
    }

    #[test]
    fn default_options() {
        let options = LockOptions::default();
        assert_eq!(options.ttl, Duration::from_secs(60));
        assert_eq!(options.retries, 10);
        assert_eq!(options.attempts(), 11);
    }

    #[tokio::test]
    async fn runs_block_once_and_releases() {
        let lease = lease();
        let runs = AtomicU32::new(0);
        let runs_ref = &runs;

        let value = lease
            .in_lock("k", quick(), |retried| async move {
                assert!(!retried);
                runs_ref.fetch_add(1, Ordering::SeqCst);
                Ok::<_, LeaseError>(7)
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!lease.backend().exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn fails_when_lease_is_held() {
        let lease = lease();
        let _held = lease
            .backend()
            .try_obtain("k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let ran = AtomicU32::new(0);
        let ran_ref = &ran;
        let err = lease
            .in_lock("k", quick(), |_| async move {
                ran_ref.fetch_add(1, Ordering::SeqCst);
                Ok::<_, LeaseError>(())
            })
            .await
            .unwrap_err();

        match err {
            LeaseError::LockNotObtained { key, attempts } => {
                assert_eq!(key, "k");
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected LockNotObtained, got {other:?}"),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn releases_after_error() {
        let lease = lease();
        let result: Result<(), anyhow::Error> = lease
            .in_lock("k", quick(), |_| async { Err(anyhow::anyhow!("work failed")) })
            .await;
        assert!(result.is_err());
        assert!(!lease.backend().exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn releases_after_panic_and_resumes_it() {
        let lease = lease();
        let inner = lease.clone();
        let handle = tokio::spawn(async move {
            inner
                .in_lock("k", quick(), |_| async {
                    if true {
                        panic!("boom");
                    }
                    Ok::<_, LeaseError>(())
                })
                .await
        });

        let join = handle.await;
        assert!(join.unwrap_err().is_panic());
        assert!(!lease.backend().exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn releases_when_work_is_cancelled() {
        let lease = lease();
        let options = LockOptions::new(Duration::from_secs(600));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            lease.in_lock("k", options, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, LeaseError>(())
            }),
        )
        .await;
        assert!(cancelled.is_err());

        let mut released = false;
        for _ in 0..100 {
            if !lease.backend().exists("k").await.unwrap() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(released, "lease still held after the work was cancelled");
    }

    #[tokio::test]
    async fn reports_retried_when_obtained_late() {
        let clock = ManualClock::new(Utc::now());
        let backend = Arc::new(MemoryLeaseBackend::new(clock.shared()));
        let lease = ExclusiveLease::new(backend.clone());
        let held = backend
            .try_obtain("k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let releaser = {
            let backend = backend.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                backend.cancel(&held).await.unwrap();
            })
        };

        let options = LockOptions::new(Duration::from_secs(30))
            .with_sleep(Duration::from_millis(5))
            .with_retries(200);
        let retried = lease
            .in_lock("k", options, |retried| async move { Ok::<_, LeaseError>(retried) })
            .await
            .unwrap();

        releaser.await.unwrap();
        assert!(retried);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_runs_block_concurrently_for_one_key() {
        let lease = lease();
        let inside = Arc::new(AtomicU32::new(0));
        let max_inside = Arc::new(AtomicU32::new(0));
        let completed = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let lease = lease.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            let completed = completed.clone();
            tasks.push(tokio::spawn(async move {
                let options = LockOptions::new(Duration::from_secs(30))
                    .with_sleep(Duration::from_millis(2))
                    .with_retries(2_000);
                let (inside, max_inside, completed) = (&inside, &max_inside, &completed);
                lease
                    .in_lock("shared", options, |_| async move {
                        let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now_inside, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(3)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, LeaseError>(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 8);
    }
}
