//! HTTP delivery of webhook payloads.

use std::time::Duration;

use cronlease_common::SharedClock;
use serde::Serialize;
use tracing::{info, warn};

use super::failure_state::{FailureStateUpdate, FailureStateUpdater};
use super::model::{HookStatus, ResponseCategory, WebHook};
use crate::errors::HookError;
use crate::store::DbHandle;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_HEADER: &str = "X-Cronlease-Event";

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The hook was not executable; no request was sent.
    Skipped { status: HookStatus },
    Delivered {
        category: ResponseCategory,
        /// Absent when the request never got a response.
        http_status: Option<u16>,
        update: FailureStateUpdate,
    },
}

#[derive(Debug, Clone)]
pub struct HookDelivery {
    db: DbHandle,
    client: reqwest::Client,
    updater: FailureStateUpdater,
    clock: SharedClock,
}

impl HookDelivery {
    pub fn new(
        db: DbHandle,
        updater: FailureStateUpdater,
        clock: SharedClock,
        timeout: Duration,
    ) -> Result<Self, HookError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cronlease/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            db,
            client,
            updater,
            clock,
        })
    }

    /// POST `payload` to the hook's URL and record how it went.
    ///
    /// Transport failures count against the hook. A request that cannot
    /// be built (bad URL, unserializable payload) is returned as
    /// `HookError::Delivery` and leaves the hook's state alone.
    pub async fn execute<P: Serialize + ?Sized>(
        &self,
        hook_id: i64,
        event: &str,
        payload: &P,
    ) -> Result<DeliveryOutcome, HookError> {
        let hook = self
            .db
            .call(move |db| db.get_web_hook(hook_id))
            .await
            .map_err(HookError::Store)?
            .ok_or(HookError::NotFound { id: hook_id })?;

        let status = hook.status(self.clock.now());
        if status != HookStatus::Enabled {
            info!(hook_id, status = %status, "Skipping web hook that is not executable");
            return Ok(DeliveryOutcome::Skipped { status });
        }

        let (category, http_status) = self.post(&hook, event, payload).await?;
        let update = self.updater.update(hook_id, category).await?;
        Ok(DeliveryOutcome::Delivered {
            category,
            http_status,
            update,
        })
    }

    async fn post<P: Serialize + ?Sized>(
        &self,
        hook: &WebHook,
        event: &str,
        payload: &P,
    ) -> Result<(ResponseCategory, Option<u16>), HookError> {
        let response = self
            .client
            .post(&hook.url)
            .header(EVENT_HEADER, event)
            .json(payload)
            .send()
            .await;
        match response {
            Ok(resp) => {
                let code = resp.status().as_u16();
                let category = ResponseCategory::from_status(code);
                info!(hook_id = hook.id, status = code, category = %category, "Web hook delivered");
                Ok((category, Some(code)))
            }
            Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                warn!(hook_id = hook.id, error = %e, "Web hook request failed");
                Ok((ResponseCategory::Error, None))
            }
            Err(e) => Err(HookError::Delivery(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{ExclusiveLease, MemoryLeaseBackend};
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use chrono::{TimeZone, Utc};
    use cronlease_common::ManualClock;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn serve() -> String {
        let app = Router::new()
            .route("/ok", post(|| async { StatusCode::OK }))
            .route("/boom", post(|| async { StatusCode::BAD_GATEWAY }))
            .route("/gone", post(|| async { StatusCode::GONE }))
            .route(
                "/echo-event",
                post(|headers: HeaderMap| async move {
                    match headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok()) {
                        Some("push") => StatusCode::NO_CONTENT,
                        _ => StatusCode::BAD_REQUEST,
                    }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    struct Fixture {
        db: DbHandle,
        delivery: HookDelivery,
    }

    fn fixture() -> Fixture {
        let db = DbHandle::open_in_memory().unwrap();
        let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let lease = ExclusiveLease::new(Arc::new(MemoryLeaseBackend::new(clock.shared())));
        let updater = FailureStateUpdater::new(db.clone(), lease, clock.shared());
        let delivery =
            HookDelivery::new(db.clone(), updater, clock.shared(), Duration::from_secs(5)).unwrap();
        Fixture { db, delivery }
    }

    async fn hook_at(db: &DbHandle, url: String) -> WebHook {
        db.call(move |db| db.create_web_hook(1, &url)).await.unwrap()
    }

    async fn reload(db: &DbHandle, id: i64) -> WebHook {
        db.call(move |db| db.get_web_hook(id)).await.unwrap().unwrap()
    }

    fn payload() -> serde_json::Value {
        serde_json::json!({"object_kind": "push", "ref": "refs/heads/main"})
    }

    #[tokio::test]
    async fn success_is_recorded_as_ok() {
        let base = serve().await;
        let f = fixture();
        let hook = hook_at(&f.db, format!("{}/ok", base)).await;

        let outcome = f.delivery.execute(hook.id, "push", &payload()).await.unwrap();
        match outcome {
            DeliveryOutcome::Delivered {
                category,
                http_status,
                ..
            } => {
                assert_eq!(category, ResponseCategory::Ok);
                assert_eq!(http_status, Some(200));
            }
            other => panic!("Expected Delivered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn event_name_is_sent_as_header() {
        let base = serve().await;
        let f = fixture();
        let hook = hook_at(&f.db, format!("{}/echo-event", base)).await;

        let outcome = f.delivery.execute(hook.id, "push", &payload()).await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Delivered {
                http_status: Some(204),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn server_error_backs_off_and_next_delivery_is_skipped() {
        let base = serve().await;
        let f = fixture();
        let hook = hook_at(&f.db, format!("{}/boom", base)).await;

        let outcome = f.delivery.execute(hook.id, "push", &payload()).await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Delivered {
                category: ResponseCategory::Error,
                http_status: Some(502),
                ..
            }
        ));
        assert_eq!(reload(&f.db, hook.id).await.backoff_count, 1);

        let next = f.delivery.execute(hook.id, "push", &payload()).await.unwrap();
        assert!(matches!(
            next,
            DeliveryOutcome::Skipped {
                status: HookStatus::BackingOff { .. }
            }
        ));
    }

    #[tokio::test]
    async fn client_error_counts_a_failure() {
        let base = serve().await;
        let f = fixture();
        let hook = hook_at(&f.db, format!("{}/gone", base)).await;

        f.delivery.execute(hook.id, "push", &payload()).await.unwrap();

        let saved = reload(&f.db, hook.id).await;
        assert_eq!(saved.recent_failures, 1);
        assert_eq!(saved.disabled_until, None);
    }

    #[tokio::test]
    async fn connection_refused_is_treated_as_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let f = fixture();
        let hook = hook_at(&f.db, format!("http://{}/hook", addr)).await;

        let outcome = f.delivery.execute(hook.id, "push", &payload()).await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Delivered {
                category: ResponseCategory::Error,
                http_status: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unbuildable_request_leaves_hook_untouched() {
        let base = serve().await;
        let f = fixture();
        let hook = hook_at(&f.db, format!("{}/ok", base)).await;

        // JSON object keys must be strings.
        let payload: std::collections::HashMap<(i32, i32), i32> = [((1, 2), 3)].into();
        let err = f.delivery.execute(hook.id, "push", &payload).await.unwrap_err();
        assert!(matches!(err, HookError::Delivery(_)));

        let saved = reload(&f.db, hook.id).await;
        assert_eq!(saved.backoff_count, 0);
        assert_eq!(saved.recent_failures, 0);
        assert_eq!(saved.disabled_until, None);
    }

    #[tokio::test]
    async fn unknown_hook_is_not_found() {
        let f = fixture();
        let err = f.delivery.execute(9, "push", &payload()).await.unwrap_err();
        assert!(matches!(err, HookError::NotFound { id: 9 }));
    }
}
