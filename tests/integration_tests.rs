use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use gatekeeper::clock::ManualClock;
use gatekeeper::validation::RegisterWebhook;
use gatekeeper::webhook::{signature, DeliveryStatus, ReqwestTransport};
use gatekeeper::{Dimension, Gatekeeper, GatekeeperError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, Clone)]
struct Received {
    headers: HeaderMap,
    body: Bytes,
}

/// Receiver that answers 500 to its first `failures` requests, then 200.
#[derive(Clone)]
struct MockReceiver {
    failures: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Received>>>,
}

impl MockReceiver {
    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

async fn receive(State(receiver): State<MockReceiver>, headers: HeaderMap, body: Bytes) -> StatusCode {
    receiver.received.lock().unwrap().push(Received { headers, body });
    let failing = receiver
        .failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok();
    if failing {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn spawn_receiver(failures: usize) -> (SocketAddr, MockReceiver) {
    let receiver = MockReceiver {
        failures: Arc::new(AtomicUsize::new(failures)),
        received: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/hook", post(receive))
        .with_state(receiver.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, receiver)
}

fn gatekeeper_with_clock() -> (Gatekeeper, ManualClock) {
    let clock = ManualClock::new(Utc::now());
    let gatekeeper = Gatekeeper::in_memory(
        Arc::new(ReqwestTransport::default()),
        Arc::new(clock.clone()),
    );
    (gatekeeper, clock)
}

#[tokio::test]
async fn test_webhook_retries_until_receiver_recovers() {
    let (addr, receiver) = spawn_receiver(3).await;
    let (gatekeeper, clock) = gatekeeper_with_clock();
    let webhooks = gatekeeper.webhooks();

    let webhook = webhooks
        .register(RegisterWebhook::new(
            format!("http://{}/hook", addr),
            &["settings.updated"],
        ))
        .await
        .unwrap();

    let payload = json!({"section": "colors", "primary": "#1d4ed8"});
    let ids = webhooks.trigger("settings.updated", &payload).await;
    assert_eq!(ids.len(), 1);

    for _ in 0..3 {
        let pending = webhooks.delivery(ids[0]).await.unwrap();
        assert_eq!(pending.status, DeliveryStatus::Pending);
        clock.set(pending.next_retry_at.unwrap());
        webhooks.process_pending().await.unwrap();
    }

    let delivery = webhooks.delivery(ids[0]).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_count, 4);
    assert_eq!(delivery.response_code, Some(200));

    let received = receiver.received();
    assert_eq!(received.len(), 4);
    for request in &received {
        let header = request.headers["x-signature"].to_str().unwrap();
        assert!(signature::verify(&webhook.secret, &request.body, header));
        assert_eq!(request.headers["x-event"], "settings.updated");
        assert_eq!(request.headers["x-delivery-id"], ids[0].to_string().as_str());
        assert_eq!(request.headers["content-type"], "application/json");
        assert!(request.headers["user-agent"]
            .to_str()
            .unwrap()
            .starts_with("gatekeeper/"));

        let body: Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["event"], "settings.updated");
        assert_eq!(body["payload"], payload);
    }

    let history = webhooks.deliveries(webhook.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_unreachable_receiver_is_rescheduled() {
    let (gatekeeper, _clock) = gatekeeper_with_clock();
    let webhooks = gatekeeper.webhooks();
    webhooks
        .register(RegisterWebhook::new("http://127.0.0.1:9/hook", &["backup.created"]))
        .await
        .unwrap();

    // Delivery failures never reach the triggering caller.
    let ids = webhooks.trigger("backup.created", &json!({})).await;
    let delivery = webhooks.delivery(ids[0]).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Pending);
    assert_eq!(delivery.attempt_count, 1);
    assert!(delivery.response_code.is_none());
    assert!(delivery.last_error.is_some());
}

#[tokio::test]
async fn test_rate_limit_admission_by_resolved_origin() {
    let (gatekeeper, _clock) = gatekeeper_with_clock();
    let headers: HashMap<String, String> =
        [("X-Forwarded-For".to_string(), "203.0.113.9, 10.0.0.1".to_string())].into();
    let origin = gatekeeper.ip_resolver().resolve(&headers, None);
    assert_eq!(origin, "203.0.113.9");

    let limiter = gatekeeper.rate_limiter();
    for _ in 0..3 {
        assert_ok!(limiter.check_and_consume("backup_restore", "user-1", &origin).await);
    }
    let err = assert_err!(limiter.check_and_consume("backup_restore", "user-1", &origin).await);
    match err {
        GatekeeperError::RateLimitExceeded {
            retry_after,
            dimension,
        } => {
            assert_eq!(dimension, Dimension::User);
            assert!(retry_after <= Duration::from_secs(3600));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The origin quota is shared, so another user behind the same address is refused too.
    let err = assert_err!(limiter.check_and_consume("backup_restore", "user-2", &origin).await);
    assert!(matches!(
        err,
        GatekeeperError::RateLimitExceeded {
            dimension: Dimension::Origin,
            ..
        }
    ));
}

#[tokio::test]
async fn test_duplicate_submissions_run_once() {
    let (gatekeeper, _clock) = gatekeeper_with_clock();
    let runs = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for nonce in 0..5 {
        let gatekeeper = gatekeeper.clone();
        let runs = runs.clone();
        tasks.push(tokio::spawn(async move {
            let data = json!({"theme": "dark", "accent": "teal", "_wpnonce": nonce});
            gatekeeper
                .dedup()
                .execute_once("settings_save", "user-1", &data, None, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, GatekeeperError>(json!({"saved": true, "version": 4}))
                })
                .await
        }));
    }

    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result, json!({"saved": true, "version": 4}));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exclusive_operation_rejects_concurrent_writer() {
    let (gatekeeper, _clock) = gatekeeper_with_clock();
    let locks = gatekeeper.locks();
    let payload = json!({"backup": "2024-06-01"});

    let token = locks
        .acquire("backup_restore", "user-1", &payload, None)
        .await
        .unwrap();
    let contended = locks
        .run_exclusive("backup_restore", "user-1", &payload, None, || async {
            Ok::<_, GatekeeperError>(())
        })
        .await;
    assert!(matches!(contended, Err(GatekeeperError::LockHeld { .. })));

    assert!(locks.release(&token).await.unwrap());
    let done = locks
        .run_exclusive("backup_restore", "user-1", &payload, None, || async {
            Ok::<_, GatekeeperError>("restored")
        })
        .await
        .unwrap();
    assert_eq!(done, "restored");
    assert!(!locks.is_locked("backup_restore", "user-1", &payload).await.unwrap());
}

#[tokio::test]
async fn test_health_check_reports_store() {
    let (gatekeeper, _clock) = gatekeeper_with_clock();
    let health = gatekeeper.health_check().await;
    assert!(health.is_healthy());
    assert_eq!(health.backend, "memory");
}
