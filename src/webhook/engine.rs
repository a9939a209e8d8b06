//! Webhook registration and the delivery state machine.
//!
//! A delivery moves `pending -> in_progress` through an atomic claim in the
//! repository, then back to `pending` with a backoff schedule, or on to
//! `success` / `failed`. Only the claimant attempts a delivery, so a
//! trigger-initiated attempt and a concurrent sweep never both send it. A
//! claim left behind by a crashed worker is taken over once it is older
//! than the claim lease.

use super::backoff::RetryPolicy;
use super::repository::WebhookRepository;
use super::signature;
use super::transport::{DeliveryMode, HttpResponse, HttpTransport};
use super::types::{
    is_supported_event, Delivery, DeliveryStatus, Envelope, SweepReport, Webhook,
    DELIVERY_ID_HEADER, EVENT_HEADER, SIGNATURE_HEADER, TEST_EVENT,
};
use crate::clock::Clock;
use crate::error::{GatekeeperError, Result};
use crate::validation::{RegisterWebhook, UpdateWebhook};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub retry: RetryPolicy,
    /// Per-request timeout in blocking mode.
    pub timeout: Duration,
    pub mode: DeliveryMode,
    /// Deliveries claimed per sweep.
    pub batch_size: usize,
    /// Age after which an `in_progress` claim is considered abandoned.
    pub claim_lease: Duration,
    pub user_agent: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(10),
            mode: DeliveryMode::Blocking,
            batch_size: 50,
            claim_lease: Duration::from_secs(120),
            user_agent: format!("gatekeeper/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Clone)]
pub struct WebhookEngine {
    repository: Arc<dyn WebhookRepository>,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    config: Arc<WebhookConfig>,
}

fn later(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn earlier(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
    at.checked_sub_signed(by).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl WebhookEngine {
    pub fn new(
        repository: Arc<dyn WebhookRepository>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        config: WebhookConfig,
    ) -> Self {
        Self {
            repository,
            transport,
            clock,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    pub async fn register(&self, request: RegisterWebhook) -> Result<Webhook> {
        request.check()?;
        let now = self.clock.now();
        let webhook = Webhook {
            id: Uuid::new_v4(),
            url: request.url,
            events: request.events.into_iter().collect(),
            secret: request.secret.unwrap_or_else(signature::generate_secret),
            active: true,
            created_at: now,
            updated_at: now,
        };
        self.repository.save_webhook(&webhook).await?;

        info!(webhook_id = %webhook.id, url = %webhook.url, events = ?webhook.events, "Webhook registered");
        Ok(webhook)
    }

    pub async fn get(&self, id: Uuid) -> Result<Webhook> {
        self.repository
            .get_webhook(id)
            .await?
            .ok_or_else(|| GatekeeperError::NotFound(format!("Webhook {} not found", id)))
    }

    pub async fn list(&self) -> Result<Vec<Webhook>> {
        self.repository.list_webhooks().await
    }

    pub async fn update(&self, id: Uuid, request: UpdateWebhook) -> Result<Webhook> {
        request.check()?;
        let mut webhook = self.get(id).await?;
        if let Some(url) = request.url {
            webhook.url = url;
        }
        if let Some(events) = request.events {
            webhook.events = events.into_iter().collect();
        }
        self.touch(webhook).await
    }

    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<Webhook> {
        let mut webhook = self.get(id).await?;
        webhook.active = active;
        info!(webhook_id = %id, active, "Webhook activation changed");
        self.touch(webhook).await
    }

    /// Replaces the secret. Deliveries still pending are signed with the new one.
    pub async fn rotate_secret(&self, id: Uuid) -> Result<Webhook> {
        let mut webhook = self.get(id).await?;
        webhook.secret = signature::generate_secret();
        info!(webhook_id = %id, "Webhook secret rotated");
        self.touch(webhook).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        if !self.repository.delete_webhook(id).await? {
            return Err(GatekeeperError::NotFound(format!("Webhook {} not found", id)));
        }
        info!(webhook_id = %id, "Webhook deleted");
        Ok(())
    }

    /// Delivery history of one webhook, newest first.
    pub async fn deliveries(&self, webhook_id: Uuid, limit: usize) -> Result<Vec<Delivery>> {
        self.repository
            .deliveries_for_webhook(webhook_id, limit)
            .await
    }

    pub async fn delivery(&self, id: Uuid) -> Result<Delivery> {
        self.repository
            .get_delivery(id)
            .await?
            .ok_or_else(|| GatekeeperError::NotFound(format!("Delivery {} not found", id)))
    }

    /// Sends a `webhook.test` event to one webhook regardless of its
    /// subscriptions and returns the delivery after its first attempt.
    pub async fn send_test(&self, id: Uuid) -> Result<Delivery> {
        let webhook = self.get(id).await?;
        if !webhook.active {
            return Err(GatekeeperError::Validation(format!(
                "Webhook {} is inactive",
                id
            )));
        }
        let payload = serde_json::json!({
            "webhook_id": webhook.id,
            "message": "Test delivery",
        });
        let delivery = self.enqueue(&webhook, TEST_EVENT, &payload).await?;
        self.deliver(delivery.id).await?;
        self.delivery(delivery.id).await
    }

    /// Creates one delivery per active subscriber of `event` and attempts
    /// each immediately. Failures are recorded on the deliveries and never
    /// returned; the ids let callers inspect them later.
    pub async fn trigger(&self, event: &str, payload: &Value) -> Vec<Uuid> {
        if !is_supported_event(event) {
            warn!(event, "Ignoring trigger for unsupported event");
            return Vec::new();
        }

        let webhooks = match self.repository.list_webhooks().await {
            Ok(webhooks) => webhooks,
            Err(e) => {
                error!(event, error = %e, "Failed to load webhooks for trigger");
                return Vec::new();
            }
        };

        let mut ids = Vec::new();
        for webhook in webhooks.iter().filter(|w| w.subscribes_to(event)) {
            match self.enqueue(webhook, event, payload).await {
                Ok(delivery) => ids.push(delivery.id),
                Err(e) => {
                    error!(webhook_id = %webhook.id, event, error = %e, "Failed to create delivery")
                }
            }
        }

        for id in &ids {
            if let Err(e) = self.deliver(*id).await {
                error!(delivery_id = %id, error = %e, "Delivery attempt could not be recorded");
            }
        }
        ids
    }

    /// [`trigger`](Self::trigger) on a spawned task so the caller does not
    /// wait on receivers.
    pub fn trigger_in_background(&self, event: &str, payload: Value) -> JoinHandle<Vec<Uuid>> {
        let engine = self.clone();
        let event = event.to_string();
        tokio::spawn(async move { engine.trigger(&event, &payload).await })
    }

    /// Claims and attempts one delivery. `Ok(None)` means it was not
    /// claimable: already being attempted elsewhere, finished, or not yet due.
    pub async fn deliver(&self, delivery_id: Uuid) -> Result<Option<Delivery>> {
        let now = self.clock.now();
        let stale_before = earlier(now, self.config.claim_lease);
        let Some(mut delivery) = self
            .repository
            .claim_delivery(delivery_id, now, stale_before)
            .await?
        else {
            debug!(delivery_id = %delivery_id, "Delivery not claimable");
            return Ok(None);
        };

        let webhook = match self.repository.get_webhook(delivery.webhook_id).await? {
            Some(webhook) if webhook.active => webhook,
            Some(_) => return self.abandon(delivery, "Webhook is inactive").await.map(Some),
            None => return self.abandon(delivery, "Webhook no longer exists").await.map(Some),
        };
        // Reclaimed after a crash that happened past the last attempt.
        if self.config.retry.is_exhausted(delivery.attempt_count) {
            return self.abandon(delivery, "Retries exhausted").await.map(Some);
        }

        delivery.attempt_count += 1;
        let outcome = self.send(&webhook, &delivery).await;
        let finished_at = self.clock.now();

        let (succeeded, response_code, failure) = match outcome {
            Ok(None) => (true, None, None),
            Ok(Some(response)) if response.is_success() => (true, Some(response.status), None),
            Ok(Some(response)) => (
                false,
                Some(response.status),
                Some(format!("Receiver responded with HTTP {}", response.status)),
            ),
            Err(e) => (false, None, Some(e.to_string())),
        };
        delivery.response_code = response_code;
        delivery.claimed_at = None;

        if succeeded {
            delivery.status = DeliveryStatus::Success;
            delivery.delivered_at = Some(finished_at);
            delivery.next_retry_at = None;
            delivery.last_error = None;
            info!(
                delivery_id = %delivery.id,
                webhook_id = %webhook.id,
                event = %delivery.event,
                attempt = delivery.attempt_count,
                response_code = ?response_code,
                "Webhook delivered"
            );
        } else if self.config.retry.is_exhausted(delivery.attempt_count) {
            delivery.status = DeliveryStatus::Failed;
            delivery.next_retry_at = None;
            delivery.last_error = failure;
            error!(
                delivery_id = %delivery.id,
                webhook_id = %webhook.id,
                event = %delivery.event,
                attempt = delivery.attempt_count,
                error = ?delivery.last_error,
                "Webhook delivery failed permanently"
            );
        } else {
            let delay = self.config.retry.delay_after(delivery.attempt_count);
            delivery.status = DeliveryStatus::Pending;
            delivery.next_retry_at = Some(later(finished_at, delay));
            delivery.last_error = failure;
            warn!(
                delivery_id = %delivery.id,
                webhook_id = %webhook.id,
                event = %delivery.event,
                attempt = delivery.attempt_count,
                retry_after_ms = delay.as_millis() as u64,
                error = ?delivery.last_error,
                "Webhook delivery failed, retry scheduled"
            );
        }

        self.repository.save_delivery(&delivery).await?;
        Ok(Some(delivery))
    }

    /// Attempts up to `batch_size` due deliveries, including claims whose
    /// lease has expired.
    pub async fn process_pending(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let stale_before = earlier(now, self.config.claim_lease);
        let due = self
            .repository
            .due_deliveries(now, stale_before, self.config.batch_size)
            .await?;

        let mut report = SweepReport::default();
        for id in due {
            match self.deliver(id).await {
                Ok(Some(delivery)) => {
                    report.attempted += 1;
                    match delivery.status {
                        DeliveryStatus::Success => report.succeeded += 1,
                        DeliveryStatus::Pending => report.rescheduled += 1,
                        DeliveryStatus::Failed => report.failed += 1,
                        DeliveryStatus::InProgress => {}
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    error!(delivery_id = %id, error = %e, "Sweep could not process delivery");
                    report.skipped += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                rescheduled = report.rescheduled,
                failed = report.failed,
                "Delivery sweep finished"
            );
        }
        Ok(report)
    }

    async fn touch(&self, mut webhook: Webhook) -> Result<Webhook> {
        webhook.updated_at = self.clock.now();
        self.repository.save_webhook(&webhook).await?;
        Ok(webhook)
    }

    async fn enqueue(&self, webhook: &Webhook, event: &str, payload: &Value) -> Result<Delivery> {
        let now = self.clock.now();
        let body = serde_json::to_string(&Envelope {
            event,
            payload,
            timestamp: now.timestamp(),
        })?;
        let delivery = Delivery::new(webhook.id, event, body, now);
        self.repository.insert_delivery(&delivery).await?;
        Ok(delivery)
    }

    async fn send(&self, webhook: &Webhook, delivery: &Delivery) -> Result<Option<HttpResponse>> {
        let signature = signature::sign(&webhook.secret, delivery.payload.as_bytes())?;
        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("User-Agent".to_string(), self.config.user_agent.clone()),
            (SIGNATURE_HEADER.to_string(), signature),
            (EVENT_HEADER.to_string(), delivery.event.clone()),
            (DELIVERY_ID_HEADER.to_string(), delivery.id.to_string()),
        ];
        self.transport
            .post(
                &webhook.url,
                &headers,
                &delivery.payload,
                self.config.timeout,
                self.config.mode,
            )
            .await
    }

    async fn abandon(&self, mut delivery: Delivery, reason: &str) -> Result<Delivery> {
        delivery.status = DeliveryStatus::Failed;
        delivery.claimed_at = None;
        delivery.next_retry_at = None;
        delivery.last_error = Some(reason.to_string());
        self.repository.save_delivery(&delivery).await?;

        error!(
            delivery_id = %delivery.id,
            webhook_id = %delivery.webhook_id,
            reason,
            "Webhook delivery abandoned"
        );
        Ok(delivery)
    }
}
