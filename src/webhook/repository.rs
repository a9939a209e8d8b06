//! Durable storage for webhooks and their deliveries.

use super::types::{Delivery, DeliveryStatus, Webhook};
use crate::error::{GatekeeperError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn save_webhook(&self, webhook: &Webhook) -> Result<()>;

    async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>>;

    async fn list_webhooks(&self) -> Result<Vec<Webhook>>;

    /// Removes the webhook together with all of its deliveries.
    async fn delete_webhook(&self, id: Uuid) -> Result<bool>;

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<()>;

    async fn get_delivery(&self, id: Uuid) -> Result<Option<Delivery>>;

    /// Writes the outcome of an attempt made under a claim.
    async fn save_delivery(&self, delivery: &Delivery) -> Result<()>;

    /// Atomically moves a delivery to `in_progress` when it is pending and
    /// due at `now`, or when its previous claim is older than `stale_before`.
    /// Returns the claimed record, or `None` when someone else holds it or
    /// nothing is due.
    async fn claim_delivery(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Delivery>>;

    /// Ids of up to `limit` deliveries a sweep may claim, oldest schedule first.
    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>>;

    /// Most recent deliveries of one webhook, newest first.
    async fn deliveries_for_webhook(&self, webhook_id: Uuid, limit: usize) -> Result<Vec<Delivery>>;
}

#[derive(Debug, Default)]
struct Records {
    webhooks: HashMap<Uuid, Webhook>,
    deliveries: HashMap<Uuid, Delivery>,
}

/// Single-process repository; one mutex makes claims atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryWebhookRepository {
    records: Arc<Mutex<Records>>,
}

impl MemoryWebhookRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, Records>> {
        self.records.lock().map_err(|_| {
            GatekeeperError::Internal("Failed to acquire webhook repository lock".to_string())
        })
    }
}

#[async_trait]
impl WebhookRepository for MemoryWebhookRepository {
    async fn save_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.records()?.webhooks.insert(webhook.id, webhook.clone());
        Ok(())
    }

    async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>> {
        Ok(self.records()?.webhooks.get(&id).cloned())
    }

    async fn list_webhooks(&self) -> Result<Vec<Webhook>> {
        let mut webhooks: Vec<Webhook> = self.records()?.webhooks.values().cloned().collect();
        webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(webhooks)
    }

    async fn delete_webhook(&self, id: Uuid) -> Result<bool> {
        let mut records = self.records()?;
        let removed = records.webhooks.remove(&id).is_some();
        records.deliveries.retain(|_, delivery| delivery.webhook_id != id);
        Ok(removed)
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<()> {
        self.records()?
            .deliveries
            .insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<Delivery>> {
        Ok(self.records()?.deliveries.get(&id).cloned())
    }

    async fn save_delivery(&self, delivery: &Delivery) -> Result<()> {
        let mut records = self.records()?;
        // Deleted together with its webhook while the attempt was in flight.
        if !records.deliveries.contains_key(&delivery.id) {
            return Ok(());
        }
        records.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn claim_delivery(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Delivery>> {
        let mut records = self.records()?;
        let Some(delivery) = records.deliveries.get_mut(&id) else {
            return Ok(None);
        };
        if !delivery.is_due(now) && !delivery.is_stale_claim(stale_before) {
            return Ok(None);
        }
        delivery.status = DeliveryStatus::InProgress;
        delivery.claimed_at = Some(now);
        Ok(Some(delivery.clone()))
    }

    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        let records = self.records()?;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = records
            .deliveries
            .values()
            .filter(|d| d.is_due(now) || d.is_stale_claim(stale_before))
            .map(|d| (d.next_retry_at.or(d.claimed_at).unwrap_or(d.created_at), d.id))
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn deliveries_for_webhook(&self, webhook_id: Uuid, limit: usize) -> Result<Vec<Delivery>> {
        let records = self.records()?;
        let mut deliveries: Vec<Delivery> = records
            .deliveries
            .values()
            .filter(|d| d.webhook_id == webhook_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        deliveries.truncate(limit);
        Ok(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn webhook(now: DateTime<Utc>) -> Webhook {
        Webhook {
            id: Uuid::new_v4(),
            url: "https://example.com/hook".into(),
            events: ["settings.updated".to_string()].into_iter().collect(),
            secret: "secret".into(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let repo = MemoryWebhookRepository::new();
        let now = Utc::now();
        let hook = webhook(now);
        repo.save_webhook(&hook).await.unwrap();
        let delivery = Delivery::new(hook.id, "settings.updated", "{}".into(), now);
        repo.insert_delivery(&delivery).await.unwrap();

        let stale_before = now - Duration::seconds(120);
        let first = repo.claim_delivery(delivery.id, now, stale_before).await.unwrap();
        assert_eq!(first.unwrap().status, DeliveryStatus::InProgress);
        assert!(repo
            .claim_delivery(delivery.id, now, stale_before)
            .await
            .unwrap()
            .is_none());

        // A claim older than the lease can be taken over.
        let later = now + Duration::seconds(121);
        let reclaimed = repo
            .claim_delivery(delivery.id, later, later - Duration::seconds(120))
            .await
            .unwrap();
        assert_eq!(reclaimed.unwrap().claimed_at, Some(later));
    }

    #[tokio::test]
    async fn test_due_deliveries_respect_schedule() {
        let repo = MemoryWebhookRepository::new();
        let now = Utc::now();
        let hook = webhook(now);
        repo.save_webhook(&hook).await.unwrap();

        let ready = Delivery::new(hook.id, "settings.updated", "{}".into(), now);
        let mut later = Delivery::new(hook.id, "settings.updated", "{}".into(), now);
        later.next_retry_at = Some(now + Duration::seconds(60));
        let mut done = Delivery::new(hook.id, "settings.updated", "{}".into(), now);
        done.status = DeliveryStatus::Success;
        for d in [&ready, &later, &done] {
            repo.insert_delivery(d).await.unwrap();
        }

        let stale_before = now - Duration::seconds(120);
        assert_eq!(
            repo.due_deliveries(now, stale_before, 10).await.unwrap(),
            vec![ready.id]
        );
        assert_eq!(repo.due_deliveries(now, stale_before, 0).await.unwrap().len(), 0);
        let in_a_minute = now + Duration::seconds(60);
        assert_eq!(
            repo.due_deliveries(in_a_minute, stale_before, 10)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_delete_webhook_removes_deliveries() {
        let repo = MemoryWebhookRepository::new();
        let now = Utc::now();
        let hook = webhook(now);
        repo.save_webhook(&hook).await.unwrap();
        let delivery = Delivery::new(hook.id, "settings.updated", "{}".into(), now);
        repo.insert_delivery(&delivery).await.unwrap();

        assert!(repo.delete_webhook(hook.id).await.unwrap());
        assert!(repo.get_delivery(delivery.id).await.unwrap().is_none());
        assert!(repo.deliveries_for_webhook(hook.id, 10).await.unwrap().is_empty());
        assert!(!repo.delete_webhook(hook.id).await.unwrap());
    }
}
