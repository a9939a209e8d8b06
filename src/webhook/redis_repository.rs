//! Redis-backed [`WebhookRepository`] shared by every process that triggers
//! or sweeps deliveries.
//!
//! Layout:
//! - `gatekeeper:webhook:{id}` webhook JSON, ids in the set `gatekeeper:webhooks`
//! - `gatekeeper:delivery:{id}` delivery JSON
//! - `gatekeeper:webhook:{id}:deliveries` history, scored by creation time
//! - `gatekeeper:deliveries:pending` pending ids, scored by next attempt time
//! - `gatekeeper:deliveries:claimed` in-progress ids, scored by claim time

use super::repository::WebhookRepository;
use super::types::{Delivery, DeliveryStatus, Webhook};
use crate::error::{GatekeeperError, Result};
use crate::store::RedisClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use uuid::Uuid;

const WEBHOOK_SET: &str = "gatekeeper:webhooks";
const PENDING_INDEX: &str = "gatekeeper:deliveries:pending";
const CLAIMED_INDEX: &str = "gatekeeper:deliveries:claimed";

const CLAIM_DELIVERY: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return false
end
local delivery = cjson.decode(raw)
local now = tonumber(ARGV[1])
local stale_before = tonumber(ARGV[2])
local claimable = false
if delivery.status == 'pending' then
    local at = delivery.next_retry_at
    claimable = (at == nil) or (at == cjson.null) or (at <= now)
elseif delivery.status == 'in_progress' then
    local at = delivery.claimed_at
    claimable = (at == nil) or (at == cjson.null) or (at <= stale_before)
end
if not claimable then
    return false
end
delivery.status = 'in_progress'
delivery.claimed_at = now
local encoded = cjson.encode(delivery)
redis.call('SET', KEYS[1], encoded)
redis.call('ZREM', KEYS[2], ARGV[3])
redis.call('ZADD', KEYS[3], now, ARGV[3])
return encoded
"#;

const SAVE_DELIVERY: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1])
if ARGV[2] == 'pending' then
    redis.call('ZREM', KEYS[3], ARGV[4])
    redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
elseif ARGV[2] == 'in_progress' then
    redis.call('ZREM', KEYS[2], ARGV[4])
    redis.call('ZADD', KEYS[3], ARGV[3], ARGV[4])
else
    redis.call('ZREM', KEYS[2], ARGV[4])
    redis.call('ZREM', KEYS[3], ARGV[4])
end
return 1
"#;

fn webhook_key(id: Uuid) -> String {
    format!("gatekeeper:webhook:{}", id)
}

fn history_key(webhook_id: Uuid) -> String {
    format!("gatekeeper:webhook:{}:deliveries", webhook_id)
}

fn delivery_key(id: Uuid) -> String {
    format!("gatekeeper:delivery:{}", id)
}

/// Index score: when a pending delivery becomes due, or when an in-progress
/// claim was taken.
fn index_score(delivery: &Delivery) -> i64 {
    match delivery.status {
        DeliveryStatus::Pending => delivery.next_retry_at.unwrap_or(delivery.created_at),
        DeliveryStatus::InProgress => delivery.claimed_at.unwrap_or(delivery.created_at),
        DeliveryStatus::Success | DeliveryStatus::Failed => delivery.created_at,
    }
    .timestamp_millis()
}

#[derive(Clone)]
pub struct RedisWebhookRepository {
    client: RedisClient,
    claim: Script,
    save: Script,
}

impl RedisWebhookRepository {
    pub fn new(client: RedisClient) -> Self {
        Self {
            client,
            claim: Script::new(CLAIM_DELIVERY),
            save: Script::new(SAVE_DELIVERY),
        }
    }

    async fn load_many<T: serde::de::DeserializeOwned>(&self, keys: Vec<String>) -> Result<Vec<T>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.client.connection();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("MGET failed: {}", e)))?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(GatekeeperError::from))
            .collect()
    }

    async fn range_ids(&self, index: &str, max_score: i64, limit: usize) -> Result<Vec<Uuid>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.client.connection();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(index)
            .arg("-inf")
            .arg(max_score)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("ZRANGEBYSCORE failed: {}", e)))?;
        Ok(ids.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect())
    }
}

#[async_trait]
impl WebhookRepository for RedisWebhookRepository {
    async fn save_webhook(&self, webhook: &Webhook) -> Result<()> {
        let json = serde_json::to_string(webhook)?;
        let mut conn = self.client.connection();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(webhook_key(webhook.id))
            .arg(json)
            .ignore()
            .cmd("SADD")
            .arg(WEBHOOK_SET)
            .arg(webhook.id.to_string())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("Failed to save webhook: {}", e)))
    }

    async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>> {
        let mut conn = self.client.connection();
        let raw: Option<String> = redis::cmd("GET")
            .arg(webhook_key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("GET failed: {}", e)))?;
        raw.map(|json| serde_json::from_str(&json).map_err(GatekeeperError::from))
            .transpose()
    }

    async fn list_webhooks(&self) -> Result<Vec<Webhook>> {
        let mut conn = self.client.connection();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(WEBHOOK_SET)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("SMEMBERS failed: {}", e)))?;
        let keys = ids
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(webhook_key)
            .collect();

        let mut webhooks: Vec<Webhook> = self.load_many(keys).await?;
        webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(webhooks)
    }

    async fn delete_webhook(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.client.connection();
        let existed: bool = redis::cmd("EXISTS")
            .arg(webhook_key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("EXISTS failed: {}", e)))?;
        let delivery_ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(history_key(id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("ZRANGE failed: {}", e)))?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(webhook_key(id))
            .arg(history_key(id))
            .ignore()
            .cmd("SREM")
            .arg(WEBHOOK_SET)
            .arg(id.to_string())
            .ignore();
        for delivery_id in &delivery_ids {
            pipe.cmd("DEL")
                .arg(format!("gatekeeper:delivery:{}", delivery_id))
                .ignore()
                .cmd("ZREM")
                .arg(PENDING_INDEX)
                .arg(delivery_id)
                .ignore()
                .cmd("ZREM")
                .arg(CLAIMED_INDEX)
                .arg(delivery_id)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("Failed to delete webhook: {}", e)))?;
        Ok(existed)
    }

    async fn insert_delivery(&self, delivery: &Delivery) -> Result<()> {
        let json = serde_json::to_string(delivery)?;
        let id = delivery.id.to_string();
        let mut conn = self.client.connection();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(delivery_key(delivery.id))
            .arg(json)
            .ignore()
            .cmd("ZADD")
            .arg(history_key(delivery.webhook_id))
            .arg(delivery.created_at.timestamp_millis())
            .arg(&id)
            .ignore()
            .cmd("ZADD")
            .arg(PENDING_INDEX)
            .arg(index_score(delivery))
            .arg(&id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("Failed to insert delivery: {}", e)))
    }

    async fn get_delivery(&self, id: Uuid) -> Result<Option<Delivery>> {
        let mut conn = self.client.connection();
        let raw: Option<String> = redis::cmd("GET")
            .arg(delivery_key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("GET failed: {}", e)))?;
        raw.map(|json| serde_json::from_str(&json).map_err(GatekeeperError::from))
            .transpose()
    }

    async fn save_delivery(&self, delivery: &Delivery) -> Result<()> {
        let json = serde_json::to_string(delivery)?;
        let mut conn = self.client.connection();
        self.save
            .key(delivery_key(delivery.id))
            .key(PENDING_INDEX)
            .key(CLAIMED_INDEX)
            .arg(json)
            .arg(delivery.status.to_string())
            .arg(index_score(delivery))
            .arg(delivery.id.to_string())
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("Failed to save delivery: {}", e)))?;
        Ok(())
    }

    async fn claim_delivery(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Delivery>> {
        let mut conn = self.client.connection();
        let claimed: Option<String> = self
            .claim
            .key(delivery_key(id))
            .key(PENDING_INDEX)
            .key(CLAIMED_INDEX)
            .arg(now.timestamp_millis())
            .arg(stale_before.timestamp_millis())
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("Failed to claim delivery: {}", e)))?;
        claimed
            .map(|json| serde_json::from_str(&json).map_err(GatekeeperError::from))
            .transpose()
    }

    async fn due_deliveries(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        let mut due = self
            .range_ids(PENDING_INDEX, now.timestamp_millis(), limit)
            .await?;
        let stale = self
            .range_ids(
                CLAIMED_INDEX,
                stale_before.timestamp_millis(),
                limit.saturating_sub(due.len()),
            )
            .await?;
        due.extend(stale);
        Ok(due)
    }

    async fn deliveries_for_webhook(&self, webhook_id: Uuid, limit: usize) -> Result<Vec<Delivery>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.client.connection();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(history_key(webhook_id))
            .arg(0)
            .arg(limit - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatekeeperError::Store(format!("ZREVRANGE failed: {}", e)))?;
        let keys = ids
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(delivery_key)
            .collect();
        self.load_many(keys).await
    }
}
