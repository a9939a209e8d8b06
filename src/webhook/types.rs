use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Events a webhook may subscribe to.
pub const SUPPORTED_EVENTS: &[&str] = &[
    "settings.updated",
    "settings.reset",
    "settings.imported",
    "theme.changed",
    "backup.created",
    "backup.restored",
    "webhook.test",
];

pub const TEST_EVENT: &str = "webhook.test";

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const EVENT_HEADER: &str = "X-Event";
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-Id";

pub fn is_supported_event(event: &str) -> bool {
    SUPPORTED_EVENTS.contains(&event)
}

/// An outbound subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub url: String,
    pub events: BTreeSet<String>,
    /// Shared HMAC key. Never logged.
    pub secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.active && self.events.contains(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    /// Claimed by one worker; nobody else may attempt it until the claim goes stale.
    InProgress,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InProgress => "in_progress",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One event sent to one webhook, across all of its attempts.
///
/// Timestamps are stored as epoch milliseconds so store-side scripts can
/// compare them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event: String,
    /// Request body, sent byte-for-byte on every attempt.
    pub payload: String,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub response_code: Option<u16>,
    pub last_error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(webhook_id: Uuid, event: &str, payload: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_id,
            event: event.to_string(),
            payload,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            response_code: None,
            last_error: None,
            next_retry_at: None,
            claimed_at: None,
            delivered_at: None,
            created_at: now,
        }
    }

    /// Whether a pending delivery may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Whether an in-progress claim was abandoned before `stale_before`.
    pub fn is_stale_claim(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::InProgress
            && self.claimed_at.map_or(true, |at| at <= stale_before)
    }
}

/// Wire body: `{"event": .., "payload": .., "timestamp": ..}`.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub event: &'a str,
    pub payload: &'a Value,
    pub timestamp: i64,
}

/// Outcome counts of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_delivery_timestamps_serialize_as_millis() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let mut delivery = Delivery::new(Uuid::new_v4(), "settings.updated", "{}".into(), now);
        delivery.next_retry_at = Some(now);

        let json: Value = serde_json::to_value(&delivery).unwrap();
        assert_eq!(json["created_at"], 1_700_000_000_123i64);
        assert_eq!(json["next_retry_at"], 1_700_000_000_123i64);
        assert_eq!(json["delivered_at"], Value::Null);
        assert_eq!(json["status"], "pending");

        let back: Delivery = serde_json::from_value(json).unwrap();
        assert_eq!(back, delivery);
    }

    #[test]
    fn test_due_and_stale_checks() {
        let now = Utc::now();
        let mut delivery = Delivery::new(Uuid::new_v4(), "theme.changed", "{}".into(), now);
        assert!(delivery.is_due(now));

        delivery.next_retry_at = Some(now + chrono::Duration::seconds(60));
        assert!(!delivery.is_due(now));

        delivery.status = DeliveryStatus::InProgress;
        delivery.claimed_at = Some(now);
        assert!(!delivery.is_stale_claim(now - chrono::Duration::seconds(1)));
        assert!(delivery.is_stale_claim(now));
    }

    #[test]
    fn test_inactive_webhook_subscribes_to_nothing() {
        let now = Utc::now();
        let mut webhook = Webhook {
            id: Uuid::new_v4(),
            url: "https://example.com/hook".into(),
            events: ["settings.updated".to_string()].into_iter().collect(),
            secret: "s".repeat(64),
            active: true,
            created_at: now,
            updated_at: now,
        };
        assert!(webhook.subscribes_to("settings.updated"));
        assert!(!webhook.subscribes_to("theme.changed"));
        webhook.active = false;
        assert!(!webhook.subscribes_to("settings.updated"));
    }
}
