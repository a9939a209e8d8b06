//! Fixed-window admission control per user and per origin.
//!
//! Every action has two independent counters: one for the acting user and one
//! for the origin address. A window opens with the first request and lasts
//! the rule's full window regardless of later traffic, so up to twice the
//! configured rate can pass around a window boundary.

use crate::error::{Dimension, GatekeeperError, Result};
use crate::rate_limit_config::{RateLimitConfig, RateLimitRule};
use crate::store::{TtlStore, WindowIncrement};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const RATE_LIMIT_KEY_PREFIX: &str = "gatekeeper:ratelimit:";

/// Usage of one counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterStatus {
    pub dimension: Dimension,
    pub limit: u32,
    pub used: u64,
    pub remaining: u64,
    #[serde(with = "humantime_serde")]
    pub reset_in: Duration,
}

/// Usage of both counters for one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub action: String,
    pub user: CounterStatus,
    pub origin: CounterStatus,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn TtlStore>,
    config: Arc<RwLock<RateLimitConfig>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn TtlStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub async fn rule(&self, action: &str) -> RateLimitRule {
        *self.config.read().await.get_rule(action)
    }

    /// Add or update the rule for one action
    pub async fn set_rule(&self, action: &str, rule: RateLimitRule) -> Result<()> {
        crate::config_validator::ConfigValidator::validate_action_name(action)?;
        rule.validate()?;
        self.config.write().await.set_rule(action, rule);
        Ok(())
    }

    pub async fn update_config(&self, config: RateLimitConfig) -> Result<()> {
        config.validate()?;
        *self.config.write().await = config;
        Ok(())
    }

    fn counter_key(dimension: Dimension, action: &str, identifier: &str) -> String {
        format!(
            "{}{}:{}:{}",
            RATE_LIMIT_KEY_PREFIX,
            dimension,
            sanitize(action),
            sanitize(identifier)
        )
    }

    async fn used(&self, key: &str) -> Result<u64> {
        match self.store.get(key).await? {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                GatekeeperError::Store(format!("Counter '{}' holds a non-numeric value", key))
            }),
            None => Ok(0),
        }
    }

    async fn reset_in(&self, key: &str, rule: &RateLimitRule) -> Result<Duration> {
        Ok(self.store.ttl(key).await?.unwrap_or(rule.window))
    }

    async fn reject(
        &self,
        dimension: Dimension,
        key: &str,
        action: &str,
        identifier: &str,
        rule: &RateLimitRule,
    ) -> Result<GatekeeperError> {
        let retry_after = self.reset_in(key, rule).await?;
        warn!(
            action = action,
            dimension = %dimension,
            identifier = identifier,
            limit = rule.max_requests,
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate limit exceeded"
        );
        Ok(GatekeeperError::RateLimitExceeded {
            retry_after,
            dimension,
        })
    }

    /// Admits one request for `action` or rejects it with the remaining
    /// window of the first exhausted counter (user before origin).
    pub async fn check_and_consume(
        &self,
        action: &str,
        user_id: &str,
        origin_ip: &str,
    ) -> Result<RateLimitStatus> {
        let rule = self.rule(action).await;
        let counters = [
            (Dimension::User, user_id, Self::counter_key(Dimension::User, action, user_id)),
            (Dimension::Origin, origin_ip, Self::counter_key(Dimension::Origin, action, origin_ip)),
        ];
        let keys = [counters[0].2.clone(), counters[1].2.clone()];

        // One atomic step: a rejected request consumes neither counter.
        let used = match self
            .store
            .increment_within(&keys, rule.window, u64::from(rule.max_requests))
            .await?
        {
            WindowIncrement::Admitted(used) => used,
            WindowIncrement::Rejected { index } => {
                let (dimension, identifier, key) = counters.get(index).ok_or_else(|| {
                    GatekeeperError::Store(format!("Counter index {} out of range", index))
                })?;
                return Err(self.reject(*dimension, key, action, identifier, &rule).await?);
            }
        };
        let user_used = used.first().copied().unwrap_or_default();
        let origin_used = used.get(1).copied().unwrap_or_default();

        debug!(action = action, user = user_id, origin = origin_ip, "Request admitted");

        Ok(RateLimitStatus {
            action: action.to_string(),
            user: self.counter_status(Dimension::User, &counters[0].2, &rule, user_used).await?,
            origin: self.counter_status(Dimension::Origin, &counters[1].2, &rule, origin_used).await?,
        })
    }

    async fn counter_status(
        &self,
        dimension: Dimension,
        key: &str,
        rule: &RateLimitRule,
        used: u64,
    ) -> Result<CounterStatus> {
        let limit = u64::from(rule.max_requests);
        let reset_in = if used == 0 {
            rule.window
        } else {
            self.reset_in(key, rule).await?
        };
        Ok(CounterStatus {
            dimension,
            limit: rule.max_requests,
            used,
            remaining: limit.saturating_sub(used),
            reset_in,
        })
    }

    /// Read-only view of both counters.
    pub async fn status(
        &self,
        action: &str,
        user_id: &str,
        origin_ip: &str,
    ) -> Result<RateLimitStatus> {
        let rule = self.rule(action).await;
        let user_key = Self::counter_key(Dimension::User, action, user_id);
        let origin_key = Self::counter_key(Dimension::Origin, action, origin_ip);

        let user_used = self.used(&user_key).await?;
        let origin_used = self.used(&origin_key).await?;

        Ok(RateLimitStatus {
            action: action.to_string(),
            user: self.counter_status(Dimension::User, &user_key, &rule, user_used).await?,
            origin: self.counter_status(Dimension::Origin, &origin_key, &rule, origin_used).await?,
        })
    }

    /// Clears both counters for `action`.
    pub async fn reset(&self, action: &str, user_id: &str, origin_ip: &str) -> Result<()> {
        self.store
            .delete(&Self::counter_key(Dimension::User, action, user_id))
            .await?;
        self.store
            .delete(&Self::counter_key(Dimension::Origin, action, origin_ip))
            .await?;
        Ok(())
    }
}

/// Keeps identifiers from injecting key separators.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
