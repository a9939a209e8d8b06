use crate::config_validator::ConfigValidator;
use crate::dedup::DedupConfig;
use crate::error::{GatekeeperError, Result};
use crate::rate_limit_config::RateLimitConfig;
use crate::webhook::{RetryPolicy, WebhookConfig};
use envconfig::Envconfig;
use std::time::Duration;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Redis connection URL; unset or empty runs on the in-process store
    #[envconfig(from = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    #[envconfig(from = "LOCK_TTL_SECS", default = "30")]
    pub lock_ttl_secs: u64,

    #[envconfig(from = "DEDUP_CACHE_TTL_SECS", default = "60")]
    pub dedup_cache_ttl_secs: u64,

    #[envconfig(from = "DEDUP_POLL_INTERVAL_MS", default = "500")]
    pub dedup_poll_interval_ms: u64,

    #[envconfig(from = "DEDUP_WAIT_TIMEOUT_SECS", default = "30")]
    pub dedup_wait_timeout_secs: u64,

    /// JSON file of per-action overrides merged over the built-in rules
    #[envconfig(from = "RATE_LIMITS_FILE")]
    pub rate_limits_file: Option<String>,

    #[envconfig(from = "WEBHOOK_TIMEOUT_SECS", default = "10")]
    pub webhook_timeout_secs: u64,

    #[envconfig(from = "WEBHOOK_MAX_RETRIES", default = "5")]
    pub webhook_max_retries: u32,

    #[envconfig(from = "WEBHOOK_BASE_DELAY_SECS", default = "60")]
    pub webhook_base_delay_secs: u64,

    #[envconfig(from = "WEBHOOK_BATCH_SIZE", default = "50")]
    pub webhook_batch_size: usize,

    #[envconfig(from = "WEBHOOK_CLAIM_LEASE_SECS", default = "120")]
    pub webhook_claim_lease_secs: u64,

    #[envconfig(from = "SWEEP_INTERVAL_SECS", default = "60")]
    pub sweep_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> std::result::Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            cache_ttl: Duration::from_secs(self.dedup_cache_ttl_secs),
            poll_interval: Duration::from_millis(self.dedup_poll_interval_ms),
            wait_timeout: Duration::from_secs(self.dedup_wait_timeout_secs),
            lock_ttl: self.lock_ttl(),
            ..DedupConfig::default()
        }
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            retry: RetryPolicy::new(
                self.webhook_max_retries,
                Duration::from_secs(self.webhook_base_delay_secs),
            ),
            timeout: Duration::from_secs(self.webhook_timeout_secs),
            batch_size: self.webhook_batch_size,
            claim_lease: Duration::from_secs(self.webhook_claim_lease_secs),
            ..WebhookConfig::default()
        }
    }

    pub fn rate_limit_config(&self) -> Result<RateLimitConfig> {
        match &self.rate_limits_file {
            Some(path) if !path.trim().is_empty() => RateLimitConfig::from_json_file(path.trim()),
            _ => Ok(RateLimitConfig::default()),
        }
    }

    /// Rejects values that would disable a safety bound.
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = self.redis_url() {
            ConfigValidator::validate_redis_url(url)?;
        }
        ConfigValidator::validate_positive("LOCK_TTL_SECS", self.lock_ttl())?;

        let dedup = self.dedup_config();
        ConfigValidator::validate_positive("DEDUP_CACHE_TTL_SECS", dedup.cache_ttl)?;
        ConfigValidator::validate_positive("DEDUP_POLL_INTERVAL_MS", dedup.poll_interval)?;
        ConfigValidator::validate_positive("DEDUP_WAIT_TIMEOUT_SECS", dedup.wait_timeout)?;

        let webhooks = self.webhook_config();
        ConfigValidator::validate_positive("WEBHOOK_TIMEOUT_SECS", webhooks.timeout)?;
        ConfigValidator::validate_positive("WEBHOOK_BASE_DELAY_SECS", webhooks.retry.base_delay)?;
        ConfigValidator::validate_positive("WEBHOOK_CLAIM_LEASE_SECS", webhooks.claim_lease)?;
        ConfigValidator::validate_positive("SWEEP_INTERVAL_SECS", self.sweep_interval())?;

        if self.webhook_max_retries == 0 {
            return Err(GatekeeperError::Configuration(
                "WEBHOOK_MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        if self.webhook_batch_size == 0 {
            return Err(GatekeeperError::Configuration(
                "WEBHOOK_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
