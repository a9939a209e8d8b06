use crate::config_validator::ConfigValidator;
use crate::error::{GatekeeperError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Rate limiting rules keyed by action name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub rules: HashMap<String, RateLimitRule>,
    #[serde(default)]
    pub default_rule: RateLimitRule,
}

/// Fixed-window quota for one action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max_requests: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
        }
    }
}

impl Default for RateLimitConfig {
    /// Built-in quotas; expensive operations get tighter limits.
    fn default() -> Self {
        let mut config = Self {
            rules: HashMap::new(),
            default_rule: RateLimitRule::default(),
        };
        config.set_rule("settings_save", RateLimitRule::new(30, Duration::from_secs(60)));
        config.set_rule("settings_import", RateLimitRule::new(5, Duration::from_secs(300)));
        config.set_rule("backup_create", RateLimitRule::new(5, Duration::from_secs(3600)));
        config.set_rule("backup_restore", RateLimitRule::new(3, Duration::from_secs(3600)));
        config.set_rule("webhook_test", RateLimitRule::new(10, Duration::from_secs(60)));
        config
    }
}

impl RateLimitConfig {
    /// Loads overrides from a JSON file on top of the built-in rules.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatekeeperError::Configuration(format!(
                "Failed to read rate limit file {}: {}",
                path.display(),
                e
            ))
        })?;
        let overrides: RateLimitConfig = serde_json::from_str(&raw)?;

        let mut config = Self::default();
        config.default_rule = overrides.default_rule;
        for (action, rule) in overrides.rules {
            config.set_rule(action, rule);
        }
        config.validate()?;
        Ok(config)
    }

    /// Get rate limit rule for an action, falling back to default
    pub fn get_rule(&self, action: &str) -> &RateLimitRule {
        self.rules.get(action).unwrap_or(&self.default_rule)
    }

    /// Add or update a rate limit rule
    pub fn set_rule(&mut self, action: impl Into<String>, rule: RateLimitRule) {
        self.rules.insert(action.into(), rule);
    }

    pub fn remove_rule(&mut self, action: &str) -> Option<RateLimitRule> {
        self.rules.remove(action)
    }

    pub fn validate(&self) -> Result<()> {
        self.default_rule.validate()?;
        for (action, rule) in &self.rules {
            ConfigValidator::validate_action_name(action)?;
            rule.validate()?;
        }
        Ok(())
    }
}

impl RateLimitRule {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_rate_limit(self.max_requests, self.window)
    }
}
