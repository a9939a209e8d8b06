use crate::error::GatekeeperError;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static ACTION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]{0,63}$").expect("action name pattern is valid")
});

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), GatekeeperError> {
        if url.is_empty() {
            return Err(GatekeeperError::Validation(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(GatekeeperError::Validation(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        Ok(())
    }

    /// Validates a fixed-window quota
    pub fn validate_rate_limit(max_requests: u32, window: Duration) -> Result<(), GatekeeperError> {
        if max_requests == 0 {
            return Err(GatekeeperError::Validation(
                "Rate limit max_requests must be greater than 0".to_string(),
            ));
        }

        if window.is_zero() {
            return Err(GatekeeperError::Validation(
                "Rate limit window must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Action names become part of store keys
    pub fn validate_action_name(action: &str) -> Result<(), GatekeeperError> {
        if !ACTION_NAME.is_match(action) {
            return Err(GatekeeperError::Validation(format!(
                "Invalid action name '{}': use lowercase letters, digits and underscores",
                action
            )));
        }
        Ok(())
    }

    pub fn validate_positive(name: &str, value: Duration) -> Result<(), GatekeeperError> {
        if value.is_zero() {
            return Err(GatekeeperError::Validation(format!(
                "{} must be greater than 0",
                name
            )));
        }
        Ok(())
    }
}
