use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Which fixed-window counter rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    User,
    Origin,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::User => "user",
            Dimension::Origin => "origin",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum GatekeeperError {
    #[error("Lock is held by another operation, retry after {retry_after:?}")]
    LockHeld { retry_after: Duration },

    #[error("Rate limit exceeded on {dimension} counter, retry after {retry_after:?}")]
    RateLimitExceeded {
        retry_after: Duration,
        dimension: Dimension,
    },

    #[error("Timed out after {0:?} waiting for a concurrent duplicate to finish")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatekeeperError {
    /// Retry hint for the two retryable rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatekeeperError::LockHeld { retry_after }
            | GatekeeperError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_after().is_some()
    }
}

impl From<redis::RedisError> for GatekeeperError {
    fn from(err: redis::RedisError) -> Self {
        GatekeeperError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for GatekeeperError {
    fn from(err: reqwest::Error) -> Self {
        GatekeeperError::Http(err.to_string())
    }
}

impl From<validator::ValidationErrors> for GatekeeperError {
    fn from(err: validator::ValidationErrors) -> Self {
        GatekeeperError::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatekeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_only_for_retryable_variants() {
        let held = GatekeeperError::LockHeld {
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(held.retry_after(), Some(Duration::from_secs(3)));

        let limited = GatekeeperError::RateLimitExceeded {
            retry_after: Duration::from_secs(42),
            dimension: Dimension::Origin,
        };
        assert!(limited.is_retryable());
        assert!(limited.to_string().contains("origin"));

        assert_eq!(GatekeeperError::Timeout(Duration::from_secs(30)).retry_after(), None);
        assert!(!GatekeeperError::Store("down".into()).is_retryable());
    }
}
