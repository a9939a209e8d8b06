use crate::error::{GatekeeperError, Result};
use crate::webhook::types::is_supported_event;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Body of a webhook registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct RegisterWebhook {
    #[validate(url(message = "must be a well-formed URL"))]
    pub url: String,

    #[validate(length(min = 1, message = "at least one event is required"))]
    pub events: Vec<String>,

    /// Generated when absent.
    #[validate(length(min = 16, max = 256, message = "secret must be 16 to 256 characters"))]
    pub secret: Option<String>,
}

impl RegisterWebhook {
    pub fn new(url: impl Into<String>, events: &[&str]) -> Self {
        Self {
            url: url.into(),
            events: events.iter().map(|e| e.to_string()).collect(),
            secret: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn check(&self) -> Result<()> {
        self.validate()?;
        check_scheme(&self.url)?;
        check_events(&self.events)
    }
}

/// Partial update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateWebhook {
    #[validate(url(message = "must be a well-formed URL"))]
    pub url: Option<String>,

    #[validate(length(min = 1, message = "at least one event is required"))]
    pub events: Option<Vec<String>>,
}

impl UpdateWebhook {
    pub fn check(&self) -> Result<()> {
        self.validate()?;
        if let Some(url) = &self.url {
            check_scheme(url)?;
        }
        if let Some(events) = &self.events {
            check_events(events)?;
        }
        Ok(())
    }
}

fn check_scheme(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(GatekeeperError::Validation(format!(
            "Webhook URL must use http or https: {}",
            url
        )))
    }
}

fn check_events(events: &[String]) -> Result<()> {
    match events.iter().find(|event| !is_supported_event(event)) {
        Some(unknown) => Err(GatekeeperError::Validation(format!(
            "Unsupported event: {}",
            unknown
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_registration() {
        let request = RegisterWebhook::new("https://example.com/hook", &["settings.updated"]);
        assert!(request.check().is_ok());
    }

    #[test]
    fn test_malformed_url_rejected() {
        let request = RegisterWebhook::new("not a url", &["settings.updated"]);
        assert!(matches!(request.check(), Err(GatekeeperError::Validation(_))));

        let ftp = RegisterWebhook::new("ftp://example.com/hook", &["settings.updated"]);
        assert!(matches!(ftp.check(), Err(GatekeeperError::Validation(_))));
    }

    #[test]
    fn test_events_must_be_known_and_present() {
        let unknown = RegisterWebhook::new("https://example.com/hook", &["user.deleted"]);
        let err = unknown.check().unwrap_err();
        assert!(err.to_string().contains("user.deleted"));

        let empty = RegisterWebhook::new("https://example.com/hook", &[]);
        assert!(empty.check().is_err());
    }

    #[test]
    fn test_short_secret_rejected() {
        let request =
            RegisterWebhook::new("https://example.com/hook", &["theme.changed"]).with_secret("short");
        assert!(request.check().is_err());
    }

    #[test]
    fn test_empty_update_is_valid() {
        assert!(UpdateWebhook::default().check().is_ok());
        let bad = UpdateWebhook {
            events: Some(vec!["nope".into()]),
            ..Default::default()
        };
        assert!(bad.check().is_err());
    }
}
