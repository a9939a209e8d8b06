use crate::error::{GatekeeperError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Wait for the response and judge the attempt by its status code.
    #[default]
    Blocking,
    /// Send without waiting; the attempt counts as delivered once dispatched.
    FireAndForget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound HTTP used for webhook delivery.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POSTs `body` to `url`. `Ok(None)` means the request was dispatched in
    /// fire-and-forget mode and no response will be observed; `Err` is a
    /// network-level failure.
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &str,
        timeout: Duration,
        mode: DeliveryMode,
    ) -> Result<Option<HttpResponse>>;
}

#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn request(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &str,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        headers
            .iter()
            .fold(self.client.post(url), |request, (name, value)| {
                request.header(name.as_str(), value.as_str())
            })
            .timeout(timeout)
            .body(body.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &str,
        timeout: Duration,
        mode: DeliveryMode,
    ) -> Result<Option<HttpResponse>> {
        let request = self.request(url, headers, body, timeout);

        if mode == DeliveryMode::FireAndForget {
            let target = url.to_string();
            tokio::spawn(async move {
                if let Err(err) = request.send().await {
                    debug!(url = %target, error = %err, "Fire-and-forget webhook request failed");
                }
            });
            return Ok(None);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatekeeperError::Http(format!("Request to {} failed: {}", url, e)))?;
        let status = response.status().as_u16();
        // Receivers' bodies are informational only.
        let body = response.text().await.unwrap_or_default();

        Ok(Some(HttpResponse { status, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_range() {
        let ok = HttpResponse { status: 204, body: String::new() };
        let redirect = HttpResponse { status: 301, body: String::new() };
        let error = HttpResponse { status: 500, body: String::new() };
        assert!(ok.is_success());
        assert!(!redirect.is_success());
        assert!(!error.is_success());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let transport = ReqwestTransport::default();
        let result = transport
            .post(
                "http://127.0.0.1:9/hook",
                &[],
                "{}",
                Duration::from_millis(500),
                DeliveryMode::Blocking,
            )
            .await;
        assert!(matches!(result, Err(GatekeeperError::Http(_))));
    }
}
