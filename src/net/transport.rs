//! HTTP push transport.

use crate::config::PushConfig;
use crate::error::{AgentError, DeliveryFailure, Result};
use crate::net::exposition::CONTENT_TYPE;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Performs one PUT of an exposition body.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Send `body` to `url` and return the HTTP status code.
    async fn put(&self, url: &str, body: String) -> std::result::Result<u16, DeliveryFailure>;
}

/// Plain-HTTP transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("powermeter/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AgentError::config_error(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl PushTransport for HttpTransport {
    async fn put(&self, url: &str, body: String) -> std::result::Result<u16, DeliveryFailure> {
        let response = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryFailure::Timeout(self.timeout.as_millis() as u64)
                } else {
                    DeliveryFailure::NetworkUnreachable(e.to_string())
                }
            })?;

        Ok(response.status().as_u16())
    }
}

/// Accepts every push and logs the body instead of sending it.
#[derive(Debug, Clone, Default)]
pub struct LoggingTransport;

#[async_trait]
impl PushTransport for LoggingTransport {
    async fn put(&self, url: &str, body: String) -> std::result::Result<u16, DeliveryFailure> {
        info!("Dry run PUT {}\n{}", url, body);
        Ok(200)
    }
}
