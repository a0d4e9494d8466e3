use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid target URL: {0}")]
    InvalidTarget(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Outbound leg of the load generator. Response bodies are never inspected.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `body` to the target and return the HTTP status code.
    async fn send(&self, body: &[u8]) -> Result<u16, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    target: Url,
    http: Client,
}

impl HttpTransport {
    pub fn new(target: &str, workers: usize) -> Result<Self, TransportError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(workers.max(32))
            .build()?;
        Self::with_http_client(target, http)
    }

    pub fn with_http_client(target: &str, http: Client) -> Result<Self, TransportError> {
        let target =
            Url::parse(target).map_err(|_| TransportError::InvalidTarget(target.to_string()))?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(TransportError::InvalidTarget(target.to_string()));
        }
        Ok(Self { target, http })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, body: &[u8]) -> Result<u16, TransportError> {
        let response = self
            .http
            .post(self.target.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}
