use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::time::Duration;

use super::snapshot::{parse_status_document, HealthSnapshot};
use super::{FetchError, HealthSource};

/// Polls the upstream status endpoint over HTTP
#[derive(Debug)]
pub struct HttpHealthSource {
    http_client: reqwest::Client,
    endpoint: String,
    /// Body of the last document that parsed
    last_body: Mutex<Option<String>>,
}

impl HttpHealthSource {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, FetchError> {
        Self::with_timeout(endpoint, Duration::from_secs(30))
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
            last_body: Mutex::new(None),
        })
    }

    async fn fetch_body(&self) -> Result<String, FetchError> {
        let response = self
            .http_client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))
    }
}

#[async_trait]
impl HealthSource for HttpHealthSource {
    async fn fetch_if_changed(&self) -> Result<Option<HealthSnapshot>, FetchError> {
        let body = self.fetch_body().await?;

        if self.last_body.lock().as_deref() == Some(body.as_str()) {
            tracing::debug!(endpoint = %self.endpoint, "Status document unchanged");
            return Ok(None);
        }

        let snapshot = parse_status_document(&body, Utc::now())?;
        *self.last_body.lock() = Some(body);
        Ok(Some(snapshot))
    }

    fn forget_last(&self) {
        *self.last_body.lock() = None;
    }
}
