use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::model::{FeedSource, RawFeedDocument};

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Retrieves raw feed documents.
///
/// Implementations must not touch shared state; the cache decides what to do
/// with the result.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, source: &FeedSource) -> Result<RawFeedDocument, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Applies to each attempt, body included
    pub timeout: Duration,
    /// Retries after the first attempt, transient errors only
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry
    pub backoff_base: Duration,
    pub max_body_bytes: usize,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            max_body_bytes: MAX_FEED_SIZE,
            user_agent: "FeedIngest/1.0 (Feed Aggregator)".to_string(),
        }
    }
}

impl FetcherConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

pub struct HttpFetcher {
    client: Client,
    config: FetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self { client, config })
    }

    async fn fetch_once(
        &self,
        url: &url::Url,
        source: &FeedSource,
    ) -> Result<RawFeedDocument, FetchError> {
        let mut response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(FetchError::transient(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(FetchError::permanent(format!("HTTP {}", status.as_u16())));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let expected = response.content_length();
        if let Some(len) = expected {
            if len > self.config.max_body_bytes as u64 {
                return Err(FetchError::permanent(format!(
                    "response too large: {} bytes",
                    len
                )));
            }
        }

        let mut content = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if content.len().saturating_add(chunk.len()) > self.config.max_body_bytes {
                return Err(FetchError::permanent(format!(
                    "response exceeds {} bytes",
                    self.config.max_body_bytes
                )));
            }
            content.extend_from_slice(&chunk);
        }

        if let Some(expected) = expected {
            if (content.len() as u64) < expected {
                return Err(FetchError::transient(format!(
                    "incomplete response: expected {} bytes, received {}",
                    expected,
                    content.len()
                )));
            }
        }

        debug!(source = %source.id, bytes = content.len(), "Fetched feed document");

        Ok(RawFeedDocument {
            source_id: source.id.clone(),
            fetched_at: Utc::now(),
            content,
            content_type,
        })
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, source: &FeedSource) -> Result<RawFeedDocument, FetchError> {
        let url = url::Url::parse(&source.url)
            .map_err(|e| FetchError::permanent(format!("invalid url '{}': {}", source.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::permanent(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }

        let mut attempt = 0;
        loop {
            match self.fetch_once(&url, source).await {
                Ok(doc) => return Ok(doc),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        source = %source.id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient fetch error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
