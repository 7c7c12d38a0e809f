use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::fetcher::FetcherConfig;
use crate::model::FeedSource;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Default polling interval in minutes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Retries after the first attempt for transient fetch errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Window used by the recent items listing, in days
    #[serde(default = "default_recent_days")]
    pub recent_days: u32,
    /// Feeds refreshed in parallel during one full cycle
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

fn default_refresh_interval() -> u64 {
    15
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_recent_days() -> u32 {
    7
}

fn default_max_concurrent_fetches() -> usize {
    10
}

/// One year, in minutes. Longer periods overflow the timer clock.
const MAX_REFRESH_INTERVAL: u64 = 60 * 24 * 365;

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    /// Overrides the global refresh interval for this feed, in minutes
    #[serde(default)]
    pub refresh_interval: Option<u64>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Validate the feed list and turn it into sources.
    ///
    /// Fails on the first bad entry: the service must not start with a
    /// partially understood source list.
    pub fn sources(&self) -> Result<Vec<FeedSource>, ConfigError> {
        if self.feeds.is_empty() {
            return Err(ConfigError::MissingSourceList);
        }

        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(self.feeds.len());
        for feed in &self.feeds {
            let name = feed.name.trim();
            if name.is_empty() {
                return Err(ConfigError::invalid_entry(&feed.url, "empty name"));
            }
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::invalid_entry(name, "duplicate name"));
            }

            let url = url::Url::parse(feed.url.trim())
                .map_err(|e| ConfigError::invalid_entry(name, format!("invalid url: {}", e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::invalid_entry(
                    name,
                    format!("unsupported url scheme '{}'", url.scheme()),
                ));
            }

            let minutes = feed.refresh_interval.unwrap_or(self.refresh_interval);
            if minutes == 0 {
                return Err(ConfigError::invalid_entry(name, "refresh interval must be positive"));
            }
            if minutes > MAX_REFRESH_INTERVAL {
                return Err(ConfigError::invalid_entry(name, "refresh interval too large"));
            }

            sources.push(FeedSource {
                id: name.to_string(),
                url: url.to_string(),
                poll_interval: Duration::from_secs(minutes * 60),
            });
        }

        Ok(sources)
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            timeout: Duration::from_secs(self.request_timeout),
            max_retries: self.max_retries,
            ..FetcherConfig::default()
        }
    }
}
