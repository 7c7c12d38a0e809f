//! Error types for the ingestion core.
//!
//! Every failure is scoped to one source. Nothing here is fatal to the
//! service except a [`ConfigError`] at startup.

use thiserror::Error;

/// Failure retrieving a feed document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Likely to succeed on retry: timeouts, resets, refused connections,
    /// 429 and 5xx responses, truncated bodies.
    #[error("transient fetch error: {0}")]
    Transient(String),
    /// Retrying will not help: malformed URL, 4xx status, oversized body.
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return Self::Permanent(err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() {
            return Self::Transient(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Self::Transient(err.to_string());
            }
        }
        Self::Permanent(err.to_string())
    }
}

/// Failure turning a fetched document into items.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed feed: {0}")]
    Malformed(String),
    #[error("unsupported feed format: {0}")]
    UnsupportedFormat(String),
}

/// Problems with the feed source list.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no feed sources configured")]
    MissingSourceList,
    #[error("invalid feed entry '{name}': {reason}")]
    InvalidEntry { name: String, reason: String },
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConfigError {
    pub fn invalid_entry(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEntry {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Why a single refresh of one source failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown feed source '{0}'")]
pub struct UnknownSource(pub String);
