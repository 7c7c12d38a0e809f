use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A feed to poll. Immutable once loaded; reload replaces the whole set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSource {
    pub id: String,
    pub url: String,
    pub poll_interval: Duration,
}

/// Bytes as they came off the wire, before parsing.
#[derive(Debug, Clone)]
pub struct RawFeedDocument {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub content: Vec<u8>,
    pub content_type: Option<String>,
}

/// One normalized entry, whatever syndication format it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedItem {
    /// Derived from link and title, stable across refreshes and formats.
    pub id: String,
    pub source_id: String,
    pub title: String,
    pub link: String,
    pub published: DateTime<Utc>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Uninitialized,
    Refreshing,
    Fresh,
    StaleWithError,
}

/// Last known state for one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceState {
    pub source_id: String,
    pub url: String,
    pub status: SourceStatus,
    /// Most recent first.
    pub items: Vec<FeedItem>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Start sequence of the refresh that last wrote this state.
    #[serde(skip)]
    pub(crate) committed_seq: u64,
}

impl SourceState {
    pub fn new(source: &FeedSource) -> Self {
        Self {
            source_id: source.id.clone(),
            url: source.url.clone(),
            status: SourceStatus::Uninitialized,
            items: Vec::new(),
            last_success: None,
            last_attempt: None,
            last_error: None,
            committed_seq: 0,
        }
    }

    /// The status to report when no refresh is running for the source.
    pub(crate) fn settled_status(&self) -> SourceStatus {
        match self.status {
            SourceStatus::Refreshing if self.last_attempt.is_none() => SourceStatus::Uninitialized,
            SourceStatus::Refreshing if self.last_error.is_some() => SourceStatus::StaleWithError,
            SourceStatus::Refreshing => SourceStatus::Fresh,
            other => other,
        }
    }
}

/// Point-in-time copy of every source's state.
///
/// Entries are shared `Arc`s of immutable states, so holding a view never
/// blocks or observes a refresh in progress.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedView {
    pub sources: BTreeMap<String, Arc<SourceState>>,
}

impl AggregatedView {
    pub fn get(&self, source_id: &str) -> Option<&SourceState> {
        self.sources.get(source_id).map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Items from every source published at or after `since`, newest first.
    pub fn items_since(&self, since: DateTime<Utc>) -> Vec<FeedItem> {
        let mut items: Vec<FeedItem> = self
            .sources
            .values()
            .flat_map(|state| state.items.iter())
            .filter(|item| item.published >= since)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.published.cmp(&a.published));
        items
    }
}
