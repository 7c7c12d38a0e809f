//! The boundary the HTTP layer talks to.
//!
//! Reads always come from the cache and return immediately; refreshes are
//! fire-and-forget.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tracing::info;

use crate::cache::{AggregationCache, RefreshMode};
use crate::config::Config;
use crate::error::{ConfigError, UnknownSource};
use crate::fetcher::FeedFetcher;
use crate::model::{AggregatedView, FeedItem};
use crate::registry::SourceRegistry;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshTarget {
    All,
    Source(String),
}

pub struct FeedService {
    registry: SourceRegistry,
    cache: Arc<AggregationCache>,
    scheduler: Scheduler,
    recent_days: AtomicU32,
    reload_lock: Mutex<()>,
}

impl FeedService {
    /// Build the service from a validated configuration.
    ///
    /// Fails when the configuration has no usable sources.
    pub fn new(config: &Config, fetcher: Arc<dyn FeedFetcher>) -> Result<Self, ConfigError> {
        let sources = config.sources()?;
        let registry = SourceRegistry::new(sources.clone());
        let cache = Arc::new(
            AggregationCache::new(fetcher, sources).with_concurrency(config.max_concurrent_fetches),
        );
        let scheduler = Scheduler::new(Arc::clone(&cache));

        Ok(Self {
            registry,
            cache,
            scheduler,
            recent_days: AtomicU32::new(config.recent_days),
            reload_lock: Mutex::new(()),
        })
    }

    /// Begin polling every registered source.
    pub async fn start(&self) {
        let sources = self.registry.sources().await;
        self.scheduler.start(&sources).await;
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
    }

    pub fn cache(&self) -> &Arc<AggregationCache> {
        &self.cache
    }

    pub async fn get_aggregated(&self) -> AggregatedView {
        self.cache.snapshot().await
    }

    /// Start refreshing and return at once; poll [`get_aggregated`](Self::get_aggregated)
    /// for the result. Returns how many refreshes were started.
    pub async fn force_refresh(&self, target: RefreshTarget) -> Result<usize, UnknownSource> {
        let ids = match target {
            RefreshTarget::All => self.cache.source_ids().await,
            RefreshTarget::Source(id) => {
                if self.registry.get(&id).await.is_none() {
                    return Err(UnknownSource(id));
                }
                vec![id]
            }
        };

        let mut started = 0;
        for id in &ids {
            if self.cache.start_refresh(id, RefreshMode::Forced).await?.is_some() {
                started += 1;
            }
        }
        info!(started, "Forced refresh requested");
        Ok(started)
    }

    pub async fn is_refreshing(&self) -> bool {
        self.cache.is_refreshing().await
    }

    /// Items from all sources published within the last `days` (the configured
    /// window when `None`), newest first.
    pub async fn recent_items(&self, days: Option<u32>) -> Vec<FeedItem> {
        let days = days.unwrap_or_else(|| self.recent_days.load(Ordering::Relaxed));
        let since = Utc::now()
            .checked_sub_signed(ChronoDuration::days(i64::from(days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.cache.snapshot().await.items_since(since)
    }

    /// Replace the source set from a new configuration and restart polling.
    ///
    /// An invalid configuration is rejected and the current sources stay.
    pub async fn reload(&self, config: &Config) -> Result<usize, ConfigError> {
        let sources = config.sources()?;
        let count = sources.len();

        // Registry, cache and scheduler must all end up on the same set
        let _reload = self.reload_lock.lock().await;
        self.registry.replace(sources.clone()).await;
        self.cache.replace_sources(sources.clone()).await;
        self.recent_days.store(config.recent_days, Ordering::Relaxed);
        self.scheduler.start(&sources).await;

        info!(count, "Configuration reloaded");
        Ok(count)
    }
}
