//! The set of feed sources currently being polled.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::model::FeedSource;

pub struct SourceRegistry {
    sources: RwLock<Arc<[FeedSource]>>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<FeedSource>) -> Self {
        Self {
            sources: RwLock::new(sources.into()),
        }
    }

    pub async fn sources(&self) -> Arc<[FeedSource]> {
        self.sources.read().await.clone()
    }

    pub async fn get(&self, source_id: &str) -> Option<FeedSource> {
        self.sources
            .read()
            .await
            .iter()
            .find(|s| s.id == source_id)
            .cloned()
    }

    /// Swap in a new source list. Never partially applied.
    pub async fn replace(&self, sources: Vec<FeedSource>) {
        let count = sources.len();
        *self.sources.write().await = sources.into();
        info!(count, "Feed source registry replaced");
    }
}
