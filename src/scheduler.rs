use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cache::{AggregationCache, RefreshOutcome};
use crate::model::FeedSource;

/// One polling loop per source, each on its own interval.
pub struct Scheduler {
    cache: Arc<AggregationCache>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(cache: Arc<AggregationCache>) -> Self {
        Self {
            cache,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start polling `sources`, replacing any loops already running.
    pub async fn start(&self, sources: &[FeedSource]) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }

        for source in sources {
            let cache = Arc::clone(&self.cache);
            let id = source.id.clone();
            let interval = source.poll_interval;
            tasks.push(tokio::spawn(poll_source(cache, id, interval)));
        }
        info!("Scheduled polling for {} feeds", sources.len());
    }

    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

async fn poll_source(cache: Arc<AggregationCache>, source_id: String, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // First tick completes immediately: initial fetch on startup
    loop {
        ticker.tick().await;
        match cache.refresh(&source_id).await {
            Ok(RefreshOutcome::Coalesced) => {
                debug!(source = %source_id, "Scheduled refresh skipped, one already running");
            }
            Ok(outcome) => {
                debug!(source = %source_id, ?outcome, "Scheduled refresh finished");
            }
            Err(e) => {
                info!(source = %source_id, error = %e, "Source removed, stopping polling");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetcher::FeedFetcher;
    use crate::model::RawFeedDocument;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CountingFetcher {
        calls: StdMutex<HashMap<String, usize>>,
    }

    impl CountingFetcher {
        fn count(&self, id: &str) -> usize {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl FeedFetcher for CountingFetcher {
        async fn fetch(&self, source: &FeedSource) -> Result<RawFeedDocument, FetchError> {
            *self.calls.lock().unwrap().entry(source.id.clone()).or_default() += 1;
            Err(FetchError::transient("offline"))
        }
    }

    fn source(id: &str, minutes: u64) -> FeedSource {
        FeedSource {
            id: id.to_string(),
            url: format!("https://{}.example.com/rss", id),
            poll_interval: Duration::from_secs(minutes * 60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_each_source_on_its_interval() {
        let fetcher = Arc::new(CountingFetcher::default());
        let sources = vec![source("fast", 1), source("slow", 5)];
        let cache = Arc::new(AggregationCache::new(fetcher.clone(), sources.clone()));
        let scheduler = Scheduler::new(cache);

        scheduler.start(&sources).await;
        tokio::time::sleep(Duration::from_secs(150)).await;

        // Ticks at 0s, 60s and 120s for the fast feed; only the initial one for the slow feed
        assert_eq!(fetcher.count("fast"), 3);
        assert_eq!(fetcher.count("slow"), 1);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_loops() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = Arc::new(AggregationCache::new(
            fetcher.clone(),
            vec![source("a", 1), source("b", 1)],
        ));
        let scheduler = Scheduler::new(cache);

        scheduler.start(&[source("a", 1)]).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fetcher.count("a"), 1);

        scheduler.start(&[source("b", 1)]).await;
        tokio::time::sleep(Duration::from_secs(150)).await;

        assert_eq!(fetcher.count("a"), 1);
        assert_eq!(fetcher.count("b"), 3);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_source_unknown() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = Arc::new(AggregationCache::new(fetcher.clone(), vec![]));
        let scheduler = Scheduler::new(cache);

        scheduler.start(&[source("ghost", 1)]).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(fetcher.count("ghost"), 0);
        let tasks = scheduler.tasks.lock().await;
        assert!(tasks.iter().all(|t| t.is_finished()));
    }
}
