//! Per-source aggregation state.
//!
//! Each source owns a slot with its own lock, fetch gate and start sequence.
//! There is no lock over the whole view: the slot map is only held long
//! enough to clone an `Arc`, and readers get immutable `Arc<SourceState>`s.
//!
//! Within a slot:
//! - the gate admits one fetch at a time; a cancelled task releases it when
//!   its future is dropped
//! - every refresh is stamped with the next start sequence, and a result is
//!   only committed if no later-started refresh has committed already

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::error::{RefreshError, UnknownSource};
use crate::fetcher::FeedFetcher;
use crate::model::{AggregatedView, FeedItem, FeedSource, SourceState, SourceStatus};
use crate::parser;

const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Skipped if a refresh for the source is already running.
    Scheduled,
    /// Abandons any running refresh for the source and starts over.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { items: usize },
    Failed(RefreshError),
    /// A later-started refresh already committed its result.
    Superseded,
    /// Another refresh was already in flight.
    Coalesced,
    /// The task was abandoned before it finished.
    Cancelled,
}

struct InFlight {
    seq: u64,
    handle: AbortHandle,
}

struct SourceSlot {
    source: FeedSource,
    state: RwLock<Arc<SourceState>>,
    gate: Mutex<()>,
    next_seq: AtomicU64,
    task: Mutex<Option<InFlight>>,
}

impl SourceSlot {
    fn new(source: FeedSource) -> Self {
        let state = Arc::new(SourceState::new(&source));
        Self::with_state(source, state, 0)
    }

    fn with_state(source: FeedSource, state: Arc<SourceState>, next_seq: u64) -> Self {
        Self {
            source,
            state: RwLock::new(state),
            gate: Mutex::new(()),
            next_seq: AtomicU64::new(next_seq),
            task: Mutex::new(None),
        }
    }

    /// A fresh slot for the changed `source`, carrying over this slot's state.
    async fn retarget(&self, source: FeedSource) -> Self {
        let current = Arc::clone(&*self.state.read().await);
        let mut state = SourceState::clone(&current);
        state.url = source.url.clone();
        state.status = state.settled_status();
        let seq = self.next_seq.load(Ordering::SeqCst);
        Self::with_state(source, Arc::new(state), seq)
    }

    async fn abort_in_flight(&self) {
        if let Some(in_flight) = self.task.lock().await.take() {
            in_flight.handle.abort();
        }
    }
}

pub struct AggregationCache {
    fetcher: Arc<dyn FeedFetcher>,
    slots: RwLock<HashMap<String, Arc<SourceSlot>>>,
    concurrency: usize,
}

impl AggregationCache {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, sources: Vec<FeedSource>) -> Self {
        let slots = sources
            .into_iter()
            .map(|s| (s.id.clone(), Arc::new(SourceSlot::new(s))))
            .collect();

        Self {
            fetcher,
            slots: RwLock::new(slots),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Cap on parallel refreshes within one [`refresh_all`](Self::refresh_all) cycle.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    async fn slot(&self, source_id: &str) -> Option<Arc<SourceSlot>> {
        self.slots.read().await.get(source_id).cloned()
    }

    pub async fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Immutable copy of every source's current state. Never waits on I/O.
    pub async fn snapshot(&self) -> AggregatedView {
        let slots: Vec<Arc<SourceSlot>> = self.slots.read().await.values().cloned().collect();

        let mut view = AggregatedView::default();
        for slot in slots {
            let state = slot.state.read().await.clone();
            view.sources.insert(slot.source.id.clone(), state);
        }
        view
    }

    pub async fn source_state(&self, source_id: &str) -> Option<Arc<SourceState>> {
        let slot = self.slot(source_id).await?;
        let state = slot.state.read().await.clone();
        Some(state)
    }

    pub async fn is_refreshing(&self) -> bool {
        let slots: Vec<Arc<SourceSlot>> = self.slots.read().await.values().cloned().collect();
        for slot in slots {
            if slot.state.read().await.status == SourceStatus::Refreshing {
                return true;
            }
        }
        false
    }

    /// Spawn a refresh task for one source.
    ///
    /// Returns `Ok(None)` when a scheduled refresh is coalesced into one that
    /// is already running.
    pub async fn start_refresh(
        self: &Arc<Self>,
        source_id: &str,
        mode: RefreshMode,
    ) -> Result<Option<JoinHandle<RefreshOutcome>>, UnknownSource> {
        let slot = self
            .slot(source_id)
            .await
            .ok_or_else(|| UnknownSource(source_id.to_string()))?;

        let mut task = slot.task.lock().await;
        if let Some(in_flight) = task.as_ref() {
            if !in_flight.handle.is_finished() {
                match mode {
                    RefreshMode::Scheduled => {
                        debug!(source = %source_id, seq = in_flight.seq, "Refresh already in flight, coalescing");
                        return Ok(None);
                    }
                    RefreshMode::Forced => {
                        debug!(source = %source_id, seq = in_flight.seq, "Abandoning in-flight refresh");
                        in_flight.handle.abort();
                    }
                }
            }
        }

        let seq = slot.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let cache = Arc::clone(self);
        let task_slot = Arc::clone(&slot);
        let handle = tokio::spawn(async move { cache.run_refresh(task_slot, seq).await });
        *task = Some(InFlight {
            seq,
            handle: handle.abort_handle(),
        });

        Ok(Some(handle))
    }

    /// Refresh one source and wait for the outcome.
    pub async fn refresh(self: &Arc<Self>, source_id: &str) -> Result<RefreshOutcome, UnknownSource> {
        match self.start_refresh(source_id, RefreshMode::Scheduled).await? {
            Some(handle) => Ok(join_outcome(source_id, handle).await),
            None => Ok(RefreshOutcome::Coalesced),
        }
    }

    /// One refresh cycle over every registered source, in parallel.
    pub async fn refresh_all(self: &Arc<Self>) -> Vec<(String, RefreshOutcome)> {
        let ids = self.source_ids().await;
        info!("Refreshing {} feeds", ids.len());

        let outcomes: Vec<(String, RefreshOutcome)> = stream::iter(ids)
            .map(|id| {
                let cache = Arc::clone(self);
                async move {
                    let outcome = cache.refresh(&id).await;
                    (id, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|(id, outcome)| async move { outcome.ok().map(|o| (id, o)) })
            .collect()
            .await;

        let failed = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, RefreshOutcome::Failed(_)))
            .count();
        info!(total = outcomes.len(), failed, "Feed refresh cycle complete");
        outcomes
    }

    /// Swap in a new source set, keeping state for sources that remain.
    ///
    /// Removed sources have their in-flight refresh aborted. A source whose
    /// URL or interval changed keeps its items until its next refresh.
    pub async fn replace_sources(&self, sources: Vec<FeedSource>) {
        let current: HashMap<String, Arc<SourceSlot>> = self.slots.read().await.clone();

        // Abandoned tasks release their gates before the map is locked
        for source in &sources {
            if let Some(existing) = current.get(&source.id) {
                if existing.source != *source {
                    existing.abort_in_flight().await;
                    drop(existing.gate.lock().await);
                }
            }
        }

        let mut slots = self.slots.write().await;
        let mut next = HashMap::with_capacity(sources.len());

        for source in sources {
            let slot = match slots.remove(&source.id) {
                Some(existing) if existing.source == source => existing,
                Some(existing) => {
                    existing.abort_in_flight().await;
                    Arc::new(existing.retarget(source).await)
                }
                None => Arc::new(SourceSlot::new(source)),
            };
            next.insert(slot.source.id.clone(), slot);
        }

        for (id, removed) in slots.drain() {
            debug!(source = %id, "Dropping removed feed source");
            removed.abort_in_flight().await;
        }

        *slots = next;
    }

    async fn run_refresh(&self, slot: Arc<SourceSlot>, seq: u64) -> RefreshOutcome {
        let _gate = slot.gate.lock().await;

        if !self.mark_refreshing(&slot, seq).await {
            return RefreshOutcome::Superseded;
        }

        let source = &slot.source;
        info!(source = %source.id, url = %source.url, "Fetching feed");
        let result = self.fetch_items(source).await;
        commit(&slot, seq, result).await
    }

    async fn fetch_items(&self, source: &FeedSource) -> Result<Vec<FeedItem>, RefreshError> {
        let doc = self.fetcher.fetch(source).await?;
        let items = parser::parse(&doc)?;
        Ok(items)
    }

    async fn mark_refreshing(&self, slot: &SourceSlot, seq: u64) -> bool {
        let mut guard = slot.state.write().await;
        if guard.committed_seq > seq {
            return false;
        }
        if guard.status != SourceStatus::Refreshing {
            let mut next = SourceState::clone(&guard);
            next.status = SourceStatus::Refreshing;
            *guard = Arc::new(next);
        }
        true
    }
}

/// Apply a finished refresh to the slot unless a later start already won.
///
/// Failures only touch the error and timestamp fields: items from the last
/// success are never cleared.
async fn commit(
    slot: &SourceSlot,
    seq: u64,
    result: Result<Vec<FeedItem>, RefreshError>,
) -> RefreshOutcome {
    let source_id = &slot.source.id;
    let mut guard = slot.state.write().await;
    if guard.committed_seq > seq {
        debug!(
            source = %source_id,
            seq,
            committed = guard.committed_seq,
            "Discarding result of superseded refresh"
        );
        return RefreshOutcome::Superseded;
    }

    let now = Utc::now();
    let mut next = SourceState::clone(&guard);
    next.committed_seq = seq;
    next.last_attempt = Some(now);

    let outcome = match result {
        Ok(items) => {
            info!(source = %source_id, items = items.len(), "Feed refreshed");
            let count = items.len();
            next.items = items;
            next.status = SourceStatus::Fresh;
            next.last_success = Some(now);
            next.last_error = None;
            RefreshOutcome::Updated { items: count }
        }
        Err(e) => {
            warn!(source = %source_id, error = %e, "Failed to refresh feed");
            next.status = SourceStatus::StaleWithError;
            next.last_error = Some(e.to_string());
            RefreshOutcome::Failed(e)
        }
    };

    *guard = Arc::new(next);
    outcome
}

async fn join_outcome(source_id: &str, handle: JoinHandle<RefreshOutcome>) -> RefreshOutcome {
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => RefreshOutcome::Cancelled,
        Err(e) => {
            error!(source = %source_id, error = %e, "Refresh task panicked");
            RefreshOutcome::Cancelled
        }
    }
}
