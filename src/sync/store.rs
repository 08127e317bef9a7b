//! Cache store.
//!
//! Owns the mapping from `CacheKey` to cache entry. Every operation takes the
//! store lock once and completes synchronously, so a reader never observes a
//! half-applied update. Fetching itself is driven by the query client; the
//! store only records who is watching an entry, whether a fetch is in flight
//! and whether a refetch has been scheduled.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::query::{FetchError, Fetcher, QueryOptions};

const SOURCE: &str = "sync::store";

pub(crate) type InFlight = Shared<BoxFuture<'static, QueryState>>;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryStatus::Idle => "idle",
            QueryStatus::Loading => "loading",
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
        }
    }
}

/// What a mounted view sees of an entry.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub data: Option<Value>,
    pub status: QueryStatus,
    pub error: Option<FetchError>,
    pub fetched_at: Option<Instant>,
    pub is_stale: bool,
    /// A fetch for this key is in flight.
    pub is_fetching: bool,
}

impl QueryState {
    fn idle() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            fetched_at: None,
            is_stale: false,
            is_fetching: false,
        }
    }
}

impl Default for QueryState {
    fn default() -> Self {
        Self::idle()
    }
}

/// Snapshot of one cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub data: Option<Value>,
    pub status: QueryStatus,
    pub error: Option<FetchError>,
    pub fetched_at: Option<Instant>,
    pub is_stale: bool,
    pub subscribers: usize,
}

/// Partial entry state merged by [`CacheStore::upsert`].
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub data: Option<Value>,
    pub status: Option<QueryStatus>,
    pub error: Option<Option<FetchError>>,
    pub fetched_at: Option<Instant>,
    pub is_stale: Option<bool>,
}

impl EntryPatch {
    pub fn success(data: Value, fetched_at: Instant) -> Self {
        Self {
            data: Some(data),
            status: Some(QueryStatus::Success),
            error: Some(None),
            fetched_at: Some(fetched_at),
            is_stale: Some(false),
        }
    }

    /// Failure keeps any previously fetched data.
    pub fn failure(error: FetchError) -> Self {
        Self {
            status: Some(QueryStatus::Error),
            error: Some(Some(error)),
            ..Self::default()
        }
    }
}

/// Outcome of [`CacheStore::invalidate`].
#[derive(Debug, Default)]
pub struct Invalidation {
    /// Entries marked stale.
    pub affected: usize,
    /// Keys whose refetch was newly scheduled and must be started.
    pub refetch: Vec<CacheKey>,
}

/// What the query client should do after a subscriber attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MountAction {
    /// Cached data is fresh (or the query is disabled); no network.
    Serve,
    /// A fetch is already in flight; the subscriber rides on it.
    Attach,
    /// No usable data; start a fetch.
    Fetch,
}

/// Why a fetch is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchTrigger {
    Mount,
    Invalidation,
    Manual,
}

pub(crate) enum BeginFetch {
    Started(InFlight),
    Attached(InFlight),
    Skipped,
}

/// Identifies one mounted subscriber of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SubscriberId(u64);

/// Options a single subscriber mounted with.
#[derive(Debug, Clone, Copy)]
struct Subscription {
    enabled: bool,
    stale_time: Duration,
    retry: u32,
}

pub(crate) struct Completion {
    pub state: QueryState,
    pub refetch: bool,
}

struct EntryState {
    data: Option<Value>,
    status: QueryStatus,
    error: Option<FetchError>,
    fetched_at: Option<Instant>,
    is_stale: bool,
    subscriptions: HashMap<SubscriberId, Subscription>,
    next_subscriber: u64,
    /// Shortest freshness window among live subscribers, kept after the
    /// last one leaves so GC can judge the data.
    stale_time: Duration,
    /// Retry count of the last subscriber, used once nobody is mounted.
    retry: u32,
    fetcher: Option<Fetcher>,
    in_flight: Option<InFlight>,
    refetch_scheduled: bool,
    tx: watch::Sender<QueryState>,
}

impl EntryState {
    fn new(stale_time: Duration) -> Self {
        let (tx, _) = watch::channel(QueryState::idle());
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            fetched_at: None,
            is_stale: false,
            subscriptions: HashMap::new(),
            next_subscriber: 0,
            stale_time,
            retry: 0,
            fetcher: None,
            in_flight: None,
            refetch_scheduled: false,
            tx,
        }
    }

    fn state(&self) -> QueryState {
        QueryState {
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            is_stale: self.is_stale,
            is_fetching: self.in_flight.is_some(),
        }
    }

    fn snapshot(&self, key: &CacheKey) -> CacheEntry {
        CacheEntry {
            key: key.clone(),
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            is_stale: self.is_stale,
            subscribers: self.subscribers(),
        }
    }

    fn subscribers(&self) -> usize {
        self.subscriptions.len()
    }

    /// Invalidation refetches as long as one mounted view wants fetching.
    fn has_enabled_subscriber(&self) -> bool {
        self.subscriptions.values().any(|sub| sub.enabled)
    }

    fn retry(&self) -> u32 {
        self.subscriptions
            .values()
            .map(|sub| sub.retry)
            .max()
            .unwrap_or(self.retry)
    }

    fn recompute_stale_time(&mut self) {
        if let Some(min) = self.subscriptions.values().map(|sub| sub.stale_time).min() {
            self.stale_time = min;
        }
    }

    fn publish(&self) {
        self.tx.send_replace(self.state());
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.is_fresh_within(now, self.stale_time)
    }

    fn is_fresh_within(&self, now: Instant, stale_time: Duration) -> bool {
        self.status == QueryStatus::Success
            && !self.is_stale
            && self
                .fetched_at
                .is_some_and(|at| now.saturating_duration_since(at) < stale_time)
    }

    fn apply(&mut self, patch: EntryPatch) {
        if let Some(data) = patch.data {
            self.data = Some(data);
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(fetched_at) = patch.fetched_at {
            self.fetched_at = Some(fetched_at);
        }
        if let Some(is_stale) = patch.is_stale {
            self.is_stale = is_stale;
        }
    }

    fn evictable(&self, now: Instant) -> bool {
        self.subscriptions.is_empty()
            && self.in_flight.is_none()
            && (self.is_stale
                || self.status != QueryStatus::Success
                || !self.is_fresh(now))
    }
}

/// In-memory keyed store of query results.
pub struct CacheStore {
    entries: Mutex<HashMap<CacheKey, EntryState>>,
    default_stale_time: Duration,
}

impl CacheStore {
    pub fn new(default_stale_time: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_stale_time,
        }
    }

    /// Structural lookup.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        mutex_lock(&self.entries, SOURCE, "get")
            .get(key)
            .map(|entry| entry.snapshot(key))
    }

    /// Merge `patch` into the entry for `key`, creating it if needed.
    pub fn upsert(&self, key: &CacheKey, patch: EntryPatch) {
        let mut entries = mutex_lock(&self.entries, SOURCE, "upsert");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| EntryState::new(self.default_stale_time));
        entry.apply(patch);
        entry.publish();
    }

    /// Mark every entry equal to or prefixed by `prefix` as stale.
    ///
    /// Each affected entry with at least one subscriber gets exactly one
    /// refetch scheduled; further invalidations before that refetch starts
    /// are absorbed. An entry with a fetch already in flight is refetched
    /// once that fetch completes. Unknown keys are a no-op.
    pub fn invalidate(&self, prefix: &CacheKey) -> Invalidation {
        let mut entries = mutex_lock(&self.entries, SOURCE, "invalidate");
        let mut outcome = Invalidation::default();

        for (key, entry) in entries.iter_mut() {
            if !key.starts_with(prefix) {
                continue;
            }
            outcome.affected += 1;
            entry.is_stale = true;

            if entry.has_enabled_subscriber() && !entry.refetch_scheduled {
                entry.refetch_scheduled = true;
                if entry.in_flight.is_none() {
                    outcome.refetch.push(key.clone());
                }
            }
            entry.publish();
        }

        debug!(
            prefix = %prefix,
            affected = outcome.affected,
            scheduled = outcome.refetch.len(),
            "Cache invalidated"
        );
        outcome
    }

    /// Remove `key` if nobody is watching it and its data is no longer
    /// fresh. Returns whether the entry was removed.
    pub fn evict(&self, key: &CacheKey, now: Instant) -> bool {
        let mut entries = mutex_lock(&self.entries, SOURCE, "evict");
        let evictable = entries.get(key).is_some_and(|entry| entry.evictable(now));
        if evictable {
            entries.remove(key);
            debug!(cache_key = %key, "Cache entry evicted");
        }
        evictable
    }

    /// Evict every evictable entry. Returns the number removed.
    pub fn collect_garbage(&self, now: Instant) -> usize {
        let mut entries = mutex_lock(&self.entries, SOURCE, "collect_garbage");
        let before = entries.len();
        entries.retain(|_, entry| !entry.evictable(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held, in no particular order.
    pub fn keys(&self) -> Vec<CacheKey> {
        mutex_lock(&self.entries, SOURCE, "keys")
            .keys()
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Query client hooks
    // ------------------------------------------------------------------

    /// Register a subscriber. Freshness on mount is judged against the
    /// subscriber's own `stale_time`.
    pub(crate) fn attach(
        &self,
        key: &CacheKey,
        fetcher: Fetcher,
        options: &QueryOptions,
        now: Instant,
    ) -> (watch::Receiver<QueryState>, MountAction, SubscriberId) {
        let mut entries = mutex_lock(&self.entries, SOURCE, "attach");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| EntryState::new(self.default_stale_time));

        let subscription = Subscription {
            enabled: options.enabled,
            stale_time: options.stale_time.unwrap_or(self.default_stale_time),
            retry: options.retry.unwrap_or(0),
        };
        let id = SubscriberId(entry.next_subscriber);
        entry.next_subscriber += 1;
        entry.subscriptions.insert(id, subscription);
        entry.retry = subscription.retry;
        entry.fetcher = Some(fetcher);
        entry.recompute_stale_time();

        let action = if !subscription.enabled {
            MountAction::Serve
        } else if entry.in_flight.is_some() {
            MountAction::Attach
        } else if entry.is_fresh_within(now, subscription.stale_time) {
            MountAction::Serve
        } else {
            MountAction::Fetch
        };

        (entry.tx.subscribe(), action, id)
    }

    pub(crate) fn detach(&self, key: &CacheKey, id: SubscriberId) {
        let mut entries = mutex_lock(&self.entries, SOURCE, "detach");
        if let Some(entry) = entries.get_mut(key) {
            entry.subscriptions.remove(&id);
            entry.recompute_stale_time();
            if !entry.has_enabled_subscriber() && entry.in_flight.is_none() {
                entry.refetch_scheduled = false;
            }
        }
    }

    /// Start a fetch for `key` unless one is in flight.
    ///
    /// `make` builds the fetch future while the store lock is held, which
    /// is what guarantees a single in-flight fetch per key.
    pub(crate) fn begin_fetch<F>(&self, key: &CacheKey, trigger: FetchTrigger, make: F) -> BeginFetch
    where
        F: FnOnce(Fetcher, u32) -> InFlight,
    {
        let mut entries = mutex_lock(&self.entries, SOURCE, "begin_fetch");
        let Some(entry) = entries.get_mut(key) else {
            return BeginFetch::Skipped;
        };

        if let Some(in_flight) = &entry.in_flight {
            return BeginFetch::Attached(in_flight.clone());
        }

        let allowed = match trigger {
            FetchTrigger::Manual => true,
            FetchTrigger::Mount | FetchTrigger::Invalidation => entry.has_enabled_subscriber(),
        };
        let fetcher = match (&entry.fetcher, allowed) {
            (Some(fetcher), true) => fetcher.clone(),
            _ => {
                if trigger == FetchTrigger::Invalidation {
                    entry.refetch_scheduled = false;
                }
                return BeginFetch::Skipped;
            }
        };

        let in_flight = make(fetcher, entry.retry());
        entry.in_flight = Some(in_flight.clone());
        entry.refetch_scheduled = false;
        if entry.data.is_none() {
            entry.status = QueryStatus::Loading;
        }
        entry.publish();
        BeginFetch::Started(in_flight)
    }

    pub(crate) fn complete(
        &self,
        key: &CacheKey,
        result: Result<Value, FetchError>,
        now: Instant,
    ) -> Completion {
        let mut entries = mutex_lock(&self.entries, SOURCE, "complete");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| EntryState::new(self.default_stale_time));

        entry.in_flight = None;
        match result {
            Ok(data) => entry.apply(EntryPatch::success(data, now)),
            Err(error) => entry.apply(EntryPatch::failure(error)),
        }

        // Invalidated while the fetch was running: the result is already
        // outdated, so keep the entry stale and go again.
        let refetch = if entry.refetch_scheduled {
            entry.is_stale = true;
            if entry.has_enabled_subscriber() {
                true
            } else {
                entry.refetch_scheduled = false;
                false
            }
        } else {
            false
        };

        entry.publish();
        Completion {
            state: entry.state(),
            refetch,
        }
    }

    /// Drop a scheduled refetch that could not be started.
    pub(crate) fn clear_scheduled(&self, key: &CacheKey) {
        if let Some(entry) = mutex_lock(&self.entries, SOURCE, "clear_scheduled").get_mut(key) {
            entry.refetch_scheduled = false;
        }
    }

    pub(crate) fn state(&self, key: &CacheKey) -> Option<QueryState> {
        mutex_lock(&self.entries, SOURCE, "state")
            .get(key)
            .map(EntryState::state)
    }
}
