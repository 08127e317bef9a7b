//! Query client.
//!
//! Binds a view's lifecycle to a cache entry and drives fetching. A view calls
//! [`QueryClient::use_query`] on mount and keeps the returned [`QueryHandle`]
//! for as long as it is mounted; dropping the handle is the unmount.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::bus::{BusSubscription, HandlerError, InvalidationBus};
use super::config::SyncConfig;
use super::events::InvalidationEvent;
use super::keys::CacheKey;
use super::lock::mutex_lock;
use super::store::{
    BeginFetch, CacheStore, FetchTrigger, InFlight, MountAction, QueryState, QueryStatus,
    SubscriberId,
};

const SOURCE: &str = "sync::query";
const METRIC_FETCH_TOTAL: &str = "aquasync_query_fetch_total";
const METRIC_FETCH_MS: &str = "aquasync_query_fetch_ms";

/// Fetch function bound to a cache key.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync>;

/// Why a fetch failed. Stored in the cache entry and shown to every view
/// watching it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("data store error: {0}")]
    Store(String),
    #[error("session expired")]
    SessionExpired,
    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Per-query options. Unset fields fall back to the client's [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub stale_time: Option<Duration>,
    /// A disabled query serves whatever is cached and never fetches on its
    /// own; `refetch` still works.
    pub enabled: bool,
    pub retry: Option<u32>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: None,
            enabled: true,
            retry: None,
        }
    }
}

impl QueryOptions {
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }
}

struct ClientInner {
    store: Arc<CacheStore>,
    config: SyncConfig,
    bus_subscription: Mutex<Option<BusSubscription>>,
}

/// Shared entry point for running queries against the cache store.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    pub fn new(config: SyncConfig) -> Self {
        let store = Arc::new(CacheStore::new(config.stale_time()));
        Self {
            inner: Arc::new(ClientInner {
                store,
                config,
                bus_subscription: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Listen for invalidation events on `bus`, replacing any earlier
    /// registration.
    pub fn attach_bus(&self, bus: &InvalidationBus) {
        let client = Arc::downgrade(&self.inner);
        let subscription = bus.subscribe("query-client", move |event| {
            match client.upgrade() {
                Some(inner) => inner.apply_invalidation(event),
                None => Ok(()),
            }
        });
        *mutex_lock(&self.inner.bus_subscription, SOURCE, "attach_bus") = Some(subscription);
    }

    /// Mount a query.
    ///
    /// Serves cached data when it is within its freshness window, rides on a
    /// fetch already in flight for the same key, and otherwise starts one.
    pub fn use_query<F, Fut>(&self, key: CacheKey, fetch: F, options: QueryOptions) -> QueryHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let fetcher: Fetcher = Arc::new(move || fetch().boxed());
        self.use_query_with(key, fetcher, options)
    }

    pub fn use_query_with(
        &self,
        key: CacheKey,
        fetcher: Fetcher,
        options: QueryOptions,
    ) -> QueryHandle {
        let options = QueryOptions {
            retry: Some(options.retry.unwrap_or(self.inner.config.retry)),
            ..options
        };
        let (rx, action, subscriber) = self
            .inner
            .store
            .attach(&key, fetcher, &options, Instant::now());
        debug!(cache_key = %key, action = ?action, "Query mounted");

        if action == MountAction::Fetch {
            self.inner.start_fetch(&key, FetchTrigger::Mount);
        }

        QueryHandle {
            client: self.inner.clone(),
            key,
            rx,
            subscriber: Some(subscriber),
        }
    }

    /// Periodically evict unobserved entries whose data is no longer fresh.
    pub fn spawn_gc(&self) -> JoinHandle<()> {
        let client = Arc::downgrade(&self.inner);
        let period = self.inner.config.gc_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = client.upgrade() else {
                    break;
                };
                let removed = inner.store.collect_garbage(Instant::now());
                if removed > 0 {
                    debug!(removed, remaining = inner.store.len(), "Cache garbage collected");
                }
            }
        })
    }
}

impl ClientInner {
    fn apply_invalidation(self: Arc<Self>, event: &InvalidationEvent) -> Result<(), HandlerError> {
        let mut refetch = Vec::new();
        for target in &event.targets {
            refetch.extend(self.store.invalidate(target).refetch);
        }
        if refetch.is_empty() {
            return Ok(());
        }

        let Ok(handle) = Handle::try_current() else {
            for key in &refetch {
                self.store.clear_scheduled(key);
            }
            return Err(HandlerError::new("no async runtime, refetch skipped"));
        };

        // Refetches start on a later turn so that every invalidation published
        // in this turn is applied first.
        handle.spawn(async move {
            for key in refetch {
                self.start_fetch(&key, FetchTrigger::Invalidation);
            }
        });
        Ok(())
    }

    fn start_fetch(self: &Arc<Self>, key: &CacheKey, trigger: FetchTrigger) -> Option<InFlight> {
        let Ok(handle) = Handle::try_current() else {
            warn!(cache_key = %key, "Fetch skipped: no async runtime");
            return None;
        };

        let client = self.clone();
        let begin = self.store.begin_fetch(key, trigger, |fetcher, retry| {
            client.run_fetch(key.clone(), fetcher, retry).boxed().shared()
        });

        match begin {
            BeginFetch::Started(in_flight) => {
                debug!(cache_key = %key, trigger = ?trigger, "Fetch started");
                handle.spawn(in_flight.clone());
                Some(in_flight)
            }
            BeginFetch::Attached(in_flight) => Some(in_flight),
            BeginFetch::Skipped => None,
        }
    }

    async fn run_fetch(self: Arc<Self>, key: CacheKey, fetcher: Fetcher, retry: u32) -> QueryState {
        let started_at = Instant::now();
        let mut attempt = 0;

        let result = loop {
            let outcome = match tokio::time::timeout(
                self.config.request_timeout(),
                AssertUnwindSafe(fetcher()).catch_unwind(),
            )
            .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(FetchError::Store("fetch function panicked".to_string())),
                Err(_) => Err(FetchError::Timeout),
            };

            match outcome {
                Ok(data) => break Ok(data),
                Err(err) if attempt < retry => {
                    attempt += 1;
                    debug!(cache_key = %key, attempt, error = %err, "Fetch failed, retrying");
                    let delay = self.config.retry_delay();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => break Err(err),
            }
        };

        let outcome = if result.is_ok() { "success" } else { "error" };
        counter!(METRIC_FETCH_TOTAL, "outcome" => outcome).increment(1);
        histogram!(METRIC_FETCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        if let Err(err) = &result {
            warn!(cache_key = %key, attempts = attempt + 1, error = %err, "Fetch failed");
        }

        let completion = self.store.complete(&key, result, Instant::now());
        if completion.refetch {
            self.start_fetch(&key, FetchTrigger::Invalidation);
        }
        completion.state
    }
}

/// A mounted query. Dropping it unmounts.
pub struct QueryHandle {
    client: Arc<ClientInner>,
    key: CacheKey,
    rx: watch::Receiver<QueryState>,
    subscriber: Option<SubscriberId>,
}

impl QueryHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Latest state of the entry.
    pub fn state(&self) -> QueryState {
        self.rx.borrow().clone()
    }

    /// Decode the cached data, if any.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, FetchError> {
        match &self.rx.borrow().data {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| FetchError::Decode(err.to_string())),
            None => Ok(None),
        }
    }

    /// Wait for the next state change. `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<QueryState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the state satisfies `condition`, checking the current
    /// state first.
    pub async fn wait_until<F>(&mut self, condition: F) -> Option<QueryState>
    where
        F: FnMut(&QueryState) -> bool,
    {
        self.rx
            .wait_for(condition)
            .await
            .ok()
            .map(|state| state.clone())
    }

    /// Wait until no fetch is running and the entry holds data or an error.
    pub async fn settled(&mut self) -> Option<QueryState> {
        self.wait_until(|state| {
            !state.is_fetching && matches!(state.status, QueryStatus::Success | QueryStatus::Error)
        })
        .await
    }

    /// Fetch now, ignoring the freshness window. Joins a fetch already in
    /// flight instead of starting a second one.
    pub async fn refetch(&self) -> QueryState {
        match self.client.start_fetch(&self.key, FetchTrigger::Manual) {
            Some(in_flight) => in_flight.await,
            None => self
                .client
                .store
                .state(&self.key)
                .unwrap_or_else(|| self.state()),
        }
    }

    pub fn unmount(self) {}
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        if let Some(subscriber) = self.subscriber.take() {
            self.client.store.detach(&self.key, subscriber);
            debug!(cache_key = %self.key, "Query unmounted");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn client() -> QueryClient {
        QueryClient::new(SyncConfig::default())
    }

    fn exploding() -> Result<Value, FetchError> {
        panic!("fetch exploded")
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        data: Value,
    ) -> impl Fn() -> BoxFuture<'static, Result<Value, FetchError>> + Send + Sync + 'static {
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let data = data.clone();
            async move { Ok(data) }.boxed()
        }
    }

    #[tokio::test]
    async fn mount_fetches_and_settles() {
        let client = client();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handle = client.use_query(
            CacheKey::root("samples"),
            counting(&calls, json!([{"id": 1}])),
            QueryOptions::default(),
        );

        let state = handle.settled().await.expect("settled");
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data, Some(json!([{"id": 1}])));
        assert!(!state.is_stale);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_surfaces_error() {
        let client = client();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut handle = client.use_query(
            CacheKey::root("samples"),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Store("boom".to_string())) }
            },
            QueryOptions::default().retry(2),
        );

        let state = handle.settled().await.expect("settled");
        assert_eq!(state.status, QueryStatus::Error);
        assert_eq!(state.error, Some(FetchError::Store("boom".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out_as_fetch_error() {
        let client = client();
        let mut handle = client.use_query(
            CacheKey::root("samples"),
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!([]))
            },
            QueryOptions::default().retry(0),
        );

        let state = handle.settled().await.expect("settled");
        assert_eq!(state.error, Some(FetchError::Timeout));
    }

    #[tokio::test]
    async fn panicking_fetch_becomes_error() {
        let client = client();
        let mut handle = client.use_query(
            CacheKey::root("samples"),
            || async { exploding() },
            QueryOptions::default().retry(0),
        );

        let state = handle.settled().await.expect("settled");
        assert_eq!(state.status, QueryStatus::Error);
    }

    #[tokio::test]
    async fn disabled_query_does_not_fetch_until_refetch() {
        let client = client();
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = client.use_query(
            CacheKey::new([json!("applicationStatus"), json!("")]),
            counting(&calls, json!(null)),
            QueryOptions::default().enabled(false),
        );
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state().status, QueryStatus::Idle);

        let state = handle.refetch().await;
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unmount_keeps_cached_data() {
        let client = client();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::root("testParameters");
        let mut handle =
            client.use_query(key.clone(), counting(&calls, json!(["ph"])), QueryOptions::default());
        handle.settled().await.expect("settled");
        handle.unmount();

        let entry = client.store().get(&key).expect("entry");
        assert_eq!(entry.subscribers, 0);
        assert_eq!(entry.data, Some(json!(["ph"])));

        let remounted =
            client.use_query(key, counting(&calls, json!(["ph"])), QueryOptions::default());
        assert_eq!(remounted.state().data, Some(json!(["ph"])));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn data_as_decodes_rows() {
        let client = client();
        let mut handle = client.use_query(
            CacheKey::root("samples"),
            || async { Ok(json!([1, 2, 3])) },
            QueryOptions::default(),
        );
        handle.settled().await.expect("settled");

        let rows: Option<Vec<u32>> = handle.data_as().expect("decode");
        assert_eq!(rows, Some(vec![1, 2, 3]));
        assert!(matches!(
            handle.data_as::<String>(),
            Err(FetchError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn bus_invalidation_refetches_mounted_query() {
        let client = client();
        let bus = InvalidationBus::new();
        client.attach_bus(&bus);

        let calls = Arc::new(AtomicUsize::new(0));
        let mut handle = client.use_query(
            CacheKey::root("sewerData"),
            counting(&calls, json!([])),
            QueryOptions::default(),
        );
        handle.settled().await.expect("settled");

        bus.publish(InvalidationEvent::invalidate(CacheKey::root("sewerData"), "test"));
        assert!(handle.state().is_stale);

        let state = handle
            .wait_until(|state| !state.is_stale && !state.is_fetching)
            .await
            .expect("refetched");
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gc_sweep_evicts_unobserved_entries() {
        let client = client();
        let key = CacheKey::root("adminSamples");
        let mut handle =
            client.use_query(key.clone(), || async { Ok(json!([])) }, QueryOptions::default());
        handle.settled().await.expect("settled");
        drop(handle);

        let gc = client.spawn_gc();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(client.store().get(&key).is_none());
        gc.abort();
    }
}
