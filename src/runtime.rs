//! Query client: fetch orchestration, invalidation, and direct writes.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::QueryError;
use crate::key::{PrefixMatch, QueryKey};
use crate::mutation::{Mutation, MutationRunner};
use crate::spawn::{Spawner, TokioSpawner};
use crate::state::{downcast_data, ErasedData, QueryState};
use crate::storage::{FetchPlan, InFlight, QueryStore, StoredQuery};
use crate::subscription::Subscription;
use crate::tracer::{FetchOutcome, InvalidationScope, NoopTracer, Tracer};

/// The query client owns a [`QueryStore`] and resolves keys against it.
///
/// This is cheap to clone - all data is behind `Arc`. Clones share one store;
/// separately built clients never share keys or notifications.
///
/// # Example
///
/// ```ignore
/// let client = QueryClient::new();
///
/// let user = client
///     .fetch_query(("user", 1), || async { fetch_user(1).await })
///     .await?;
///
/// client.invalidate("user");
/// ```
pub struct QueryClient {
    store: Arc<QueryStore>,
    tracer: Arc<dyn Tracer>,
    spawner: Arc<dyn Spawner>,
    default_stale_time: Duration,
    prefix_match: PrefixMatch,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for QueryClient {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            tracer: self.tracer.clone(),
            spawner: self.spawner.clone(),
            default_stale_time: self.default_stale_time,
            prefix_match: self.prefix_match,
        }
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("entries", &self.store.len())
            .field("default_stale_time", &self.default_stale_time)
            .field("prefix_match", &self.prefix_match)
            .finish()
    }
}

impl QueryClient {
    /// Create a new client with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the client.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let client = QueryClient::builder()
    ///     .default_stale_time(Duration::from_secs(30))
    ///     .prefix_match(PrefixMatch::Structural)
    ///     .build();
    /// ```
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::new()
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<QueryStore> {
        &self.store
    }

    /// Stale time used by [`fetch_query`](Self::fetch_query).
    pub fn default_stale_time(&self) -> Duration {
        self.default_stale_time
    }

    /// Resolve `key`, using the client's default stale time.
    ///
    /// See [`fetch_query_with`](Self::fetch_query_with).
    pub async fn fetch_query<T, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        producer: F,
    ) -> Result<Arc<T>, QueryError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.fetch_query_with(key, self.default_stale_time, producer)
            .await
    }

    /// Resolve `key`.
    ///
    /// The producer call is handed to the client's [`Spawner`], so the entry
    /// reaches `Success` or `Error` even if this future is dropped early.
    ///
    /// - If a producer call for the key is in flight, joins it; `producer` is
    ///   not called.
    /// - Otherwise, if the key holds a successful value younger than
    ///   `stale_time`, returns it; `producer` is not called.
    /// - Otherwise marks the key loading, calls `producer`, stores its result,
    ///   and returns it.
    ///
    /// A zero `stale_time` never treats cached data as fresh but still joins
    /// concurrent fetches.
    ///
    /// # Errors
    ///
    /// - `QueryError::UserError` - the producer (this call's or the joined
    ///   one's) rejected
    /// - `QueryError::TypeMismatch` - the key holds a value of another type
    pub async fn fetch_query_with<T, F, Fut>(
        &self,
        key: impl Into<QueryKey>,
        stale_time: Duration,
        producer: F,
    ) -> Result<Arc<T>, QueryError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = key.into();
        let entry = self.store.ensure(&key);
        let stale_time_ms = u64::try_from(stale_time.as_millis()).unwrap_or(u64::MAX);

        let plan = self
            .store
            .plan_fetch(&entry, stale_time_ms, || self.start_fetch(&entry, producer));

        let result = match plan {
            FetchPlan::Fresh(data) => {
                trace!(key = %entry.serialized_key(), "cache hit");
                self.tracer.on_cache_hit(&key);
                Ok(data)
            }
            FetchPlan::Join(in_flight) => {
                trace!(key = %entry.serialized_key(), "join in-flight fetch");
                self.tracer.on_dedup_join(&key);
                in_flight.await
            }
            FetchPlan::Started(in_flight) => {
                self.tracer.on_fetch_start(&key);
                // Settles the entry even if every caller drops its future.
                self.spawner
                    .spawn(in_flight.clone().map(|_| ()).boxed());
                in_flight.await
            }
        };

        result.and_then(|data| downcast_data(&key, data))
    }

    /// Fetch `key` and discard the outcome.
    ///
    /// A failure is still stored on the entry and broadcast to observers.
    pub async fn prefetch_query<T, F, Fut>(&self, key: impl Into<QueryKey>, producer: F)
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = key.into();
        if let Err(err) = self.fetch_query(key.clone(), producer).await {
            debug!(key = %key, error = %err, "prefetch failed");
        }
    }

    /// Build the shared future for one producer call.
    ///
    /// The producer runs when the future is first polled, outside any entry
    /// lock. Settlement happens once inside the shared future no matter how
    /// many callers await it.
    fn start_fetch<T, F, Fut>(&self, entry: &Arc<StoredQuery>, producer: F) -> InFlight
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        // Weak handles: the entry owns this future while it is in flight.
        let store = Arc::downgrade(&self.store);
        let weak_entry = Arc::downgrade(entry);
        let tracer = self.tracer.clone();
        debug!(key = %entry.serialized_key(), "fetch: start");

        async move {
            let produced = AssertUnwindSafe(async move { producer().await })
                .catch_unwind()
                .await;

            let result: Result<ErasedData, QueryError> = match produced {
                Ok(Ok(value)) => Ok(Arc::new(value) as ErasedData),
                Ok(Err(err)) => Err(QueryError::from(err)),
                Err(payload) => Err(QueryError::from(anyhow::anyhow!(
                    "producer panicked: {}",
                    panic_message(payload)
                ))),
            };

            if let (Some(store), Some(entry)) = (store.upgrade(), weak_entry.upgrade()) {
                let outcome = match &result {
                    Ok(data) => {
                        store.mark_success(&entry, data.clone());
                        debug!(key = %entry.serialized_key(), "fetch: ok");
                        FetchOutcome::Success
                    }
                    Err(err) => {
                        store.mark_error(&entry, err.clone());
                        debug!(key = %entry.serialized_key(), error = %err, "fetch: err");
                        FetchOutcome::Error {
                            message: err.to_string(),
                        }
                    }
                };
                tracer.on_fetch_end(entry.key(), outcome);
            }

            result
        }
        .boxed()
        .shared()
    }

    /// Write `data` for `key` without calling a producer.
    ///
    /// Observers see the same notification as for a successful fetch.
    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: impl Into<QueryKey>, data: T) {
        let key = key.into();
        self.store.write(&key, Arc::new(data));
        self.tracer.on_write(&key);
    }

    /// Write the value computed by `update` from the current value.
    ///
    /// The read and the write are two separate store operations.
    ///
    /// # Errors
    ///
    /// `QueryError::TypeMismatch` if the current value is not a `T`; nothing is
    /// written in that case.
    pub fn set_query_data_with<T, F>(&self, key: impl Into<QueryKey>, update: F) -> Result<(), QueryError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Option<Arc<T>>) -> T,
    {
        let key = key.into();
        let previous = self.get_query_data::<T>(&key)?;
        self.set_query_data(key, update(previous));
        Ok(())
    }

    /// Current data for `key`, if any.
    ///
    /// # Errors
    ///
    /// `QueryError::TypeMismatch` if the stored value is not a `T`.
    pub fn get_query_data<T: Send + Sync + 'static>(
        &self,
        key: impl Into<QueryKey>,
    ) -> Result<Option<Arc<T>>, QueryError> {
        let key = key.into();
        let Some(data) = self.store.get(&key).and_then(|entry| entry.state().data) else {
            return Ok(None);
        };
        downcast_data(&key, data).map(Some)
    }

    /// Current type-erased state for `key`. Never creates an entry.
    pub fn get_query_state(&self, key: impl Into<QueryKey>) -> Option<QueryState> {
        self.store.get(&key.into()).map(|entry| entry.state())
    }

    /// Current typed state for `key`. Never creates an entry.
    ///
    /// # Errors
    ///
    /// `QueryError::TypeMismatch` if the stored value is not a `T`.
    pub fn get_query_state_as<T: Send + Sync + 'static>(
        &self,
        key: impl Into<QueryKey>,
    ) -> Result<Option<QueryState<T>>, QueryError> {
        let key = key.into();
        match self.store.get(&key) {
            Some(entry) => entry.state().typed(&key).map(Some),
            None => Ok(None),
        }
    }

    /// Mark `key` and every key in its prefix group stale.
    ///
    /// Data and status are untouched; the next fetch of each matched key calls
    /// its producer. Returns the number of keys marked.
    pub fn invalidate(&self, key: impl Into<QueryKey>) -> usize {
        let key = key.into();
        let count = self.store.mark_prefix_stale(&key, self.prefix_match);
        debug!(prefix = %key, count, "invalidate");
        self.tracer
            .on_invalidate(InvalidationScope::Prefix(key), count);
        count
    }

    /// Mark every stored key stale. Returns the number of keys marked.
    pub fn invalidate_all(&self) -> usize {
        let count = self.store.mark_all_stale();
        debug!(count, "invalidate all");
        self.tracer.on_invalidate(InvalidationScope::All, count);
        count
    }

    /// Register `observer` on `key`, creating the entry if needed.
    ///
    /// The observer runs synchronously after every change to the entry.
    pub fn subscribe<F>(&self, key: impl Into<QueryKey>, observer: F) -> Subscription
    where
        F: Fn(&QueryState) + Send + Sync + 'static,
    {
        self.store.subscribe(&key.into(), Arc::new(observer))
    }

    /// Register an observer that receives typed state.
    ///
    /// Notifications whose data is not a `T` are skipped and logged.
    pub fn subscribe_typed<T, F>(&self, key: impl Into<QueryKey>, observer: F) -> Subscription
    where
        T: Send + Sync + 'static,
        F: Fn(&QueryState<T>) + Send + Sync + 'static,
    {
        let key = key.into();
        let serialized = key.serialize();
        self.store.subscribe(
            &key,
            Arc::new(move |state: &QueryState| match state.downcast::<T>() {
                Some(typed) => observer(&typed),
                None => warn!(
                    key = %serialized,
                    expected = std::any::type_name::<T>(),
                    "typed observer skipped a value of another type"
                ),
            }),
        )
    }

    /// Number of observers registered on `key`.
    pub fn observer_count(&self, key: impl Into<QueryKey>) -> usize {
        self.store
            .get(&key.into())
            .map_or(0, |entry| entry.observer_count())
    }

    /// Keys of every stored entry, in no particular order.
    pub fn query_keys(&self) -> Vec<QueryKey> {
        self.store.keys()
    }

    /// Number of keys with a producer in flight.
    pub fn is_fetching(&self) -> usize {
        self.store.fetching_count()
    }

    /// Create a mutation instance that runs on this client's spawner.
    pub fn mutation_runner<M: Mutation>(&self, mutation: M) -> MutationRunner<M> {
        MutationRunner::with_spawner(mutation, self.spawner.clone())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder {
    default_stale_time: Duration,
    clock: Arc<dyn Clock>,
    prefix_match: PrefixMatch,
    tracer: Arc<dyn Tracer>,
    spawner: Arc<dyn Spawner>,
}

impl Default for QueryClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClientBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            default_stale_time: Duration::ZERO,
            clock: Arc::new(SystemClock),
            prefix_match: PrefixMatch::default(),
            tracer: Arc::new(NoopTracer),
            spawner: Arc::new(TokioSpawner),
        }
    }

    /// Stale time for [`QueryClient::fetch_query`]. Defaults to zero, which
    /// refetches on every non-concurrent call.
    pub fn default_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    /// Time source for `updated_at` and freshness checks.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// How [`QueryClient::invalidate`] matches prefix groups.
    pub fn prefix_match(mut self, prefix_match: PrefixMatch) -> Self {
        self.prefix_match = prefix_match;
        self
    }

    /// Hooks called on fetches, writes and invalidations.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Executor for producer calls. Defaults to [`TokioSpawner`].
    pub fn spawner(mut self, spawner: impl Spawner) -> Self {
        self.spawner = Arc::new(spawner);
        self
    }

    /// Build the client with a fresh store.
    pub fn build(self) -> QueryClient {
        QueryClient {
            store: Arc::new(QueryStore::with_clock(self.clock)),
            tracer: self.tracer,
            spawner: self.spawner,
            default_stale_time: self.default_stale_time,
            prefix_match: self.prefix_match,
        }
    }
}
