//! Type-erased storage for cached query state.

use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use papaya::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::error::QueryError;
use crate::key::{Prefix, PrefixMatch, QueryKey};
use crate::state::{ErasedData, QueryState, QueryStatus};
use crate::subscription::{fan_out, Observer, Observers, Subscription};

/// The one pending producer call for a key, joinable by any number of callers.
pub(crate) type InFlight = Shared<BoxFuture<'static, Result<ErasedData, QueryError>>>;

/// Cache record for one key.
///
/// Created lazily on first access and kept for the lifetime of its store.
pub struct StoredQuery {
    key: QueryKey,
    serialized: String,
    state: Mutex<EntryState>,
    observers: Observers,
}

#[derive(Default)]
struct EntryState {
    view: QueryState,
    in_flight: Option<InFlight>,
}

impl EntryState {
    fn fresh_data(&self, now_ms: u64, stale_time_ms: u64) -> Option<ErasedData> {
        if self.view.status != QueryStatus::Success || self.view.updated_at == 0 {
            return None;
        }
        if now_ms.saturating_sub(self.view.updated_at) < stale_time_ms {
            self.view.data.clone()
        } else {
            None
        }
    }
}

impl StoredQuery {
    fn new(key: QueryKey, serialized: String) -> Self {
        Self {
            key,
            serialized,
            state: Mutex::new(EntryState::default()),
            observers: Observers::default(),
        }
    }

    /// The key this entry was first created with.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Canonical serialized key.
    pub fn serialized_key(&self) -> &str {
        &self.serialized
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState {
        self.state.lock().view.clone()
    }

    /// Current status.
    pub fn status(&self) -> QueryStatus {
        self.state.lock().view.status
    }

    /// Whether a producer call is in flight.
    pub fn is_fetching(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn observers(&self) -> &Observers {
        &self.observers
    }

    /// Apply `f` under the state lock and return the resulting snapshot.
    fn update(&self, f: impl FnOnce(&mut EntryState)) -> QueryState {
        let mut state = self.state.lock();
        f(&mut state);
        state.view.clone()
    }
}

/// What the fetch orchestrator should do for a key.
pub(crate) enum FetchPlan {
    /// A producer is already running; await its shared result.
    Join(InFlight),
    /// Cached data is still fresh.
    Fresh(ErasedData),
    /// A new producer call was registered and must be awaited.
    Started(InFlight),
}

/// Mapping from canonical key to [`StoredQuery`].
///
/// Every mutating operation notifies the entry's observers synchronously,
/// after the entry lock has been released.
pub struct QueryStore {
    entries: HashMap<String, Arc<StoredQuery>, ahash::RandomState>,
    clock: Arc<dyn Clock>,
}

impl Default for QueryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::with_hasher(ahash::RandomState::new()),
            clock,
        }
    }

    /// Current time on the store's clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Timestamp recorded for a resolution. `0` is reserved for "never
    /// resolved or invalidated", so a clock reading `0` is recorded as `1`.
    fn resolved_at(&self) -> u64 {
        self.now_ms().max(1)
    }

    /// Look up an entry without creating it.
    pub fn get(&self, key: &QueryKey) -> Option<Arc<StoredQuery>> {
        self.entries.pin().get(key.serialize().as_str()).cloned()
    }

    /// Look up an entry, creating an idle one if absent.
    pub fn ensure(&self, key: &QueryKey) -> Arc<StoredQuery> {
        let serialized = key.serialize();
        let pinned = self.entries.pin();
        if let Some(entry) = pinned.get(serialized.as_str()) {
            return entry.clone();
        }
        trace!(key = %serialized, "create entry");
        pinned
            .get_or_insert_with(serialized.clone(), || {
                Arc::new(StoredQuery::new(key.clone(), serialized))
            })
            .clone()
    }

    /// Keys of every stored entry, in no particular order.
    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries
            .pin()
            .values()
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries with a producer in flight.
    pub fn fetching_count(&self) -> usize {
        self.entries
            .pin()
            .values()
            .filter(|entry| entry.is_fetching())
            .count()
    }

    /// Register an observer on `key`, creating the entry if needed.
    pub fn subscribe(&self, key: &QueryKey, observer: Observer) -> Subscription {
        let entry = self.ensure(key);
        let id = entry.observers.insert(observer);
        trace!(key = %entry.serialized, id, "subscribe");
        Subscription::new(&entry, id)
    }

    /// Store `data` as a successful resolution.
    ///
    /// While a producer is in flight the status stays `Loading`; the data and
    /// timestamp are still replaced and the in-flight result lands afterwards.
    pub fn write(&self, key: &QueryKey, data: ErasedData) {
        let entry = self.ensure(key);
        let now = self.resolved_at();
        let snapshot = entry.update(|state| {
            state.view.data = Some(data);
            state.view.error = None;
            state.view.updated_at = now;
            if state.in_flight.is_none() {
                state.view.status = QueryStatus::Success;
            }
        });
        debug!(key = %entry.serialized, "write");
        self.notify(&entry, &snapshot);
    }

    /// Force `key` stale without touching its data or status.
    ///
    /// Returns `false` if the key has no entry.
    pub fn mark_stale(&self, key: &QueryKey) -> bool {
        match self.get(key) {
            Some(entry) => {
                self.mark_entry_stale(&entry);
                true
            }
            None => false,
        }
    }

    /// Mark every entry matching `prefix` stale. Returns how many matched.
    pub(crate) fn mark_prefix_stale(&self, prefix: &QueryKey, mode: PrefixMatch) -> usize {
        let prefix = Prefix::new(prefix.clone());
        let matched: Vec<Arc<StoredQuery>> = self
            .entries
            .pin()
            .values()
            .filter(|entry| mode.matches(&entry.key, &entry.serialized, &prefix))
            .cloned()
            .collect();
        for entry in &matched {
            self.mark_entry_stale(entry);
        }
        matched.len()
    }

    /// Mark every entry stale. Returns how many entries were touched.
    pub(crate) fn mark_all_stale(&self) -> usize {
        let all: Vec<Arc<StoredQuery>> = self.entries.pin().values().cloned().collect();
        for entry in &all {
            self.mark_entry_stale(entry);
        }
        all.len()
    }

    fn mark_entry_stale(&self, entry: &StoredQuery) {
        let snapshot = entry.update(|state| state.view.updated_at = 0);
        trace!(key = %entry.serialized, "mark stale");
        self.notify(entry, &snapshot);
    }

    /// Decide, atomically per entry, whether to join, serve fresh data, or
    /// start a new producer call built by `start`.
    pub(crate) fn plan_fetch(
        &self,
        entry: &StoredQuery,
        stale_time_ms: u64,
        start: impl FnOnce() -> InFlight,
    ) -> FetchPlan {
        let now = self.now_ms();
        let mut state = entry.state.lock();
        if let Some(in_flight) = &state.in_flight {
            return FetchPlan::Join(in_flight.clone());
        }
        if let Some(data) = state.fresh_data(now, stale_time_ms) {
            return FetchPlan::Fresh(data);
        }
        let in_flight = start();
        state.in_flight = Some(in_flight.clone());
        state.view.status = QueryStatus::Loading;
        let snapshot = state.view.clone();
        drop(state);

        debug!(key = %entry.serialized, "mark loading");
        self.notify(entry, &snapshot);
        FetchPlan::Started(in_flight)
    }

    /// Terminal success transition for an in-flight fetch.
    pub(crate) fn mark_success(&self, entry: &StoredQuery, data: ErasedData) {
        let now = self.resolved_at();
        let snapshot = entry.update(|state| {
            state.in_flight = None;
            state.view.data = Some(data);
            state.view.error = None;
            state.view.status = QueryStatus::Success;
            state.view.updated_at = now;
        });
        debug!(key = %entry.serialized, "mark success");
        self.notify(entry, &snapshot);
    }

    /// Terminal failure transition for an in-flight fetch. Previous data is kept.
    pub(crate) fn mark_error(&self, entry: &StoredQuery, error: QueryError) {
        let snapshot = entry.update(|state| {
            state.in_flight = None;
            state.view.error = Some(error);
            state.view.status = QueryStatus::Error;
        });
        debug!(key = %entry.serialized, "mark error");
        self.notify(entry, &snapshot);
    }

    fn notify(&self, entry: &StoredQuery, snapshot: &QueryState) {
        let observers = entry.observers.snapshot();
        if !observers.is_empty() {
            trace!(key = %entry.serialized, observers = observers.len(), "notify");
            fan_out(&entry.serialized, &observers, snapshot);
        }
    }
}
