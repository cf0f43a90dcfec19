//! Tests for fetch orchestration: deduplication, staleness and error retention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use query_sync::{
    FetchOutcome, KeyPart, ManualClock, QueryClient, QueryError, QueryKey, QueryState,
    QueryStatus, Tracer,
};

fn manual_client(stale: Duration) -> (QueryClient, ManualClock) {
    let clock = ManualClock::new(1_000);
    let client = QueryClient::builder()
        .clock(clock.clone())
        .default_stale_time(stale)
        .build();
    (client, clock)
}

// =============================================================================
// Deduplication
// =============================================================================

#[tokio::test]
async fn test_concurrent_fetches_share_one_producer_call() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let fetches = (0..5).map(|_| {
        let calls = calls.clone();
        client.fetch_query("todos", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(vec!["a", "b"])
        })
    });
    let results = join_all(fetches).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }
    assert_eq!(client.is_fetching(), 0);
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_rejection() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let fetches = (0..3).map(|_| {
        let calls = calls.clone();
        client.fetch_query::<u32, _, _>("broken", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(anyhow::anyhow!("backend unavailable"))
        })
    });
    let results = join_all(fetches).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let first = results[0].as_ref().unwrap_err();
    for result in &results {
        let err = result.as_ref().unwrap_err();
        assert!(first.ptr_eq(err));
        assert!(err.to_string().contains("backend unavailable"));
    }
}

#[tokio::test]
async fn test_dedup_ignores_stale_time_and_producer() {
    let client = QueryClient::new();
    let second_called = Arc::new(AtomicUsize::new(0));

    let first = client.fetch_query("slow", || async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(1u32)
    });
    let second = {
        let second_called = second_called.clone();
        client.fetch_query_with("slow", Duration::ZERO, move || async move {
            second_called.fetch_add(1, Ordering::SeqCst);
            Ok(2u32)
        })
    };
    let (a, b) = tokio::join!(first, second);

    assert_eq!(*a.unwrap(), 1);
    assert_eq!(*b.unwrap(), 1);
    assert_eq!(second_called.load(Ordering::SeqCst), 0);
}

#[derive(Debug, PartialEq)]
struct User {
    id: u32,
    name: String,
}

#[tokio::test]
async fn test_second_caller_joins_running_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let producer = |calls: Arc<AtomicUsize>| {
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(User {
                id: 1,
                name: "Ana".to_string(),
            })
        }
    };

    let first = client.fetch_query(("user", 1), producer(calls.clone()));
    let second = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        client.fetch_query(("user", 1), producer(calls.clone())).await
    };
    let (a, b) = tokio::join!(first, second);

    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(
        *a,
        User {
            id: 1,
            name: "Ana".to_string()
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Settlement without callers
// =============================================================================

#[tokio::test]
async fn test_dropped_caller_still_settles() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = client.subscribe("report", {
        let seen = seen.clone();
        move |state: &QueryState| seen.lock().push(state.status)
    });

    let fetch = {
        let calls = calls.clone();
        client.fetch_query("report", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok("ready")
        })
    };
    assert!(tokio::time::timeout(Duration::from_millis(1), fetch)
        .await
        .is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = client.get_query_state_as::<&str>("report").unwrap().unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data.as_deref(), Some(&"ready"));
    assert_eq!(client.is_fetching(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        *seen.lock(),
        vec![QueryStatus::Loading, QueryStatus::Success]
    );
}

#[tokio::test]
async fn test_dropped_caller_failure_is_recorded() {
    let client = QueryClient::new();

    let fetch = client.fetch_query::<u32, _, _>("report", || async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Err(anyhow::anyhow!("export failed"))
    });
    assert!(tokio::time::timeout(Duration::from_millis(1), fetch)
        .await
        .is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = client.get_query_state("report").unwrap();
    assert_eq!(state.status, QueryStatus::Error);
    assert!(state.error.unwrap().to_string().contains("export failed"));
}

#[tokio::test]
async fn test_write_during_fetch_keeps_loading_until_fetch_lands() {
    let client = QueryClient::new();

    let fetch = client.fetch_query("count", || async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(2u32)
    });
    let write = async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        client.set_query_data("count", 1u32);

        let state = client.get_query_state_as::<u32>("count").unwrap().unwrap();
        assert_eq!(state.status, QueryStatus::Loading);
        assert_eq!(state.data.as_deref(), Some(&1));
        assert!(state.updated_at > 0);
    };
    let (value, ()) = tokio::join!(fetch, write);
    assert_eq!(*value.unwrap(), 2);

    let state = client.get_query_state_as::<u32>("count").unwrap().unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data.as_deref(), Some(&2));
    assert_eq!(client.is_fetching(), 0);
}

// =============================================================================
// Staleness
// =============================================================================

#[tokio::test]
async fn test_staleness_boundary() {
    let (client, clock) = manual_client(Duration::from_millis(1_000));
    let calls = Arc::new(AtomicUsize::new(0));

    let fetch = || {
        let calls = calls.clone();
        client.fetch_query("clock", move || async move {
            Ok(calls.fetch_add(1, Ordering::SeqCst))
        })
    };

    assert_eq!(*fetch().await.unwrap(), 0);

    clock.advance(Duration::from_millis(999));
    assert_eq!(*fetch().await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_millis(1));
    assert_eq!(*fetch().await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_per_call_stale_time_overrides_default() {
    let (client, clock) = manual_client(Duration::ZERO);
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        client
            .fetch_query_with("cfg", Duration::from_secs(10), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("value")
            })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(1));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_written_value_is_fresh() {
    let (client, _) = manual_client(Duration::from_secs(60));
    client.set_query_data("count", 5u32);

    let value = client
        .fetch_query("count", || async { Ok(6u32) })
        .await
        .unwrap();
    assert_eq!(*value, 5);
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_error_keeps_previous_data_until_next_success() {
    let client = QueryClient::new();
    client
        .fetch_query("flaky", || async { Ok(1u32) })
        .await
        .unwrap();

    let err = client
        .fetch_query::<u32, _, _>("flaky", || async { Err(anyhow::anyhow!("timeout")) })
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::UserError(_)));

    let state = client.get_query_state_as::<u32>("flaky").unwrap().unwrap();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.data.as_deref(), Some(&1));
    assert!(state.error.as_ref().unwrap().ptr_eq(&err));

    client
        .fetch_query("flaky", || async { Ok(2u32) })
        .await
        .unwrap();
    let state = client.get_query_state_as::<u32>("flaky").unwrap().unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data.as_deref(), Some(&2));
    assert!(state.error.is_none());
}

#[derive(Debug)]
struct NotFound;

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not found")
    }
}

impl std::error::Error for NotFound {}

#[tokio::test]
async fn test_producer_error_can_be_downcast() {
    let client = QueryClient::new();
    let err = client
        .fetch_query::<u32, _, _>("missing", || async { Err(NotFound.into()) })
        .await
        .unwrap_err();

    assert!(err.is::<NotFound>());
    assert!(err.downcast_ref::<NotFound>().is_some());
}

// =============================================================================
// Direct reads and writes
// =============================================================================

#[tokio::test]
async fn test_set_then_get_without_producer() {
    let (client, _) = manual_client(Duration::ZERO);
    client.set_query_data(["count"], 5i32);

    let state = client.get_query_state_as::<i32>(["count"]).unwrap().unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data.as_deref(), Some(&5));
    assert!(state.updated_at > 0);
    assert_eq!(client.is_fetching(), 0);
}

#[test]
fn test_get_on_unknown_key_creates_nothing() {
    let client = QueryClient::new();
    assert!(client.get_query_state("nothing").is_none());
    assert!(client.get_query_data::<u32>("nothing").unwrap().is_none());
    assert!(client.query_keys().is_empty());
}

#[test]
fn test_equal_keys_address_one_entry() {
    let client = QueryClient::new();
    client.set_query_data(("user", 1), "Ana");
    client.set_query_data(QueryKey::new([KeyPart::from("user"), KeyPart::from(1)]), "Bo");

    assert_eq!(client.query_keys().len(), 1);
    assert_eq!(
        client.get_query_data::<&str>(query_sync::query_key!["user", 1u8]).unwrap().as_deref(),
        Some(&"Bo")
    );
}

// =============================================================================
// Tracer
// =============================================================================

#[derive(Default)]
struct Counts {
    starts: AtomicUsize,
    hits: AtomicUsize,
    joins: AtomicUsize,
    failures: AtomicUsize,
}

struct CountingTracer(Arc<Counts>);

impl Tracer for CountingTracer {
    fn on_fetch_start(&self, _key: &QueryKey) {
        self.0.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_cache_hit(&self, _key: &QueryKey) {
        self.0.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn on_dedup_join(&self, _key: &QueryKey) {
        self.0.joins.fetch_add(1, Ordering::SeqCst);
    }

    fn on_fetch_end(&self, _key: &QueryKey, outcome: FetchOutcome) {
        if matches!(outcome, FetchOutcome::Error { .. }) {
            self.0.failures.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn test_tracer_sees_start_join_and_hit() {
    let tracer = Arc::new(Counts::default());
    let client = QueryClient::builder()
        .tracer(CountingTracer(tracer.clone()))
        .default_stale_time(Duration::from_secs(60))
        .build();

    let slow = || async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(7u8)
    };
    let (a, b) = tokio::join!(client.fetch_query("t", slow), client.fetch_query("t", slow));
    a.unwrap();
    b.unwrap();
    client.fetch_query("t", slow).await.unwrap();
    client
        .fetch_query::<u8, _, _>("u", || async { Err(anyhow::anyhow!("no")) })
        .await
        .unwrap_err();

    assert_eq!(tracer.starts.load(Ordering::SeqCst), 2);
    assert_eq!(tracer.joins.load(Ordering::SeqCst), 1);
    assert_eq!(tracer.hits.load(Ordering::SeqCst), 1);
    assert_eq!(tracer.failures.load(Ordering::SeqCst), 1);
}
