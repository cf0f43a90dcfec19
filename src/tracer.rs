//! Tracer trait for observing cache activity.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! fetches, writes, and invalidations. The default [`NoopTracer`] costs
//! nothing when no hooks are needed. Structured logs are emitted through
//! `tracing` independently of the tracer.
//!
//! # Example
//!
//! ```ignore
//! use query_sync::{QueryClient, QueryKey, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_fetch_start(&self, key: &QueryKey) {
//!         println!("fetch {key}");
//!     }
//! }
//!
//! let client = QueryClient::builder().tracer(PrintTracer).build();
//! ```

use crate::key::QueryKey;

/// How a fetch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The producer resolved and the value was stored.
    Success,
    /// The producer rejected.
    Error {
        /// Display form of the producer's error.
        message: String,
    },
}

/// What triggered an invalidation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidationScope {
    /// Every stored key.
    All,
    /// A key and its prefix group.
    Prefix(QueryKey),
}

/// Hooks into the query client.
///
/// All methods have default empty implementations, so you only need to override
/// the events you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; hooks run on whichever task is
/// driving the fetch.
pub trait Tracer: Send + Sync + 'static {
    /// Called when a fetch starts a new producer call.
    #[inline]
    fn on_fetch_start(&self, _key: &QueryKey) {}

    /// Called when fresh cached data was served without calling the producer.
    #[inline]
    fn on_cache_hit(&self, _key: &QueryKey) {}

    /// Called when a fetch joined a producer call that was already in flight.
    #[inline]
    fn on_dedup_join(&self, _key: &QueryKey) {}

    /// Called once per producer call, after the result is stored.
    #[inline]
    fn on_fetch_end(&self, _key: &QueryKey, _outcome: FetchOutcome) {}

    /// Called after an invalidation pass with the number of keys marked stale.
    #[inline]
    fn on_invalidate(&self, _scope: InvalidationScope, _invalidated: usize) {}

    /// Called after a direct write through `set_query_data`.
    #[inline]
    fn on_write(&self, _key: &QueryKey) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`QueryClient`](crate::QueryClient).
pub struct NoopTracer;

impl Tracer for NoopTracer {}
