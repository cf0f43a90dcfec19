//! Query-Sync: a client-side cache of asynchronous query results.
//!
//! Results are addressed by structured [`QueryKey`]s and kept in a
//! [`QueryStore`] owned by a [`QueryClient`].
//!
//! # Key Features
//!
//! - **Fetch deduplication**: concurrent fetches of one key share a single producer call
//! - **Staleness**: cached data younger than the stale time is served without refetching
//! - **Prefix invalidation**: `["todos"]` marks every `["todos", ..]` key stale
//! - **Subscriptions**: observers are notified synchronously on every entry change
//! - **Mutations**: a lifecycle runner with pre-step, success, error and settled hooks
//! - **Detached settlement**: producer calls and mutation runs finish on a [`Spawner`]
//!   even when every caller drops its future
//!
//! # Example
//!
//! ```ignore
//! use query_sync::{query_key, QueryClient};
//!
//! let client = QueryClient::new();
//!
//! let _sub = client.subscribe_typed::<User, _>(("user", 1), |state| {
//!     println!("{:?} {:?}", state.status, state.data);
//! });
//!
//! let user = client
//!     .fetch_query(("user", 1), || async { api::user(1).await })
//!     .await?;
//!
//! client.set_query_data(query_key!["count"], 5u32);
//! client.invalidate("user");
//! ```
//!
//! # Logging
//!
//! Fetches, writes, invalidations and mutation runs are logged through
//! `tracing` at `debug`/`trace` level. Structured hooks are available through
//! the [`tracer`] module.

#![deny(missing_docs)]

mod clock;
mod error;
mod key;
mod mutation;
mod runtime;
mod spawn;
mod state;
mod storage;
mod subscription;
pub mod tracer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{MutationError, QueryError};
pub use key::{KeyPart, PrefixMatch, QueryKey};
pub use mutation::{Mutation, MutationRunner, MutationState};
pub use runtime::{QueryClient, QueryClientBuilder};
pub use spawn::{Spawner, TokioSpawner};
pub use state::{ErasedData, QueryState, QueryStatus};
pub use storage::{QueryStore, StoredQuery};
pub use subscription::{Observer, Subscription};
pub use tracer::{FetchOutcome, InvalidationScope, NoopTracer, Tracer};

/// Re-exported so implementors of [`Mutation`] need no direct dependency.
pub use async_trait::async_trait;
