//! Error types for query fetching and mutations.

use std::sync::Arc;

use crate::key::QueryKey;

/// Errors surfaced by [`QueryClient`](crate::QueryClient) reads and fetches.
///
/// A producer's own failure is carried verbatim in [`QueryError::UserError`];
/// the engine never wraps, classifies, or retries it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// The producer rejected.
    ///
    /// The same `Arc` is stored on the entry and handed to every caller that
    /// joined the fetch, so all of them observe one error value.
    #[error("{0}")]
    UserError(Arc<anyhow::Error>),

    /// The cached value for a key is not of the requested type.
    ///
    /// Keys are shared by every caller of a client, so two call sites that use
    /// the same key with different value types end up here.
    #[error("cached value for {key} is not a `{expected}`")]
    TypeMismatch {
        /// The key whose value could not be downcast.
        key: QueryKey,
        /// Name of the type the caller asked for.
        expected: &'static str,
    },
}

impl QueryError {
    /// Returns a reference to the inner user error if this is a `UserError` variant.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            QueryError::UserError(e) => Some(e),
            QueryError::TypeMismatch { .. } => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `UserError` containing an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// Whether two errors are the same stored failure.
    pub fn ptr_eq(&self, other: &QueryError) -> bool {
        match (self, other) {
            (QueryError::UserError(a), QueryError::UserError(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for QueryError {
    fn from(err: anyhow::Error) -> Self {
        QueryError::UserError(Arc::new(err))
    }
}

/// Errors surfaced by [`MutationRunner`](crate::MutationRunner).
#[derive(Debug, Clone, thiserror::Error)]
pub enum MutationError {
    /// The pre-step (`on_mutate`) failed; the primary operation never ran.
    #[error("mutation pre-step failed: {0}")]
    PreStep(Arc<anyhow::Error>),

    /// The primary operation failed.
    #[error("{0}")]
    Operation(Arc<anyhow::Error>),
}

impl MutationError {
    /// The underlying failure, regardless of which step produced it.
    pub fn inner(&self) -> &Arc<anyhow::Error> {
        match self {
            MutationError::PreStep(e) | MutationError::Operation(e) => e,
        }
    }

    /// Returns `true` if the pre-step failed.
    pub fn is_pre_step(&self) -> bool {
        matches!(self, MutationError::PreStep(_))
    }

    /// Attempts to downcast the underlying failure to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.inner().downcast_ref::<E>()
    }
}
