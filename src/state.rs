//! Status and point-in-time views of a cached query.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::QueryError;
use crate::key::QueryKey;

/// Type-erased cached value, shared between the store and every reader.
pub type ErasedData = Arc<dyn Any + Send + Sync>;

/// Lifecycle status of a query or mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    /// Never fetched or written.
    #[default]
    Idle,
    /// A producer (or mutation) is in flight.
    Loading,
    /// The last resolution succeeded.
    Success,
    /// The last resolution failed.
    Error,
}

/// Present-tense view of a cached query, as handed to observers.
///
/// `T` defaults to the type-erased [`ErasedData`] payload; use
/// [`QueryState::downcast`] to get a typed view.
pub struct QueryState<T: ?Sized + Send + Sync = dyn Any + Send + Sync> {
    /// Last successfully produced value.
    pub data: Option<Arc<T>>,
    /// Last failure. Cleared only by a successful resolution.
    pub error: Option<QueryError>,
    /// Current status.
    pub status: QueryStatus,
    /// Milliseconds timestamp of the last successful resolution, `0` if never
    /// resolved or invalidated since.
    pub updated_at: u64,
}

impl<T: ?Sized + Send + Sync> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            status: self.status,
            updated_at: self.updated_at,
        }
    }
}

impl<T: ?Sized + Send + Sync> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Idle,
            updated_at: 0,
        }
    }
}

impl<T: ?Sized + Send + Sync> QueryState<T> {
    /// Whether a producer is in flight.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Whether the last resolution succeeded.
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// Whether the last resolution failed.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

impl QueryState {
    /// Convert to a typed view.
    ///
    /// Returns `None` when data is present but is not a `T`.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<QueryState<T>> {
        let data = match &self.data {
            Some(data) => Some(data.clone().downcast::<T>().ok()?),
            None => None,
        };
        Some(QueryState {
            data,
            error: self.error.clone(),
            status: self.status,
            updated_at: self.updated_at,
        })
    }

    /// Like [`downcast`](Self::downcast), but reports a mismatch for `key`.
    pub(crate) fn typed<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
    ) -> Result<QueryState<T>, QueryError> {
        self.downcast().ok_or_else(|| type_mismatch::<T>(key))
    }
}

pub(crate) fn type_mismatch<T>(key: &QueryKey) -> QueryError {
    QueryError::TypeMismatch {
        key: key.clone(),
        expected: std::any::type_name::<T>(),
    }
}

pub(crate) fn downcast_data<T: Send + Sync + 'static>(
    key: &QueryKey,
    data: ErasedData,
) -> Result<Arc<T>, QueryError> {
    data.downcast::<T>().map_err(|_| type_mismatch::<T>(key))
}

impl<T: ?Sized + Send + Sync + fmt::Debug> fmt::Debug for QueryState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("data", &self.data)
            .field("error", &self.error)
            .field("status", &self.status)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}
