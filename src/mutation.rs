//! Mutation lifecycle runner.
//!
//! A [`Mutation`] describes one write operation and its lifecycle hooks. A
//! [`MutationRunner`] is an unkeyed instance of it: it runs the hooks in order
//! and exposes the status of the latest run. Fire-and-forget runs are handed
//! to a [`Spawner`] and settle even when the caller goes away.
//!
//! Mutations do not touch the query store on their own; hooks that want
//! optimistic updates call
//! [`QueryClient::set_query_data`](crate::QueryClient::set_query_data) and
//! friends.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::MutationError;
use crate::spawn::{Spawner, TokioSpawner};
use crate::state::QueryStatus;

/// A write operation with optional lifecycle hooks.
///
/// Hooks run strictly in this order for every call to
/// [`MutationRunner::mutate`] or [`MutationRunner::mutate_async`]:
///
/// 1. [`on_mutate`](Self::on_mutate) - its `Ok` value becomes the context
///    passed to every later hook. If it fails, [`mutate`](Self::mutate) never
///    runs and the error hooks see no context.
/// 2. [`mutate`](Self::mutate)
/// 3. [`on_success`](Self::on_success) or [`on_error`](Self::on_error)
/// 4. [`on_settled`](Self::on_settled), exactly once, always last.
///
/// # Example
///
/// ```ignore
/// struct Rename { client: QueryClient }
///
/// #[async_trait]
/// impl Mutation for Rename {
///     type Input = (u32, String);
///     type Output = User;
///     type Context = Option<Arc<User>>;
///
///     async fn on_mutate(&self, (id, name): &Self::Input) -> anyhow::Result<Option<Self::Context>> {
///         let previous = self.client.get_query_data::<User>(("user", *id))?;
///         self.client.set_query_data(("user", *id), User { name: name.clone(), ..Default::default() });
///         Ok(Some(previous))
///     }
///
///     async fn mutate(&self, (id, name): &Self::Input) -> anyhow::Result<User> {
///         api::rename(*id, name).await
///     }
///
///     async fn on_error(&self, _: &MutationError, (id, _): &Self::Input, previous: Option<&Self::Context>) {
///         if let Some(Some(user)) = previous {
///             self.client.set_query_data(("user", *id), (**user).clone());
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Mutation: Send + Sync + 'static {
    /// Caller-supplied input for one run.
    type Input: Send + Sync + 'static;
    /// Result of the primary operation.
    type Output: Send + Sync + 'static;
    /// Value produced by the pre-step and threaded through later hooks.
    type Context: Send + Sync + 'static;

    /// The primary operation.
    async fn mutate(&self, input: &Self::Input) -> anyhow::Result<Self::Output>;

    /// Pre-step, run before the primary operation.
    #[inline]
    async fn on_mutate(&self, _input: &Self::Input) -> anyhow::Result<Option<Self::Context>> {
        Ok(None)
    }

    /// Called after a successful primary operation.
    #[inline]
    async fn on_success(
        &self,
        _data: &Self::Output,
        _input: &Self::Input,
        _context: Option<&Self::Context>,
    ) {
    }

    /// Called after a failed pre-step or primary operation.
    #[inline]
    async fn on_error(
        &self,
        _error: &MutationError,
        _input: &Self::Input,
        _context: Option<&Self::Context>,
    ) {
    }

    /// Called once per run, after `on_success` or `on_error`.
    #[inline]
    async fn on_settled(
        &self,
        _data: Option<&Self::Output>,
        _error: Option<&MutationError>,
        _input: &Self::Input,
        _context: Option<&Self::Context>,
    ) {
    }
}

/// Snapshot of a [`MutationRunner`].
#[derive(Debug)]
pub struct MutationState<T> {
    /// Status of the latest run.
    pub status: QueryStatus,
    /// Output of the latest successful run.
    pub data: Option<Arc<T>>,
    /// Failure of the latest run. Cleared when a new run starts.
    pub error: Option<MutationError>,
}

impl<T> Clone for MutationState<T> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T> Default for MutationState<T> {
    fn default() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
        }
    }
}

/// One mutation instance.
///
/// Cloning yields another handle to the same instance.
pub struct MutationRunner<M: Mutation> {
    mutation: Arc<M>,
    state: Arc<Mutex<MutationState<M::Output>>>,
    spawner: Arc<dyn Spawner>,
}

impl<M: Mutation> Clone for MutationRunner<M> {
    fn clone(&self) -> Self {
        Self {
            mutation: self.mutation.clone(),
            state: self.state.clone(),
            spawner: self.spawner.clone(),
        }
    }
}

impl<M: Mutation> MutationRunner<M> {
    /// Create an idle instance of `mutation` on the [`TokioSpawner`].
    pub fn new(mutation: M) -> Self {
        Self::with_spawner(mutation, Arc::new(TokioSpawner))
    }

    /// Create an idle instance of `mutation` whose fire-and-forget runs go to
    /// `spawner`.
    pub fn with_spawner(mutation: M, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            mutation: Arc::new(mutation),
            state: Arc::new(Mutex::new(MutationState::default())),
            spawner,
        }
    }

    /// The mutation this instance runs.
    pub fn mutation(&self) -> &M {
        &self.mutation
    }

    /// Start a run and return immediately.
    ///
    /// The instance is `Loading` when this returns. The run itself goes to the
    /// spawner; its outcome is reported only through [`state`](Self::state)
    /// and the hooks.
    pub fn mutate(&self, input: M::Input) {
        self.begin();
        let runner = self.clone();
        self.spawner.spawn(
            async move {
                let _ = runner.run(input).await;
            }
            .boxed(),
        );
    }

    /// Run the mutation on the calling task and return its outcome.
    ///
    /// Dropping the returned future stops the run at its next await point;
    /// use [`mutate`](Self::mutate) when the run must settle regardless.
    ///
    /// # Errors
    ///
    /// - `MutationError::PreStep` - `on_mutate` failed; `mutate` was not called
    /// - `MutationError::Operation` - `mutate` failed
    pub async fn mutate_async(&self, input: M::Input) -> Result<Arc<M::Output>, MutationError> {
        self.begin();
        self.run(input).await
    }

    fn begin(&self) {
        let mut state = self.state.lock();
        state.status = QueryStatus::Loading;
        state.error = None;
    }

    async fn run(&self, input: M::Input) -> Result<Arc<M::Output>, MutationError> {
        debug!(mutation = std::any::type_name::<M>(), "mutation: start");

        let context = match self.mutation.on_mutate(&input).await {
            Ok(context) => context,
            Err(err) => {
                let error = MutationError::PreStep(Arc::new(err));
                self.set_error(&error);
                debug!(mutation = std::any::type_name::<M>(), error = %error, "mutation: pre-step failed");
                self.mutation.on_error(&error, &input, None).await;
                self.mutation.on_settled(None, Some(&error), &input, None).await;
                return Err(error);
            }
        };

        match self.mutation.mutate(&input).await {
            Ok(output) => {
                let data = Arc::new(output);
                {
                    let mut state = self.state.lock();
                    state.status = QueryStatus::Success;
                    state.data = Some(data.clone());
                }
                debug!(mutation = std::any::type_name::<M>(), "mutation: ok");
                self.mutation
                    .on_success(&data, &input, context.as_ref())
                    .await;
                self.mutation
                    .on_settled(Some(&data), None, &input, context.as_ref())
                    .await;
                Ok(data)
            }
            Err(err) => {
                let error = MutationError::Operation(Arc::new(err));
                self.set_error(&error);
                debug!(mutation = std::any::type_name::<M>(), error = %error, "mutation: err");
                self.mutation
                    .on_error(&error, &input, context.as_ref())
                    .await;
                self.mutation
                    .on_settled(None, Some(&error), &input, context.as_ref())
                    .await;
                Err(error)
            }
        }
    }

    fn set_error(&self, error: &MutationError) {
        let mut state = self.state.lock();
        state.status = QueryStatus::Error;
        state.error = Some(error.clone());
    }

    /// Return to idle with no data or error.
    ///
    /// A run already in progress is not cancelled; its terminal transition
    /// still lands on this instance.
    pub fn reset(&self) {
        *self.state.lock() = MutationState::default();
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> MutationState<M::Output> {
        self.state.lock().clone()
    }

    /// Status of the latest run.
    pub fn status(&self) -> QueryStatus {
        self.state.lock().status
    }

    /// Whether a run is in progress.
    pub fn is_loading(&self) -> bool {
        self.status() == QueryStatus::Loading
    }

    /// Whether the latest run succeeded.
    pub fn is_success(&self) -> bool {
        self.status() == QueryStatus::Success
    }

    /// Whether the latest run failed.
    pub fn is_error(&self) -> bool {
        self.status() == QueryStatus::Error
    }
}
