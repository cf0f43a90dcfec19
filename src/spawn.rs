//! Executor seam for work that must finish whether or not anyone awaits it.
//!
//! Producer calls and fire-and-forget mutation runs are handed to a
//! [`Spawner`], so their terminal transitions land even after every caller has
//! dropped its future.

use futures::future::BoxFuture;
use tracing::debug;

/// Drives detached tasks to completion.
///
/// # Example
///
/// ```ignore
/// struct SmolSpawner;
///
/// impl Spawner for SmolSpawner {
///     fn spawn(&self, task: BoxFuture<'static, ()>) {
///         smol::spawn(task).detach();
///     }
/// }
///
/// let client = QueryClient::builder().spawner(SmolSpawner).build();
/// ```
pub trait Spawner: Send + Sync + 'static {
    /// Run `task` to completion in the background.
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// Spawns onto the ambient tokio runtime.
///
/// Outside a runtime the task is driven by `futures::executor::block_on` on a
/// dedicated thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => {
                debug!("no tokio runtime; driving task on a dedicated thread");
                std::thread::spawn(move || futures::executor::block_on(task));
            }
        }
    }
}
