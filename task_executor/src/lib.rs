#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};

///
/// A cloneable handle to a tokio Runtime, threaded through every component that needs to spawn
/// background work (the daemon health monitor, the usage monitor poller, ...) rather than each
/// one spinning up its own.
///
/// Executors come in two flavors:
/// * "borrowed"
///     * Created with `Executor::new()`, or `self.to_borrowed()`.
///     * A borrowed Executor will not be shut down when all handles are dropped, and shutdown
///       methods will have no effect. Used when multiple callers share a Runtime owned elsewhere
///       (e.g. one created by `#[tokio::main]`/`#[tokio::test]`).
/// * "owned"
///     * Created with `Executor::new_owned()`.
///     * When all handles of an owned Executor are dropped, its Runtime will be shut down.
///       The explicit `shutdown` method can also be used to shut it down for all clones.
///
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// Creates an Executor for an existing tokio::Runtime (generally provided by tokio's macros).
    ///
    /// The returned Executor has a lifecycle independent of the Runtime: dropping all clones of
    /// the Executor will not cause the Runtime to be shut down.
    ///
    pub fn new() -> Executor {
        Self {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    ///
    /// Creates an Executor backed by a freshly constructed multi-threaded Runtime, which is
    /// owned by the returned Executor (and all of its clones).
    ///
    pub fn new_owned(num_worker_threads: usize) -> Result<Executor, String> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(num_worker_threads)
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to start the runtime: {e}"))?;

        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    ///
    /// Creates a clone of this Executor which is disconnected from shutdown events. See the
    /// `Executor` rustdoc.
    ///
    pub fn to_borrowed(&self) -> Executor {
        Self {
            runtime: Arc::new(Mutex::new(None)),
            handle: self.handle.clone(),
        }
    }

    /// Returns a reference to this executor's runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    ///
    /// Runs a Future on this executor as a new Task, and returns a Future handle to it. If the
    /// background Task exits abnormally, the given closure is called to recover: usually it
    /// should convert the resulting JoinError to a relevant error type.
    ///
    pub fn spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
        rescue_join_error: impl FnOnce(JoinError) -> O,
    ) -> impl Future<Output = O> {
        self.handle.spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    /// Runs a Future on this executor as a new Task, and returns a JoinHandle.
    pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
    ) -> JoinHandle<O> {
        self.handle.spawn(future)
    }

    ///
    /// Runs a Future and returns its resolved value. Should never be called from within a Future
    /// context; only from something that resembles a main method.
    ///
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    ///
    /// A blocking call to shut down the Runtime associated with this "owned" Executor. If tasks
    /// do not shut down within the given timeout, they are leaked.
    ///
    /// Has no effect for "borrowed" Executors.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let start = Instant::now();
        runtime.shutdown_timeout(timeout);
        if start.elapsed() > timeout {
            log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }

    /// Returns true if `shutdown` has been called for this Executor. Always true for borrowed
    /// Executors.
    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn borrowed_executor_runs_futures() {
        let executor = Executor::new();
        let result = executor
            .spawn(async { 1 + 1 }, |_| panic!("should not join-error"))
            .await;
        assert_eq!(result, 2);
    }

    #[test]
    fn owned_executor_can_block_on() {
        let executor = Executor::new_owned(1).unwrap();
        assert_eq!(executor.block_on(async { 21 * 2 }), 42);
        assert!(!executor.is_shutdown());
        executor.shutdown(Duration::from_secs(1));
        assert!(executor.is_shutdown());
    }

    #[test]
    fn borrowed_executor_reports_shutdown_regardless_of_owner() {
        let owned = Executor::new_owned(1).unwrap();
        let borrowed = owned.to_borrowed();
        assert!(!owned.is_shutdown());
        assert!(borrowed.is_shutdown());
        owned.shutdown(Duration::from_secs(1));
        assert!(owned.is_shutdown());
    }
}
