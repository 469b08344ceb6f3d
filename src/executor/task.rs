//! Unordered execution of blocking calls and the handle type shared by all executors.

use crate::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Handle to the eventual result of a submitted task.
///
/// A handle resolves exactly once, either to the task's value or to the error
/// the task produced. Failures of one task are only visible through its own
/// handle.
#[must_use = "a task handle does nothing unless awaited"]
pub struct TaskHandle<T> {
    inner: HandleInner<T>,
}

enum HandleInner<T> {
    Blocking(JoinHandle<Result<T>>),
    Queued(oneshot::Receiver<Result<T>>),
    Failed(Option<Error>),
}

impl<T> TaskHandle<T> {
    pub(crate) const fn queued(receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            inner: HandleInner::Queued(receiver),
        }
    }

    pub(crate) const fn failed(error: Error) -> Self {
        Self {
            inner: HandleInner::Failed(Some(error)),
        }
    }

    /// Returns `true` if the handle was rejected at submission time.
    pub const fn is_rejected(&self) -> bool {
        matches!(self.inner, HandleInner::Failed(_))
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            HandleInner::Blocking(join) => Pin::new(join).poll(cx).map(|joined| match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(Error::TaskFailed("blocking task panicked".into())),
                Err(e) => Err(Error::TaskFailed(e.to_string())),
            }),
            HandleInner::Queued(receiver) => Pin::new(receiver).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(Error::TaskFailed(
                        "task was dropped by its worker before completing".into(),
                    ))
                })
            }),
            HandleInner::Failed(error) => Poll::Ready(Err(error
                .take()
                .unwrap_or_else(|| Error::TaskFailed("task handle polled after completion".into())))),
        }
    }
}

/// Runs blocking calls off the async context with no ordering guarantees.
///
/// Calls are dispatched onto tokio's blocking pool, so two submissions may run
/// concurrently and complete in any order. Use
/// [`SerializedExecutor`](super::SerializedExecutor) when order matters.
///
/// # Example
///
/// ```rust,ignore
/// use queuelite::TaskExecutor;
///
/// let executor = TaskExecutor::new("hashing");
/// let digest = executor.spawn(|| Ok(expensive_hash(&bytes))).await?;
/// ```
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    name: &'static str,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new("default")
    }
}

impl TaskExecutor {
    /// Creates an executor whose metrics are labelled with `name`.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    /// Returns the executor label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Runs `func` on the blocking pool.
    ///
    /// The returned handle fails with [`Error::NotReady`] when called outside a
    /// tokio runtime.
    pub fn spawn<F, T>(&self, func: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return TaskHandle::failed(Error::NotReady(format!(
                "task executor '{}' requires a tokio runtime",
                self.name
            )));
        };
        metrics::counter!("executor_tasks_submitted_total", "executor" => self.name).increment(1);
        TaskHandle {
            inner: HandleInner::Blocking(runtime.spawn_blocking(func)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_returns_value() {
        let executor = TaskExecutor::new("test");
        let value = executor.spawn(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_spawn_propagates_error() {
        let executor = TaskExecutor::default();
        let result: Result<()> = executor
            .spawn(|| Err(Error::InvalidInput("bad".into())))
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(ref m)) if m == "bad"));
    }

    #[tokio::test]
    async fn test_spawn_reports_panic() {
        let executor = TaskExecutor::default();
        let result: Result<()> = executor.spawn(|| std::panic::panic_any("boom")).await;
        assert!(matches!(result, Err(Error::TaskFailed(_))));
    }

    #[tokio::test]
    async fn test_spawn_runs_concurrently() {
        let executor = TaskExecutor::default();
        let slow = executor.spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
            Ok("slow")
        });
        let fast = executor.spawn(|| Ok("fast"));
        assert_eq!(fast.await.unwrap(), "fast");
        assert_eq!(slow.await.unwrap(), "slow");
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let handle = TaskExecutor::default().spawn(|| Ok(()));
        assert!(handle.is_rejected());
    }
}
