//! FIFO, single-worker execution over a state owned by one dedicated thread.
//!
//! The worker thread is the only place the state is ever touched while the
//! executor runs. Callers hand it closures through an unbounded channel; the
//! channel's ordering is the execution order, and the worker runs one closure
//! to completion before receiving the next.
//!
//! Stopping is a drain, not a cancel: the shutdown command is queued behind
//! everything already submitted, so every accepted closure runs before the
//! worker hands its state back.

use super::lock::acquire_lock;
use super::task::TaskHandle;
use crate::{Error, Result};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// State owned by a [`SerializedExecutor`] worker.
///
/// The hooks run on the worker thread: `on_start` before the first queued
/// closure, `on_stop` after the queue has drained.
pub trait WorkerState: Send + 'static {
    /// Acquires resources the worker needs. A failure aborts `start()`.
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Releases resources after the last queued closure ran.
    fn on_stop(&mut self) -> Result<()> {
        Ok(())
    }
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;
type StartReply<S> = std::result::Result<mpsc::UnboundedSender<Command<S>>, (Error, S)>;
type StopReply<S> = (S, Result<()>);

enum Command<S> {
    Run(Job<S>),
    Shutdown(oneshot::Sender<StopReply<S>>),
}

/// A transition whose caller stopped waiting before the worker answered.
enum Pending<S> {
    Starting(oneshot::Receiver<StartReply<S>>),
    Stopping(oneshot::Receiver<StopReply<S>>),
}

enum Lifecycle<S> {
    /// Parked state; `None` only while a transition is in flight or after the
    /// worker was lost.
    Stopped(Option<S>),
    Running {
        sender: mpsc::UnboundedSender<Command<S>>,
        refs: usize,
    },
    /// Resolved by the next transition before it does anything else.
    Settling(Pending<S>),
}

/// Holds the worker's pending answer; if dropped unanswered it parks the
/// receiver in the lifecycle so the state can still be recovered.
struct Unsettled<'a, S, T> {
    lifecycle: &'a Mutex<Lifecycle<S>>,
    receiver: Option<oneshot::Receiver<T>>,
    park: fn(oneshot::Receiver<T>) -> Pending<S>,
}

impl<'a, S, T> Unsettled<'a, S, T> {
    const fn new(
        lifecycle: &'a Mutex<Lifecycle<S>>,
        receiver: oneshot::Receiver<T>,
        park: fn(oneshot::Receiver<T>) -> Pending<S>,
    ) -> Self {
        Self {
            lifecycle,
            receiver: Some(receiver),
            park,
        }
    }

    /// The worker's answer, or `None` if the worker went away without one.
    async fn answer(mut self) -> Option<T> {
        let answer = self.receiver.as_mut()?.await.ok();
        self.receiver = None;
        answer
    }
}

impl<S, T> Drop for Unsettled<'_, S, T> {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            *acquire_lock(self.lifecycle) = Lifecycle::Settling((self.park)(receiver));
        }
    }
}

/// Executes submitted closures one at a time, in submission order, on a single
/// dedicated worker thread that owns `S`.
///
/// # Lifecycle
///
/// `start()` and `stop()` are reference counted so several owners can share
/// one executor: the worker is spawned on the first `start()` and drained and
/// joined on the matching last `stop()`. A `stop()` with no outstanding
/// `start()` is a no-op.
///
/// # Cancellation
///
/// Dropping a `start()` or `stop()` future before it resolves does not lose
/// the state: the next transition waits for the worker's answer first, and
/// shuts down a worker whose start nobody is waiting for any more.
///
/// # Failure isolation
///
/// An error returned by a closure, or a panic inside it, is delivered only to
/// that closure's [`TaskHandle`]. The worker keeps draining the queue.
///
/// # Example
///
/// ```rust,ignore
/// use queuelite::{SerializedExecutor, WorkerState};
///
/// #[derive(Default)]
/// struct Counter(u64);
/// impl WorkerState for Counter {}
///
/// let executor = SerializedExecutor::new("counter", Counter::default());
/// executor.start().await?;
/// let first = executor.submit(|c| { c.0 += 1; Ok(c.0) });
/// let second = executor.submit(|c| { c.0 += 1; Ok(c.0) });
/// assert_eq!((first.await?, second.await?), (1, 2));
/// executor.stop().await?;
/// ```
pub struct SerializedExecutor<S: WorkerState> {
    name: Arc<str>,
    lifecycle: Mutex<Lifecycle<S>>,
    /// Serializes start/stop transitions against each other.
    transition: tokio::sync::Mutex<()>,
}

impl<S: WorkerState> fmt::Debug for SerializedExecutor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedExecutor")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("refs", &self.refs())
            .finish()
    }
}

impl<S: WorkerState> SerializedExecutor<S> {
    /// Creates a stopped executor that will run closures against `state`.
    pub fn new(name: impl Into<Arc<str>>, state: S) -> Self {
        Self {
            name: name.into(),
            lifecycle: Mutex::new(Lifecycle::Stopped(Some(state))),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the executor name used in logs, metrics, and the worker thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` while a worker is accepting submissions.
    pub fn is_running(&self) -> bool {
        matches!(*acquire_lock(&self.lifecycle), Lifecycle::Running { .. })
    }

    /// Returns the number of outstanding `start()` calls.
    pub fn refs(&self) -> usize {
        match *acquire_lock(&self.lifecycle) {
            Lifecycle::Running { refs, .. } => refs,
            Lifecycle::Stopped(_) | Lifecycle::Settling(_) => 0,
        }
    }

    /// Starts the worker if it is not running and takes one reference.
    ///
    /// Returns `Ok(true)` when a worker was spawned by this call.
    ///
    /// # Errors
    ///
    /// Returns the error from [`WorkerState::on_start`] (the state is parked
    /// again and a later `start()` may retry), or [`Error::ResourceError`] if
    /// the worker thread cannot be spawned.
    pub async fn start(&self) -> Result<bool> {
        self.acquire(1).await
    }

    /// Releases one reference; the last release drains the queue and joins the worker.
    ///
    /// Returns `Ok(true)` when the worker was stopped by this call. Calling
    /// `stop()` on a stopped executor returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns the error from [`WorkerState::on_stop`]. The worker is stopped
    /// either way.
    pub async fn stop(&self) -> Result<bool> {
        let _transition = self.transition.lock().await;
        self.settle().await?;
        let sender = {
            let mut lifecycle = acquire_lock(&self.lifecycle);
            if let Lifecycle::Running { refs, .. } = &mut *lifecycle {
                if *refs > 1 {
                    *refs -= 1;
                    trace!(executor = %self.name, refs = *refs, "released executor reference");
                    return Ok(false);
                }
            }
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped(None)) {
                Lifecycle::Running { sender, .. } => sender,
                other => {
                    *lifecycle = other;
                    return Ok(false);
                },
            }
        };
        self.shutdown_worker(sender).await.map(|()| true)
    }

    /// Stops the worker regardless of how many references are outstanding.
    ///
    /// Returns the number of references that were held, so a caller can
    /// restore them with [`SerializedExecutor::resume`].
    pub async fn halt(&self) -> Result<usize> {
        let _transition = self.transition.lock().await;
        self.settle().await?;
        let (sender, refs) = {
            let mut lifecycle = acquire_lock(&self.lifecycle);
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped(None)) {
                Lifecycle::Running { sender, refs } => (sender, refs),
                other => {
                    *lifecycle = other;
                    return Ok(0);
                },
            }
        };
        self.shutdown_worker(sender).await.map(|()| refs)
    }

    /// Starts the worker holding `refs` references. `resume(0)` does nothing.
    pub async fn resume(&self, refs: usize) -> Result<bool> {
        if refs == 0 {
            return Ok(false);
        }
        self.acquire(refs).await
    }

    /// Queues `func` behind every previously submitted closure.
    ///
    /// The handle resolves to [`Error::NotReady`] if the executor is stopped;
    /// nothing is buffered for a later `start()`.
    pub fn submit<F, T>(&self, func: F) -> TaskHandle<T>
    where
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let name = Arc::clone(&self.name);
        let job: Job<S> = Box::new(move |state: &mut S| {
            let start = Instant::now();
            let result = func(state);
            metrics::histogram!("executor_task_duration_ms", "executor" => name.to_string())
                .record(start.elapsed().as_secs_f64() * 1000.0);
            // The caller may have dropped its handle; the work still counts.
            let _ = reply.send(result);
        });

        let lifecycle = acquire_lock(&self.lifecycle);
        match &*lifecycle {
            Lifecycle::Running { sender, .. } => {
                if sender.send(Command::Run(job)).is_err() {
                    return TaskHandle::failed(Error::ResourceClosed(format!(
                        "worker for '{}' exited unexpectedly",
                        self.name
                    )));
                }
                metrics::counter!("executor_tasks_submitted_total", "executor" => self.name.to_string())
                    .increment(1);
                TaskHandle::queued(receiver)
            },
            Lifecycle::Stopped(_) | Lifecycle::Settling(_) => {
                metrics::counter!("executor_tasks_rejected_total", "executor" => self.name.to_string())
                    .increment(1);
                TaskHandle::failed(Error::NotReady(format!(
                    "executor '{}' is stopped",
                    self.name
                )))
            },
        }
    }

    /// Runs `func` against the state wherever it currently lives.
    ///
    /// While running this is an ordinary queued submission; while stopped the
    /// closure runs directly against the parked state.
    pub async fn with_state<F, T>(&self, func: F) -> Result<T>
    where
        F: FnOnce(&mut S) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _transition = self.transition.lock().await;
        self.settle().await?;
        {
            let mut lifecycle = acquire_lock(&self.lifecycle);
            if let Lifecycle::Stopped(parked) = &mut *lifecycle {
                let state = parked.as_mut().ok_or_else(|| self.lost_state())?;
                return func(state);
            }
        }
        self.submit(func).await
    }

    /// Starts the executor, runs `body`, and stops it again even if `body` failed.
    ///
    /// The body's error takes precedence over an error from stopping.
    pub async fn scoped<'a, F, Fut, R>(&'a self, body: F) -> Result<R>
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.start().await?;
        let outcome = body(self).await;
        let stopped = self.stop().await;
        let value = outcome?;
        stopped?;
        Ok(value)
    }

    async fn acquire(&self, count: usize) -> Result<bool> {
        let _transition = self.transition.lock().await;
        self.settle().await?;
        let state = {
            let mut lifecycle = acquire_lock(&self.lifecycle);
            match &mut *lifecycle {
                Lifecycle::Running { refs, .. } => {
                    *refs += count;
                    trace!(executor = %self.name, refs = *refs, "took executor reference");
                    return Ok(false);
                },
                Lifecycle::Stopped(parked) => parked.take().ok_or_else(|| self.lost_state())?,
                Lifecycle::Settling(_) => return Err(self.lost_state()),
            }
        };

        let (ready, ready_rx) = oneshot::channel();
        let name = Arc::clone(&self.name);
        std::thread::Builder::new()
            .name(format!("{}-worker", self.name))
            .spawn(move || run_worker(&name, state, ready))
            .map_err(|e| Error::resource("spawn_worker", e))?;

        match Unsettled::new(&self.lifecycle, ready_rx, Pending::Starting).answer().await {
            Some(Ok(sender)) => {
                *acquire_lock(&self.lifecycle) = Lifecycle::Running {
                    sender,
                    refs: count,
                };
                info!(executor = %self.name, "executor started");
                Ok(true)
            },
            Some(Err((error, state))) => {
                *acquire_lock(&self.lifecycle) = Lifecycle::Stopped(Some(state));
                error!(executor = %self.name, error = %error, "executor failed to start");
                Err(error)
            },
            None => Err(Error::TaskFailed(format!(
                "worker for '{}' exited during startup",
                self.name
            ))),
        }
    }

    async fn shutdown_worker(&self, sender: mpsc::UnboundedSender<Command<S>>) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        sender
            .send(Command::Shutdown(reply))
            .map_err(|_| Error::ResourceClosed(format!("worker for '{}' already exited", self.name)))?;
        drop(sender);

        let (state, closed) = Unsettled::new(&self.lifecycle, reply_rx, Pending::Stopping)
            .answer()
            .await
            .ok_or_else(|| {
                Error::TaskFailed(format!("worker for '{}' exited during shutdown", self.name))
            })?;
        *acquire_lock(&self.lifecycle) = Lifecycle::Stopped(Some(state));
        info!(executor = %self.name, "executor stopped");
        closed
    }

    /// Finishes a start or stop whose caller dropped it mid-flight.
    ///
    /// A worker that came up for an abandoned start holds no references, so
    /// it is shut down again and its state parked.
    async fn settle(&self) -> Result<()> {
        let pending = {
            let mut lifecycle = acquire_lock(&self.lifecycle);
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped(None)) {
                Lifecycle::Settling(pending) => pending,
                other => {
                    *lifecycle = other;
                    return Ok(());
                },
            }
        };

        let stopping = match pending {
            Pending::Starting(ready) => {
                match Unsettled::new(&self.lifecycle, ready, Pending::Starting).answer().await {
                    Some(Ok(sender)) => {
                        debug!(executor = %self.name, "stopping worker of an abandoned start");
                        let (reply, reply_rx) = oneshot::channel();
                        sender
                            .send(Command::Shutdown(reply))
                            .map_err(|_| self.lost_state())?;
                        reply_rx
                    },
                    Some(Err((_, state))) => {
                        *acquire_lock(&self.lifecycle) = Lifecycle::Stopped(Some(state));
                        return Ok(());
                    },
                    None => return Err(self.lost_state()),
                }
            },
            Pending::Stopping(reply) => reply,
        };

        let (state, closed) = Unsettled::new(&self.lifecycle, stopping, Pending::Stopping)
            .answer()
            .await
            .ok_or_else(|| self.lost_state())?;
        *acquire_lock(&self.lifecycle) = Lifecycle::Stopped(Some(state));
        if let Err(e) = closed {
            warn!(executor = %self.name, error = %e, "abandoned worker did not stop cleanly");
        }
        Ok(())
    }

    fn lost_state(&self) -> Error {
        Error::ResourceClosed(format!("executor '{}' lost its worker state", self.name))
    }
}

fn run_worker<S: WorkerState>(name: &str, mut state: S, ready: oneshot::Sender<StartReply<S>>) {
    if let Err(error) = state.on_start() {
        let _ = ready.send(Err((error, state)));
        return;
    }
    let (sender, mut receiver) = mpsc::unbounded_channel();
    if ready.send(Ok(sender)).is_err() {
        let _ = state.on_stop();
        return;
    }
    debug!(executor = name, "worker loop entered");

    while let Some(command) = receiver.blocking_recv() {
        match command {
            Command::Run(job) => {
                if panic::catch_unwind(AssertUnwindSafe(|| job(&mut state))).is_err() {
                    metrics::counter!("executor_task_panics_total", "executor" => name.to_string())
                        .increment(1);
                    error!(executor = name, "queued task panicked; worker continues");
                }
            },
            Command::Shutdown(reply) => {
                let closed = state.on_stop();
                let _ = reply.send((state, closed));
                debug!(executor = name, "worker loop exited");
                return;
            },
        }
    }

    // Every sender is gone: the executor itself was dropped while running.
    if let Err(error) = state.on_stop() {
        error!(executor = name, error = %error, "worker cleanup failed after executor drop");
    }
}
