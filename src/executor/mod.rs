//! Executors that move blocking work off the async context.
//!
//! Two flavours are provided:
//!
//! | Executor | Ordering | Concurrency | Owns state |
//! |----------|----------|-------------|------------|
//! | [`TaskExecutor`] | none | tokio blocking pool | no |
//! | [`SerializedExecutor`] | FIFO | one dedicated thread | yes |
//!
//! Both hand back a [`TaskHandle`], a future that resolves to the task's
//! `Result`. Rejected submissions resolve immediately with an error instead of
//! being buffered.

mod lock;
mod serialized;
mod task;

pub use lock::{acquire_lock, acquire_read, acquire_write};
pub use serialized::{SerializedExecutor, WorkerState};
pub use task::{TaskExecutor, TaskHandle};
