//! Ordering and lifecycle guarantees of the executors under concurrent callers.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use futures_util::future::join_all;
use queuelite::{Error, SerializedExecutor, TaskExecutor, WorkerState};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct Journal {
    entries: Vec<(usize, usize)>,
    closed: Arc<AtomicUsize>,
}

impl WorkerState for Journal {
    fn on_stop(&mut self) -> queuelite::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// FIFO ordering
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_per_caller_order_preserved_across_tasks() {
    let executor = Arc::new(SerializedExecutor::new("journal", Journal::default()));
    executor.start().await.unwrap();

    let callers = (0..8).map(|caller| {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            for seq in 0..50 {
                executor
                    .submit(move |journal: &mut Journal| {
                        journal.entries.push((caller, seq));
                        Ok(())
                    })
                    .await
                    .unwrap();
            }
        })
    });
    for joined in join_all(callers).await {
        joined.unwrap();
    }

    let entries = executor
        .submit(|journal: &mut Journal| Ok(journal.entries.clone()))
        .await
        .unwrap();
    assert_eq!(entries.len(), 400);
    for caller in 0..8 {
        let seen: Vec<_> = entries
            .iter()
            .filter(|(c, _)| *c == caller)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }
    executor.stop().await.unwrap();
}

#[tokio::test]
async fn test_earlier_submission_finishes_first() {
    let executor = SerializedExecutor::new("slow-first", Journal::default());
    executor.start().await.unwrap();

    let slow = executor.submit(|journal: &mut Journal| {
        std::thread::sleep(Duration::from_millis(30));
        journal.entries.push((0, 0));
        Ok(journal.entries.len())
    });
    let fast = executor.submit(|journal: &mut Journal| {
        journal.entries.push((1, 0));
        Ok(journal.entries.len())
    });

    let (fast, slow) = tokio::join!(fast, slow);
    assert_eq!(slow.unwrap(), 1);
    assert_eq!(fast.unwrap(), 2);
    executor.stop().await.unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_stop_drains_queue_and_is_idempotent() {
    let closed = Arc::new(AtomicUsize::new(0));
    let executor = SerializedExecutor::new(
        "drain",
        Journal {
            closed: Arc::clone(&closed),
            ..Journal::default()
        },
    );
    executor.start().await.unwrap();

    let handles: Vec<_> = (0..20)
        .map(|i| {
            executor.submit(move |journal: &mut Journal| {
                journal.entries.push((0, i));
                Ok(())
            })
        })
        .collect();
    assert!(executor.stop().await.unwrap());
    assert!(!executor.stop().await.unwrap());
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    for handle in handles {
        handle.await.unwrap();
    }
    let count = executor
        .with_state(|journal: &mut Journal| Ok(journal.entries.len()))
        .await
        .unwrap();
    assert_eq!(count, 20);
}

#[tokio::test]
async fn test_stopped_executor_rejects_without_buffering() {
    let executor = SerializedExecutor::new("rejecting", Journal::default());

    let rejected = executor.submit(|journal: &mut Journal| {
        journal.entries.push((0, 0));
        Ok(())
    });
    assert!(rejected.is_rejected());
    assert!(matches!(rejected.await, Err(Error::NotReady(_))));

    executor.start().await.unwrap();
    let len = executor
        .submit(|journal: &mut Journal| Ok(journal.entries.len()))
        .await
        .unwrap();
    assert_eq!(len, 0);
    executor.stop().await.unwrap();
}

#[tokio::test]
async fn test_failures_are_isolated() {
    let executor = SerializedExecutor::new("isolated", Journal::default());
    executor.start().await.unwrap();

    let failing = executor.submit(|_: &mut Journal| -> queuelite::Result<()> {
        Err(Error::InvalidInput("bad".into()))
    });
    let panicking = executor.submit(|_: &mut Journal| -> queuelite::Result<()> {
        panic!("worker job panicked");
    });
    let after = executor.submit(|journal: &mut Journal| {
        journal.entries.push((9, 9));
        Ok(journal.entries.len())
    });

    assert!(matches!(failing.await, Err(Error::InvalidInput(_))));
    assert!(matches!(panicking.await, Err(Error::TaskFailed(_))));
    assert_eq!(after.await.unwrap(), 1);
    assert!(executor.is_running());
    executor.stop().await.unwrap();
}

#[tokio::test]
async fn test_scoped_stops_on_error() {
    let executor = SerializedExecutor::new("scoped", Journal::default());
    let outcome: queuelite::Result<()> = executor
        .scoped(|ex| async move {
            ex.submit(|journal: &mut Journal| {
                journal.entries.push((0, 0));
                Ok(())
            })
            .await?;
            Err(Error::InvalidInput("body failed".into()))
        })
        .await;

    assert!(matches!(outcome, Err(Error::InvalidInput(_))));
    assert!(!executor.is_running());
}

// ============================================================================
// TaskExecutor
// ============================================================================

#[tokio::test]
async fn test_task_executor_runs_blocking_calls() {
    let executor = TaskExecutor::new("blocking");
    let results = join_all((0..16u64).map(|i| {
        executor.spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            Ok(i * i)
        })
    }))
    .await;

    let values: Vec<u64> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(values, (0..16u64).map(|i| i * i).collect::<Vec<_>>());

    let failed = executor
        .spawn(|| -> queuelite::Result<()> { Err(Error::InvalidInput("nope".into())) })
        .await;
    assert!(matches!(failed, Err(Error::InvalidInput(_))));
}
