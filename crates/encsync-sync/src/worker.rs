//! Worker lifecycle and task pools
//!
//! A [`Worker`] is a cooperatively cancellable unit of work with a
//! `before_work / work / after_work` lifecycle. A [`StagedWorker`] splits
//! its work into named stages that run in sequence. Both stop through a
//! [`CancellationToken`]; children of a worker take child tokens so that
//! stopping a parent stops everything it started.
//!
//! ## Design Decisions
//!
//! - Workers are tokio tasks, not OS threads. Parallelism inside a stage is
//!   a bounded pool ([`run_pool`]) fed by an inventory cursor.
//! - Errors never escape a worker: [`run_worker`] turns them into a
//!   [`TaskStatus`] and logs them. A stop is reported as `suspended`.

use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use encsync_cache::Cursor;
use encsync_core::domain::{StatusCounts, TaskStatus};
use futures_util::future::{self, Either, FutureExt};
use futures_util::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::SyncError;

// ============================================================================
// Worker
// ============================================================================

#[async_trait]
pub trait Worker: Send {
    fn name(&self) -> &str;

    /// Token observed at every suspension point of the worker.
    fn stopper(&self) -> &CancellationToken;

    async fn before_work(&mut self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn work(&mut self) -> Result<TaskStatus, SyncError>;

    /// Runs after `work` whatever its outcome.
    async fn after_work(&mut self, _status: TaskStatus) {}

    /// Idempotent and non-blocking.
    fn stop(&self) {
        self.stopper().cancel();
    }

    fn stopped(&self) -> bool {
        self.stopper().is_cancelled()
    }
}

/// Drives a worker through its lifecycle and returns its final status.
pub async fn run_worker<W: Worker + ?Sized>(worker: &mut W) -> TaskStatus {
    if worker.stopped() {
        return TaskStatus::Suspended;
    }

    let outcome = match worker.before_work().await {
        Ok(()) => worker.work().await,
        Err(e) => Err(e),
    };
    let status = match outcome {
        Ok(status) => status,
        Err(e) if e.is_stop() => TaskStatus::Suspended,
        Err(e) => {
            error!(worker = worker.name(), error = %e, "Worker failed");
            TaskStatus::Failed
        }
    };

    worker.after_work(status).await;
    debug!(worker = worker.name(), status = %status, "Worker done");
    status
}

// ============================================================================
// Staged worker
// ============================================================================

/// A worker whose work is a fixed sequence of named stages
#[async_trait]
pub trait StagedWorker: Worker {
    type Stage: Copy + Display + Send + Sync;

    fn stages(&self) -> Vec<Self::Stage>;

    async fn on_enter(&mut self, _stage: Self::Stage) -> Result<(), SyncError> {
        Ok(())
    }

    async fn run_stage(&mut self, stage: Self::Stage) -> Result<TaskStatus, SyncError>;

    async fn on_exit(&mut self, _stage: Self::Stage, _status: TaskStatus) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Runs every stage in order and returns the status of each stage that ran.
///
/// Stops before the next stage once the worker is stopped, and right after
/// a stage that reports `suspended`.
pub async fn run_stages<W: StagedWorker + ?Sized>(
    worker: &mut W,
) -> Result<Vec<(W::Stage, TaskStatus)>, SyncError> {
    let mut done = Vec::new();
    for stage in worker.stages() {
        if worker.stopped() {
            break;
        }
        worker.on_enter(stage).await?;
        let status = match worker.run_stage(stage).await {
            Ok(status) => status,
            Err(e) if e.is_stop() => TaskStatus::Suspended,
            Err(e) => {
                error!(worker = worker.name(), stage = %stage, error = %e, "Stage failed");
                TaskStatus::Failed
            }
        };
        worker.on_exit(stage, status).await?;
        done.push((stage, status));
        if status == TaskStatus::Suspended {
            break;
        }
    }
    Ok(done)
}

// ============================================================================
// Task pools
// ============================================================================

/// Streams the rows of an inventory cursor. The stream ends after the
/// first error.
pub fn cursor_stream<T: Send + 'static>(cursor: Cursor<T>) -> impl Stream<Item = Result<T, SyncError>> {
    stream::unfold(Some(cursor), |state| async move {
        let mut cursor = state?;
        match cursor.next().await {
            Ok(Some(item)) => Some((Ok(item), Some(cursor))),
            Ok(None) => None,
            Err(e) => Some((Err(SyncError::from(e)), None)),
        }
    })
}

/// Runs `run` over `tasks` with at most `threads` tasks in flight.
///
/// No new task starts once `token` is cancelled; running tasks are expected
/// to observe the token themselves. Returns the counts of the statuses the
/// tasks ended in, or the first error of the task source.
pub async fn run_pool<T, S, F, Fut>(
    tasks: S,
    threads: usize,
    token: &CancellationToken,
    mut run: F,
) -> Result<StatusCounts, SyncError>
where
    S: Stream<Item = Result<T, SyncError>>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = TaskStatus>,
{
    let stop = token.clone();
    let results = tasks
        .take_until(async move { stop.cancelled().await })
        .map(|item| match item {
            Ok(task) => Either::Left(run(task).map(Ok)),
            Err(e) => Either::Right(future::ready(Err(e))),
        })
        .buffer_unordered(threads.max(1));
    let mut results = std::pin::pin!(results);

    let mut counts = StatusCounts::default();
    let mut source_error = None;
    while let Some(result) = results.next().await {
        match result {
            Ok(status) => {
                counts.total += 1;
                counts.record(status);
            }
            Err(e) => {
                source_error.get_or_insert(e);
            }
        }
    }

    match source_error {
        Some(e) => Err(e),
        None => Ok(counts),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct Counter {
        token: CancellationToken,
        fail: bool,
        after: Option<TaskStatus>,
    }

    #[async_trait]
    impl Worker for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn stopper(&self) -> &CancellationToken {
            &self.token
        }

        async fn work(&mut self) -> Result<TaskStatus, SyncError> {
            if self.fail {
                return Err(SyncError::Integrity(1));
            }
            Ok(TaskStatus::Finished)
        }

        async fn after_work(&mut self, status: TaskStatus) {
            self.after = Some(status);
        }
    }

    fn counter(fail: bool) -> Counter {
        Counter {
            token: CancellationToken::new(),
            fail,
            after: None,
        }
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let mut ok = counter(false);
        assert_eq!(run_worker(&mut ok).await, TaskStatus::Finished);
        assert_eq!(ok.after, Some(TaskStatus::Finished));

        let mut failing = counter(true);
        assert_eq!(run_worker(&mut failing).await, TaskStatus::Failed);
        assert_eq!(failing.after, Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn test_stopped_worker_is_suspended() {
        let mut worker = counter(false);
        worker.stop();
        worker.stop();
        assert_eq!(run_worker(&mut worker).await, TaskStatus::Suspended);
        assert_eq!(worker.after, None);
    }

    #[tokio::test]
    async fn test_pool_counts_statuses() {
        let tasks = stream::iter((0..10).map(Ok::<_, SyncError>));
        let token = CancellationToken::new();
        let counts = run_pool(tasks, 3, &token, |i| async move {
            if i % 5 == 0 {
                TaskStatus::Skipped
            } else {
                TaskStatus::Finished
            }
        })
        .await
        .unwrap();

        assert_eq!(counts.total, 10);
        assert_eq!(counts.skipped, 2);
        assert_eq!(counts.finished, 8);
        assert_eq!(counts.aggregate(), TaskStatus::Finished);
    }

    #[tokio::test]
    async fn test_pool_stops_pulling_after_cancel() {
        let started = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let tasks = stream::iter((0..100).map(Ok::<_, SyncError>));

        let counts = run_pool(tasks, 1, &token, |i| {
            let started = Arc::clone(&started);
            let token = token.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                if i == 2 {
                    token.cancel();
                    return TaskStatus::Suspended;
                }
                TaskStatus::Finished
            }
        })
        .await
        .unwrap();

        assert!(started.load(Ordering::SeqCst) < 100);
        assert_eq!(counts.suspended, 1);
        assert_eq!(counts.aggregate(), TaskStatus::Suspended);
    }

    #[tokio::test]
    async fn test_pool_reports_source_errors() {
        let tasks = stream::iter(vec![Ok(1), Err(SyncError::Stopped), Ok(2)]);
        let token = CancellationToken::new();
        let result = run_pool(tasks, 2, &token, |_| async { TaskStatus::Finished }).await;
        assert!(matches!(result, Err(SyncError::Stopped)));
    }
}
