//! Where dispatched updates run.
//!
//! The app hands every update to an [`Executor`] as a boxed task. The
//! executor decides when and on what the task runs; the app only cares that
//! it eventually does, since [`App::stop`](crate::App::stop) waits for it.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::warn;

/// A unit of work: processing one update.
pub type Task = BoxFuture<'static, ()>;

/// Runs update-processing tasks.
///
/// Any `Fn(Task)` closure is an executor, so custom scheduling (a per-chat
/// queue, a dedicated runtime) needs no new type:
///
/// ```ignore
/// let handle = runtime.handle().clone();
/// App::builder(bot).with_executor(move |task| { handle.spawn(task); });
/// ```
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: Task);
}

impl<F> Executor for F
where
    F: Fn(Task) + Send + Sync + 'static,
{
    fn execute(&self, task: Task) {
        self(task)
    }
}

/// Spawns every task on the current tokio runtime, without limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnExecutor;

impl Executor for SpawnExecutor {
    fn execute(&self, task: Task) {
        tokio::spawn(task);
    }
}

/// Spawns every task but lets at most `limit` run at once.
///
/// Tasks over the limit are spawned immediately and wait for a permit, so
/// receiving never blocks on slow handlers.
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl BoundedExecutor {
    /// # Panics
    ///
    /// Panics if `limit` is zero.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "BoundedExecutor limit must be at least 1");
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Tasks currently running (holding a permit).
    pub fn running(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}

impl Executor for BoundedExecutor {
    fn execute(&self, task: Task) {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // The semaphore is never closed; an error here means a bug elsewhere.
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(error = %e, "executor semaphore closed; running task unbounded");
                    return task.await;
                }
            };
            task.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_spawn_executor_runs_task() {
        let (tx, rx) = oneshot::channel();
        SpawnExecutor.execute(
            async move {
                let _ = tx.send(42);
            }
            .boxed(),
        );
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_closure_is_an_executor() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let inline = move |task: Task| {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(task);
        };

        let (tx, rx) = oneshot::channel();
        inline.execute(
            async move {
                let _ = tx.send(());
            }
            .boxed(),
        );
        rx.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bounded_executor_caps_concurrency() {
        let executor = BoundedExecutor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..10 {
            let running = running.clone();
            let peak = peak.clone();
            let done_tx = done_tx.clone();
            executor.execute(
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    let _ = done_tx.send(());
                }
                .boxed(),
            );
        }
        drop(done_tx);

        let mut finished = 0;
        while done_rx.recv().await.is_some() {
            finished += 1;
        }
        assert_eq!(finished, 10);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    #[should_panic(expected = "at least 1")]
    fn test_zero_limit_panics() {
        BoundedExecutor::new(0);
    }
}
