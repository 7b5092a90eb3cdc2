use std::future::Future;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Supervised set of detached per-message tasks.
///
/// Inbound handling runs off the receive loop; the pool keeps track of those
/// tasks so shutdown can cancel whatever is still in flight.
#[derive(Clone, Default)]
pub struct TaskPool {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` in the background until it completes or the pool is cancelled.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("dingtalk: background task cancelled"),
                _ = task => {}
            }
        });
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every outstanding task and refuse new ones. Does not wait.
    pub fn cancel_all(&self) {
        self.tracker.close();
        self.cancel.cancel();
    }

    /// Wait for every task to finish or observe cancellation.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_all_stops_pending_tasks() {
        let pool = TaskPool::new();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(pool.len(), 1);

        pool.cancel_all();
        tokio::time::timeout(Duration::from_secs(1), pool.wait())
            .await
            .expect("cancelled tasks exit promptly");
        assert!(!finished.load(Ordering::SeqCst));
        assert!(pool.is_empty());
        assert!(pool.is_cancelled());
    }

    #[tokio::test]
    async fn completed_tasks_leave_the_pool() {
        let pool = TaskPool::new();
        pool.spawn(async {});
        pool.wait().await;
        assert!(pool.is_empty());
    }
}
