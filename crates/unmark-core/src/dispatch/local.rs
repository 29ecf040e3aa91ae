use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{DispatchHandle, JobHandler, PipelineJob, QueueBackend, run_job};
use crate::error::DispatchError;

/// Fixed-size in-process worker pool.
///
/// Every submission is accepted at once and parked on a fair semaphore, so at
/// most `size` jobs execute while the rest wait in FIFO order. Pending jobs
/// are lost if the process exits.
pub struct LocalPool {
    permits: Arc<Semaphore>,
    handler: Arc<dyn JobHandler>,
    size: usize,
}

impl LocalPool {
    pub fn new(size: usize, handler: Arc<dyn JobHandler>) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            handler,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently holding a worker slot.
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }
}

#[async_trait]
impl QueueBackend for LocalPool {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn enqueue(&self, job: PipelineJob) -> Result<DispatchHandle, DispatchError> {
        if self.permits.is_closed() {
            return Err(DispatchError::Closed);
        }
        let permits = Arc::clone(&self.permits);
        let handler = Arc::clone(&self.handler);
        let task_id = job.task_id.clone();

        let join = tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    warn!(task_id = %job.task_id, "worker pool closed before job started");
                    return;
                }
            };
            debug!(task_id = %job.task_id, "worker slot acquired");
            run_job(handler.as_ref(), job).await;
        });

        Ok(DispatchHandle::new(task_id, "local", Some(join)))
    }

    fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use tokio::sync::Notify;
    use unmark_types::ParamSet;

    struct BlockingHandler {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler for BlockingHandler {
        async fn handle(&self, _job: PipelineJob) -> Result<(), PipelineError> {
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn busy_counts_running_jobs_only() {
        let release = Arc::new(Notify::new());
        let pool = LocalPool::new(
            1,
            Arc::new(BlockingHandler {
                release: release.clone(),
            }),
        );
        let job = |id: &str| PipelineJob {
            task_id: id.to_owned(),
            source_key: String::new(),
            params: ParamSet::default(),
            webhook_url: None,
        };

        let first = pool.enqueue(job("a")).await.unwrap();
        let second = pool.enqueue(job("b")).await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(pool.busy(), 1);

        release.notify_one();
        first.wait().await;
        release.notify_one();
        second.wait().await;
        assert_eq!(pool.busy(), 0);
    }

    #[tokio::test]
    async fn closing_drops_jobs_still_waiting_for_a_slot() {
        let release = Arc::new(Notify::new());
        let pool = LocalPool::new(
            1,
            Arc::new(BlockingHandler {
                release: release.clone(),
            }),
        );
        let job = |id: &str| PipelineJob {
            task_id: id.to_owned(),
            source_key: String::new(),
            params: ParamSet::default(),
            webhook_url: None,
        };

        let running = pool.enqueue(job("a")).await.unwrap();
        let parked = pool.enqueue(job("b")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        pool.close();
        parked.wait().await;
        assert!(matches!(pool.enqueue(job("c")).await, Err(DispatchError::Closed)));

        // the running job keeps its slot and finishes normally
        release.notify_one();
        running.wait().await;
    }

    #[test]
    fn zero_size_is_raised_to_one() {
        struct Noop;
        #[async_trait]
        impl JobHandler for Noop {
            async fn handle(&self, _job: PipelineJob) -> Result<(), PipelineError> {
                Ok(())
            }
        }
        assert_eq!(LocalPool::new(0, Arc::new(Noop)).size(), 1);
    }
}
