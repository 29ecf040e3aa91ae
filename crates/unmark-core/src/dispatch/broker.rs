use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{DispatchHandle, JobHandler, PipelineJob, QueueBackend, run_job};
use crate::error::DispatchError;

/// Seconds a consumer blocks on an empty queue before re-checking shutdown.
/// Also the longest a shutdown waits on an idle consumer.
const POLL_SECS: u64 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Redis list used as a persistent job queue.
///
/// Producers `LPUSH` onto `queue_key`. Consumers `BLMOVE` each job into
/// `{queue_key}:processing` and `LREM` it once the run returns, so a job whose
/// consumer died stays in the processing list. Nothing re-drives it.
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    queue_key: String,
}

impl RedisBroker {
    pub async fn connect(url: &str, queue_key: &str, timeout: Duration) -> Result<Self, DispatchError> {
        let client = redis::Client::open(url)?;
        let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| DispatchError::ConnectTimeout(url.to_owned()))??;
        let _: String = tokio::time::timeout(timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| DispatchError::ConnectTimeout(url.to_owned()))??;

        Ok(Self {
            client,
            conn,
            queue_key: queue_key.to_owned(),
        })
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.queue_key)
    }

    /// Start `count` consumer loops feeding `handler`.
    pub fn spawn_consumers(&self, count: usize, handler: Arc<dyn JobHandler>) -> BrokerConsumers {
        let (stop_tx, stop_rx) = watch::channel(false);
        let workers = (0..count.max(1))
            .map(|worker| {
                let consumer = Consumer {
                    worker,
                    client: self.client.clone(),
                    queue_key: self.queue_key.clone(),
                    processing_key: self.processing_key(),
                    handler: Arc::clone(&handler),
                };
                tokio::spawn(consumer.run(stop_rx.clone()))
            })
            .collect();

        BrokerConsumers {
            stop: stop_tx,
            workers: Mutex::new(workers),
            count: count.max(1),
        }
    }
}

#[async_trait]
impl QueueBackend for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, job: PipelineJob) -> Result<DispatchHandle, DispatchError> {
        let body = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        let depth: i64 = redis::cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(body)
            .query_async(&mut conn)
            .await?;
        debug!(task_id = %job.task_id, depth, "job pushed to broker");
        Ok(DispatchHandle::new(job.task_id, "redis", None))
    }
}

/// Running consumer loops of one process.
pub struct BrokerConsumers {
    stop: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    count: usize,
}

impl BrokerConsumers {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Signal every loop to stop and wait for in-flight jobs to finish. Idle
    /// loops notice within [`POLL_SECS`].
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for w in workers {
            if let Err(e) = w.await {
                warn!(error = %e, "broker consumer ended abnormally");
            }
        }
    }
}

struct Consumer {
    worker: usize,
    client: redis::Client,
    queue_key: String,
    processing_key: String,
    handler: Arc<dyn JobHandler>,
}

impl Consumer {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(worker = self.worker, queue = %self.queue_key, "broker consumer started");
        let mut conn: Option<MultiplexedConnection> = None;

        while !*stop.borrow() {
            if conn.is_none() {
                match self.client.get_multiplexed_async_connection().await {
                    Ok(c) => conn = Some(c),
                    Err(e) => {
                        warn!(worker = self.worker, error = %e, "broker connection failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            changed = stop.changed() => if changed.is_err() { break },
                        }
                        continue;
                    }
                }
            }
            let Some(c) = conn.as_mut() else { continue };

            let mut pop = redis::cmd("BLMOVE");
            pop.arg(&self.queue_key)
                .arg(&self.processing_key)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(POLL_SECS);
            // Never cancelled: a job Redis has moved must be run and acked here.
            let popped: redis::RedisResult<Option<String>> = pop.query_async(c).await;

            let raw = match popped {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker = self.worker, error = %e, "broker pop failed, reconnecting");
                    conn = None;
                    continue;
                }
            };

            match serde_json::from_str::<PipelineJob>(&raw) {
                Ok(job) => {
                    debug!(worker = self.worker, task_id = %job.task_id, "job received");
                    run_job(self.handler.as_ref(), job).await;
                }
                Err(e) => error!(worker = self.worker, error = %e, "dropping malformed job payload"),
            }

            self.ack(&mut conn, &raw).await;
        }
        info!(worker = self.worker, "broker consumer stopped");
    }

    async fn ack(&self, conn: &mut Option<MultiplexedConnection>, raw: &str) {
        let Some(c) = conn.as_mut() else { return };
        let res: redis::RedisResult<i64> = redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(raw)
            .query_async(c)
            .await;
        if let Err(e) = res {
            warn!(worker = self.worker, error = %e, "failed to remove job from processing list");
        }
    }
}
