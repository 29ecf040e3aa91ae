//! Asynchronous execution of pipeline jobs.
//!
//! [`TaskDispatcher::connect`] selects a [`QueueBackend`] once per process:
//! a Redis list queue when the broker answers, otherwise a local worker pool.
//! The choice is never revisited.

mod broker;
mod local;

pub use broker::{BrokerConsumers, RedisBroker};
pub use local::LocalPool;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use unmark_types::ParamSet;

use crate::error::{DispatchError, PipelineError};

/// One unit of work: run the pipeline for a task whose source is already in
/// storage. Also the broker wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub task_id: String,
    pub source_key: String,
    pub params: ParamSet,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Whatever executes a [`PipelineJob`]. Implemented by the pipeline runner.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: PipelineJob) -> Result<(), PipelineError>;
}

/// Run `job` and log a failure at the process boundary. The handler has
/// already recorded it on the task.
pub(crate) async fn run_job(handler: &dyn JobHandler, job: PipelineJob) {
    let task_id = job.task_id.clone();
    if let Err(e) = handler.handle(job).await {
        error!(task_id = %task_id, error = %e, "pipeline run failed");
    }
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn enqueue(&self, job: PipelineJob) -> Result<DispatchHandle, DispatchError>;

    /// Refuse further submissions.
    fn close(&self) {}
}

/// Receipt for a submitted job.
///
/// Jobs run to completion whether or not the handle is awaited. Only the local
/// pool can be waited on; broker jobs run in whichever consumer picks them up.
#[derive(Debug)]
pub struct DispatchHandle {
    pub task_id: String,
    pub backend: &'static str,
    join: Option<JoinHandle<()>>,
}

impl DispatchHandle {
    pub(crate) fn new(task_id: String, backend: &'static str, join: Option<JoinHandle<()>>) -> Self {
        Self {
            task_id,
            backend,
            join,
        }
    }

    /// Wait for a locally executed job to finish. Returns immediately for
    /// broker jobs.
    pub async fn wait(self) {
        if let Some(join) = self.join {
            if let Err(e) = join.await {
                warn!(task_id = %self.task_id, error = %e, "pipeline worker task aborted");
            }
        }
    }
}

/// Settings for [`TaskDispatcher::connect`].
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Redis URL of the broker. `None` selects the local pool.
    pub broker_url: Option<String>,
    pub queue_key: String,
    /// Local pool size, and consumer count when consuming from the broker.
    pub concurrency: usize,
    pub connect_timeout: Duration,
    /// Start broker consumers in this process.
    pub consume: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            queue_key: "unmark:jobs".to_owned(),
            concurrency: 2,
            connect_timeout: Duration::from_secs(3),
            consume: true,
        }
    }
}

/// Process-wide dispatcher. Construct once at startup and share by `Arc`.
pub struct TaskDispatcher {
    backend: Arc<dyn QueueBackend>,
    consumers: Option<BrokerConsumers>,
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("backend", &self.backend.name())
            .field("consumers", &self.consumers.as_ref().map(|c| c.len()))
            .finish()
    }
}

impl TaskDispatcher {
    /// Probe the broker and fall back to a local pool when it is absent or
    /// unreachable. Never fails.
    pub async fn connect(cfg: &DispatchConfig, handler: Arc<dyn JobHandler>) -> Self {
        if let Some(url) = cfg.broker_url.as_deref() {
            match RedisBroker::connect(url, &cfg.queue_key, cfg.connect_timeout).await {
                Ok(broker) => {
                    let consumers = cfg
                        .consume
                        .then(|| broker.spawn_consumers(cfg.concurrency, handler));
                    info!(
                        backend = "redis",
                        queue = %cfg.queue_key,
                        consumers = consumers.as_ref().map_or(0, |c| c.len()),
                        "dispatcher ready"
                    );
                    return Self {
                        backend: Arc::new(broker),
                        consumers,
                    };
                }
                Err(e) => warn!(
                    error = %e,
                    "broker unavailable, dispatcher falling back to local worker pool"
                ),
            }
        }
        Self::local(cfg.concurrency, handler)
    }

    pub fn local(concurrency: usize, handler: Arc<dyn JobHandler>) -> Self {
        info!(backend = "local", concurrency, "dispatcher ready");
        Self {
            backend: Arc::new(LocalPool::new(concurrency, handler)),
            consumers: None,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Hand `job` off for asynchronous execution.
    pub async fn submit(&self, job: PipelineJob) -> Result<DispatchHandle, DispatchError> {
        let handle = self.backend.enqueue(job).await?;
        info!(task_id = %handle.task_id, backend = handle.backend, "job dispatched");
        Ok(handle)
    }

    /// Refuse new submissions and stop in-process broker consumers after
    /// their current job. Local jobs still waiting for a slot are dropped.
    pub async fn shutdown(&self) {
        self.backend.close();
        if let Some(consumers) = &self.consumers {
            consumers.shutdown().await;
        }
    }
}
