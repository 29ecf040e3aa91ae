//! Per-task status persistence.
//!
//! [`StatusStore`] is a cheap-to-clone handle over one [`StatusBackend`],
//! picked once by [`StatusStore::connect`]: Redis with server-side expiry when
//! reachable, otherwise an in-process map snapshotted to a JSON file.

mod file_backend;
mod redis_backend;

pub use self::file_backend::FileStatusBackend;
pub use self::redis_backend::RedisStatusBackend;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use unmark_types::{TaskStatus, TaskSummary, TaskUpdate};

use crate::error::StoreError;

/// Storage contract shared by both backends.
#[async_trait]
pub trait StatusBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Insert `record`, replacing any previous record with the same id.
    async fn put(&self, record: TaskStatus) -> Result<(), StoreError>;

    async fn get(&self, task_id: &str) -> Result<Option<TaskStatus>, StoreError>;

    /// Read-merge-write. Returns the merged record, or `None` when the task
    /// is unknown.
    async fn update(
        &self,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<Option<TaskStatus>, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, task_id: &str) -> Result<bool, StoreError>;

    /// At most `limit` summaries, most recently updated first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<TaskSummary>, StoreError>;

    /// Drop records past their TTL. Returns how many were removed.
    async fn cleanup_old(&self) -> Result<usize, StoreError>;
}

/// Settings for [`StatusStore::connect`].
#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// Redis URL. `None` goes straight to the file backend.
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub ttl: Duration,
    pub snapshot_path: PathBuf,
    pub connect_timeout: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "unmark:status:".to_owned(),
            ttl: Duration::from_secs(72 * 3600),
            snapshot_path: PathBuf::from("data/status.json"),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Shared handle to the process-wide status backend.
#[derive(Clone)]
pub struct StatusStore {
    backend: Arc<dyn StatusBackend>,
}

impl std::fmt::Debug for StatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl StatusStore {
    pub fn new(backend: Arc<dyn StatusBackend>) -> Self {
        Self { backend }
    }

    /// Pick the backend for this process. Redis is tried first when a URL is
    /// configured; an unreachable Redis degrades to the file backend.
    pub async fn connect(cfg: &StatusConfig) -> Result<Self, StoreError> {
        if let Some(url) = cfg.redis_url.as_deref() {
            match RedisStatusBackend::connect(url, &cfg.key_prefix, cfg.ttl, cfg.connect_timeout)
                .await
            {
                Ok(backend) => {
                    info!(backend = "redis", "status store ready");
                    return Ok(Self::new(Arc::new(backend)));
                }
                Err(e) => warn!(
                    error = %e,
                    "redis unavailable, status store falling back to local snapshot file"
                ),
            }
        }

        let backend = FileStatusBackend::open(&cfg.snapshot_path, cfg.ttl).await?;
        info!(
            backend = "file",
            path = %cfg.snapshot_path.display(),
            "status store ready"
        );
        Ok(Self::new(Arc::new(backend)))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Create a fresh `queued` record with `initial` merged over it.
    pub async fn create(&self, task_id: &str, initial: TaskUpdate) -> Result<TaskStatus, StoreError> {
        let now = Utc::now();
        let mut record = TaskStatus::new(task_id, now);
        record.apply(initial, now);
        self.backend.put(record.clone()).await?;
        Ok(record)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<TaskStatus>, StoreError> {
        self.backend.get(task_id).await
    }

    pub async fn update(
        &self,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<Option<TaskStatus>, StoreError> {
        self.backend.update(task_id, update).await
    }

    pub async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        self.backend.delete(task_id).await
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<TaskSummary>, StoreError> {
        self.backend.list_recent(limit).await
    }

    pub async fn cleanup_old(&self) -> Result<usize, StoreError> {
        self.backend.cleanup_old().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn unreachable_redis_degrades_to_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StatusConfig {
            redis_url: Some("redis://127.0.0.1:1/".to_owned()),
            snapshot_path: dir.path().join("status.json"),
            connect_timeout: Duration::from_millis(500),
            ..StatusConfig::default()
        };
        let store = StatusStore::connect(&cfg).await.unwrap();
        assert_eq!(store.backend_name(), "file");
        assert!(logs_contain("falling back to local snapshot file"));
    }

    #[tokio::test]
    async fn no_redis_url_uses_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StatusConfig {
            snapshot_path: dir.path().join("status.json"),
            ..StatusConfig::default()
        };
        let store = StatusStore::connect(&cfg).await.unwrap();
        assert_eq!(store.backend_name(), "file");

        let created = store.create("a", TaskUpdate::default()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(created));
    }
}
