use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use unmark_types::{TaskStatus, TaskSummary, TaskUpdate};

use super::StatusBackend;
use crate::error::StoreError;

/// In-process status map behind one mutex, written through to a JSON
/// snapshot after every mutation.
///
/// The snapshot is an array in insertion order so that list ties stay stable
/// across restarts.
#[derive(Debug)]
pub struct FileStatusBackend {
    path: Option<PathBuf>,
    ttl: Duration,
    inner: Mutex<Records>,
}

#[derive(Debug, Default)]
struct Records {
    by_id: HashMap<String, Slot>,
    next_seq: u64,
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    status: TaskStatus,
}

impl Records {
    fn insert(&mut self, status: TaskStatus) {
        match self.by_id.get_mut(&status.task_id) {
            Some(slot) => slot.status = status,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.by_id.insert(status.task_id.clone(), Slot { seq, status });
            }
        }
    }

    fn ordered(&self) -> Vec<&Slot> {
        let mut slots: Vec<&Slot> = self.by_id.values().collect();
        slots.sort_by_key(|s| s.seq);
        slots
    }
}

impl FileStatusBackend {
    /// Open the backend, loading `path` if it exists. A corrupt snapshot is
    /// logged and replaced on the next write.
    pub async fn open(path: impl AsRef<Path>, ttl: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut records = Records::default();

        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<TaskStatus>>(&bytes) {
                Ok(list) => {
                    for status in list {
                        records.insert(status);
                    }
                    info!(
                        path = %path.display(),
                        tasks = records.by_id.len(),
                        "loaded status snapshot"
                    );
                }
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "status snapshot unreadable, starting empty"
                ),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path: Some(path),
            ttl,
            inner: Mutex::new(records),
        })
    }

    /// A backend that never touches disk.
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            path: None,
            ttl,
            inner: Mutex::new(Records::default()),
        }
    }

    /// Write the snapshot while the caller still holds the lock. Failures are
    /// logged; the in-memory state stays authoritative.
    async fn persist(&self, records: &Records) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        if let Err(e) = write_snapshot(path, records).await {
            error!(path = %path.display(), error = %e, "failed to write status snapshot");
        }
    }
}

async fn write_snapshot(path: &Path, records: &Records) -> Result<(), StoreError> {
    let list: Vec<&TaskStatus> = records.ordered().into_iter().map(|s| &s.status).collect();
    let bytes = serde_json::to_vec_pretty(&list)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl StatusBackend for FileStatusBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn put(&self, record: TaskStatus) -> Result<(), StoreError> {
        let mut records = self.inner.lock().await;
        records.insert(record);
        self.persist(&records).await;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskStatus>, StoreError> {
        let records = self.inner.lock().await;
        Ok(records.by_id.get(task_id).map(|s| s.status.clone()))
    }

    async fn update(
        &self,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<Option<TaskStatus>, StoreError> {
        let mut records = self.inner.lock().await;
        let merged = match records.by_id.get_mut(task_id) {
            Some(slot) => {
                slot.status.apply(update, Utc::now());
                slot.status.clone()
            }
            None => {
                debug!(task_id, "update for unknown task ignored");
                return Ok(None);
            }
        };
        self.persist(&records).await;
        Ok(Some(merged))
    }

    async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut records = self.inner.lock().await;
        let removed = records.by_id.remove(task_id).is_some();
        if removed {
            self.persist(&records).await;
        }
        Ok(removed)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<TaskSummary>, StoreError> {
        let records = self.inner.lock().await;
        let mut slots = records.ordered();
        // stable sort: equal timestamps keep insertion order
        slots.sort_by(|a, b| b.status.updated_at.cmp(&a.status.updated_at));
        Ok(slots
            .into_iter()
            .take(limit)
            .map(|s| s.status.summary())
            .collect())
    }

    async fn cleanup_old(&self) -> Result<usize, StoreError> {
        let cutoff = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));

        let mut records = self.inner.lock().await;
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };
        let before = records.by_id.len();
        records.by_id.retain(|_, s| s.status.updated_at >= cutoff);
        let removed = before - records.by_id.len();
        if removed > 0 {
            info!(removed, "expired status records removed");
            self.persist(&records).await;
        }
        Ok(removed)
    }
}
