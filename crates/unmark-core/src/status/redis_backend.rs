use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};
use unmark_types::{TaskStatus, TaskSummary, TaskUpdate};

use super::StatusBackend;
use crate::error::StoreError;

const SCAN_BATCH: usize = 200;

/// Status records as JSON strings under `{prefix}{task_id}`, each written
/// with `SET .. EX ttl` so Redis expires them itself.
///
/// `update` is GET + SET, not a transaction: two concurrent writers to one
/// task can lose an update.
#[derive(Clone)]
pub struct RedisStatusBackend {
    conn: ConnectionManager,
    prefix: String,
    ttl_secs: u64,
}

impl RedisStatusBackend {
    /// Connect and PING within `timeout`.
    pub async fn connect(
        url: &str,
        prefix: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::ConnectTimeout(url.to_owned()))??;

        let pong: String = tokio::time::timeout(timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| StoreError::ConnectTimeout(url.to_owned()))??;
        debug!(reply = %pong, "redis status backend connected");

        Ok(Self {
            conn,
            prefix: prefix.to_owned(),
            ttl_secs: ttl.as_secs().max(1),
        })
    }

    fn key(&self, task_id: &str) -> String {
        format!("{}{}", self.prefix, task_id)
    }

    async fn write(&self, record: &TaskStatus) -> Result<(), StoreError> {
        let body = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key(&record.task_id))
            .arg(body)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn scan_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl StatusBackend for RedisStatusBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn put(&self, record: TaskStatus) -> Result<(), StoreError> {
        self.write(&record).await
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskStatus>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.key(task_id))
            .query_async(&mut conn)
            .await?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    async fn update(
        &self,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<Option<TaskStatus>, StoreError> {
        let Some(mut record) = self.get(task_id).await? else {
            debug!(task_id, "update for unknown task ignored");
            return Ok(None);
        };
        record.apply(update, Utc::now());
        self.write(&record).await?;
        Ok(Some(record))
    }

    async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(task_id))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<TaskSummary>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = self.scan_keys().await?;
        let mut summaries = Vec::with_capacity(keys.len());

        let mut conn = self.conn.clone();
        for chunk in keys.chunks(SCAN_BATCH) {
            let values: Vec<Option<String>> =
                redis::cmd("MGET").arg(chunk.to_vec()).query_async(&mut conn).await?;
            for (key, raw) in chunk.iter().zip(values) {
                // expired between SCAN and MGET
                let Some(raw) = raw else { continue };
                match serde_json::from_str::<TaskStatus>(&raw) {
                    Ok(status) => summaries.push(status.summary()),
                    Err(e) => warn!(key = %key, error = %e, "skipping unreadable status record"),
                }
            }
        }

        // keys are sorted, so ties fall back to task id order
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.truncate(limit);
        Ok(summaries)
    }

    /// Records carry their own TTL; nothing to do.
    async fn cleanup_old(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn backend() -> Option<RedisStatusBackend> {
        let url = std::env::var("UNMARK_TEST_REDIS_URL").ok()?;
        let prefix = format!("unmark:test:{}:", uuid::Uuid::new_v4().simple());
        RedisStatusBackend::connect(&url, &prefix, Duration::from_secs(60), Duration::from_secs(3))
            .await
            .ok()
    }

    #[tokio::test]
    #[ignore = "needs UNMARK_TEST_REDIS_URL"]
    async fn redis_list_recent_is_bounded_and_newest_first() {
        let Some(backend) = backend().await else { return };
        let base = Utc::now();
        for i in 0..6 {
            let mut s = TaskStatus::new(format!("t{i}"), base);
            s.updated_at = base + ChronoDuration::seconds(i);
            backend.put(s).await.unwrap();
        }
        let list = backend.list_recent(4).await.unwrap();
        assert_eq!(list.len(), 4);
        assert_eq!(list[0].task_id, "t5");
        assert!(list.windows(2).all(|w| w[0].updated_at > w[1].updated_at));
    }

    #[tokio::test]
    #[ignore = "needs UNMARK_TEST_REDIS_URL"]
    async fn redis_cleanup_is_a_noop() {
        let Some(backend) = backend().await else { return };
        let mut old = TaskStatus::new("old", Utc::now());
        old.updated_at = Utc::now() - ChronoDuration::days(30);
        backend.put(old).await.unwrap();

        assert_eq!(backend.cleanup_old().await.unwrap(), 0);
        assert!(backend.get("old").await.unwrap().is_some());
    }
}
