//! Best-effort completion callbacks.

use std::time::Duration;

use reqwest::Url;
use tracing::{debug, info, warn};
use unmark_types::{TaskStatus, TaskUpdate};

use crate::status::StatusStore;

pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Response body prefix kept in `webhook_error`.
const ERROR_BODY_CHARS: usize = 200;

/// Parse `raw` as an absolute http(s) URL with a host, or `None`.
pub fn validate_url(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let url = Url::parse(trimmed).ok()?;
    let scheme_ok = matches!(url.scheme(), "http" | "https");
    let host_ok = url.host_str().is_some_and(|h| !h.is_empty());
    (scheme_ok && host_ok).then_some(url)
}

/// What happened to one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// No usable URL; nothing was sent.
    Skipped,
    Delivered { code: u16 },
    Rejected { code: u16, body: String },
    Failed { error: String },
}

impl WebhookOutcome {
    /// Fields to write back onto the task. `None` for [`WebhookOutcome::Skipped`].
    pub fn to_update(&self) -> Option<TaskUpdate> {
        let (status, error) = match self {
            WebhookOutcome::Skipped => return None,
            WebhookOutcome::Delivered { code } => (format!("sent:{code}"), None),
            WebhookOutcome::Rejected { code, body } => (format!("failed:{code}"), Some(body.clone())),
            WebhookOutcome::Failed { error } => ("failed".to_owned(), Some(error.clone())),
        };
        Some(TaskUpdate {
            webhook_status: Some(status),
            webhook_error: error,
            ..Default::default()
        })
    }
}

/// POSTs the full status snapshot once, with a 10 second timeout and no
/// retries.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(WEBHOOK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("unmark/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub async fn notify(&self, url: Option<&str>, snapshot: &TaskStatus) -> WebhookOutcome {
        let Some(url) = url.and_then(validate_url) else {
            return WebhookOutcome::Skipped;
        };

        match self.client.post(url).json(snapshot).send().await {
            Ok(resp) if resp.status().is_success() => WebhookOutcome::Delivered {
                code: resp.status().as_u16(),
            },
            Ok(resp) => {
                let code = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                WebhookOutcome::Rejected {
                    code,
                    body: body.chars().take(ERROR_BODY_CHARS).collect(),
                }
            }
            Err(e) => WebhookOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    /// Notify with the current snapshot of `task_id` and record the outcome
    /// on it. Never touches `status` or `progress`.
    pub async fn deliver(&self, store: &StatusStore, task_id: &str, url: Option<&str>) {
        if url.and_then(validate_url).is_none() {
            return;
        }
        let snapshot = match store.get(task_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                debug!(task_id, "task gone before webhook, skipping");
                return;
            }
            Err(e) => {
                warn!(task_id, error = %e, "could not read snapshot for webhook");
                return;
            }
        };

        let outcome = self.notify(url, &snapshot).await;
        match &outcome {
            WebhookOutcome::Delivered { code } => info!(task_id, code, "webhook delivered"),
            other => warn!(task_id, outcome = ?other, "webhook not delivered"),
        }
        if let Some(update) = outcome.to_update() {
            if let Err(e) = store.update(task_id, update).await {
                warn!(task_id, error = %e, "could not record webhook outcome");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::FileStatusBackend;
    use crate::testing::WebhookSink;
    use chrono::Utc;
    use std::sync::Arc;
    use unmark_types::TaskState;

    #[test]
    fn url_validation() {
        assert!(validate_url("https://example.com/hook").is_some());
        assert!(validate_url("  http://127.0.0.1:9000/cb  ").is_some());
        assert!(validate_url("").is_none());
        assert!(validate_url("   ").is_none());
        assert!(validate_url("string").is_none());
        assert!(validate_url("/relative/path").is_none());
        assert!(validate_url("ftp://example.com/x").is_none());
        assert!(validate_url("mailto:ops@example.com").is_none());
    }

    #[test]
    fn outcome_maps_to_record_fields() {
        let upd = WebhookOutcome::Delivered { code: 204 }.to_update().unwrap();
        assert_eq!(upd.webhook_status.as_deref(), Some("sent:204"));
        assert!(upd.webhook_error.is_none());
        assert!(upd.status.is_none() && upd.progress.is_none());

        let upd = WebhookOutcome::Rejected {
            code: 500,
            body: "boom".into(),
        }
        .to_update()
        .unwrap();
        assert_eq!(upd.webhook_status.as_deref(), Some("failed:500"));
        assert_eq!(upd.webhook_error.as_deref(), Some("boom"));

        assert!(WebhookOutcome::Skipped.to_update().is_none());
    }

    #[tokio::test]
    async fn missing_url_is_skipped() {
        let notifier = WebhookNotifier::new().unwrap();
        let snap = TaskStatus::new("t1", Utc::now());
        assert_eq!(notifier.notify(None, &snap).await, WebhookOutcome::Skipped);
        assert_eq!(notifier.notify(Some(" "), &snap).await, WebhookOutcome::Skipped);
    }

    #[tokio::test]
    async fn posts_full_snapshot() {
        let sink = WebhookSink::start(200).await;
        let notifier = WebhookNotifier::new().unwrap();
        let snap = TaskStatus::new("t1", Utc::now());

        let outcome = notifier.notify(Some(&sink.url()), &snap).await;
        assert_eq!(outcome, WebhookOutcome::Delivered { code: 200 });

        let bodies = sink.bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["task_id"], "t1");
        assert_eq!(bodies[0]["status"], "queued");
    }

    #[tokio::test]
    async fn failure_is_recorded_without_touching_status() {
        let store = StatusStore::new(Arc::new(FileStatusBackend::in_memory(
            std::time::Duration::from_secs(60),
        )));
        store
            .create(
                "t1",
                TaskUpdate {
                    status: Some(TaskState::Completed),
                    progress: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let sink = WebhookSink::start(503).await;
        let notifier = WebhookNotifier::new().unwrap();
        notifier.deliver(&store, "t1", Some(&sink.url())).await;

        let rec = store.get("t1").await.unwrap().unwrap();
        assert_eq!(rec.status, TaskState::Completed);
        assert_eq!(rec.progress, 100);
        assert_eq!(rec.webhook_status.as_deref(), Some("failed:503"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_failure() {
        let notifier = WebhookNotifier::with_timeout(std::time::Duration::from_secs(2)).unwrap();
        let snap = TaskStatus::new("t1", Utc::now());
        let outcome = notifier.notify(Some("http://127.0.0.1:1/hook"), &snap).await;
        assert!(matches!(outcome, WebhookOutcome::Failed { .. }));
    }
}
