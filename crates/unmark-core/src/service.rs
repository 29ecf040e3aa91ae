//! Submit / query / list / delete, as exposed to the HTTP layer.

use std::sync::{Arc, Mutex, MutexGuard};

use tempfile::TempPath;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};
use unmark_types::{
    ParamDefaults, ParamOverrides, TaskState, TaskStatus, TaskSummary, TaskUpdate, resolve,
};
use uuid::Uuid;

use crate::capability::ObjectStorage;
use crate::dispatch::{PipelineJob, TaskDispatcher};
use crate::error::ServiceError;
use crate::pipeline::{input_key, output_key};
use crate::status::StatusStore;
use crate::webhook::{WebhookNotifier, validate_url};

pub const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub defaults: ParamDefaults,
    /// Days after deletion before storage lifecycle rules may drop artifacts.
    pub expire_after_days: u32,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            defaults: ParamDefaults::default(),
            expire_after_days: 7,
        }
    }
}

/// A validated upload waiting to be handed to storage.
#[derive(Debug)]
pub struct Submission {
    /// Local copy of the upload, removed once it reaches storage.
    pub source: TempPath,
    pub overrides: ParamOverrides,
    pub webhook_url: Option<String>,
}

/// Entry point for everything outside the pipeline. Cheap to clone.
#[derive(Clone)]
pub struct TaskService {
    store: StatusStore,
    storage: Arc<dyn ObjectStorage>,
    dispatcher: Arc<TaskDispatcher>,
    notifier: WebhookNotifier,
    options: ServiceOptions,
    /// Background upload-then-dispatch work, drained by [`TaskService::shutdown`].
    intake: Arc<Mutex<JoinSet<()>>>,
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("store", &self.store)
            .field("dispatcher", &self.dispatcher)
            .field("options", &self.options)
            .finish()
    }
}

impl TaskService {
    pub fn new(
        store: StatusStore,
        storage: Arc<dyn ObjectStorage>,
        dispatcher: Arc<TaskDispatcher>,
        notifier: WebhookNotifier,
        options: ServiceOptions,
    ) -> Self {
        Self {
            store,
            storage,
            dispatcher,
            notifier,
            options,
            intake: Arc::default(),
        }
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    /// Create the task record and return it in `queued` state. The upload to
    /// storage and the dispatch continue in the background.
    pub async fn submit(&self, submission: Submission) -> Result<TaskStatus, ServiceError> {
        let task_id = Uuid::new_v4().to_string();
        let params = resolve(&submission.overrides, &self.options.defaults);

        let webhook_url = submission.webhook_url.and_then(|raw| {
            if validate_url(&raw).is_some() {
                Some(raw.trim().to_owned())
            } else {
                if !raw.trim().is_empty() {
                    warn!(task_id = %task_id, url = %raw, "ignoring invalid webhook url");
                }
                None
            }
        });

        let record = self
            .store
            .create(
                &task_id,
                TaskUpdate {
                    params_effective: Some(params),
                    message: Some("uploading source".to_owned()),
                    ..Default::default()
                },
            )
            .await?;
        info!(task_id = %task_id, params = ?params, "task created");

        let job = PipelineJob {
            source_key: input_key(&task_id),
            task_id,
            params,
            webhook_url,
        };
        let span = info_span!("task_intake", task_id = %job.task_id);
        let this = self.clone();
        {
            let mut intake = self.intake_tasks();
            while intake.try_join_next().is_some() {}
            intake.spawn(
                async move { this.stage_and_dispatch(job, submission.source).await }
                    .instrument(span),
            );
        }

        Ok(record)
    }

    /// Wait until every accepted upload has reached storage and the
    /// dispatcher (or been marked failed).
    pub async fn shutdown(&self) {
        let mut pending = std::mem::take(&mut *self.intake_tasks());
        if !pending.is_empty() {
            info!(pending = pending.len(), "waiting for task intake to finish");
        }
        while let Some(res) = pending.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "task intake aborted");
            }
        }
    }

    fn intake_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.intake.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn stage_and_dispatch(&self, job: PipelineJob, source: TempPath) {
        let url = match self.storage.upload(&source, &job.source_key).await {
            Ok(url) => url,
            Err(e) => {
                self.fail_intake(&job, format!("source upload failed: {e}")).await;
                return;
            }
        };
        if let Err(e) = source.close() {
            warn!(error = %e, "could not remove local upload copy");
        }

        let staged = TaskUpdate {
            spaces_input: Some(url),
            message: Some("queued".to_owned()),
            ..Default::default()
        };
        if let Err(e) = self.store.update(&job.task_id, staged).await {
            warn!(error = %e, "could not record source location");
        }

        if let Err(e) = self.dispatcher.submit(job.clone()).await {
            self.fail_intake(&job, format!("dispatch failed: {e}")).await;
        }
    }

    async fn fail_intake(&self, job: &PipelineJob, detail: String) {
        error!(task_id = %job.task_id, error = %detail, "task intake failed");
        let update = TaskUpdate {
            status: Some(TaskState::Error),
            progress: Some(0),
            error_detail: Some(detail),
            message: Some("task could not be started".to_owned()),
            ..Default::default()
        };
        if let Err(e) = self.store.update(&job.task_id, update).await {
            error!(task_id = %job.task_id, error = %e, "could not record intake failure");
        }
        self.notifier
            .deliver(&self.store, &job.task_id, job.webhook_url.as_deref())
            .await;
    }

    pub async fn get(&self, task_id: &str) -> Result<TaskStatus, ServiceError> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(task_id.to_owned()))
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<TaskSummary>, ServiceError> {
        Ok(self
            .store
            .list_recent(limit.clamp(1, MAX_LIST_LIMIT))
            .await?)
    }

    /// Mark the task's artifacts for expiration and drop its record.
    pub async fn delete(&self, task_id: &str) -> Result<(), ServiceError> {
        let record = self.get(task_id).await?;

        let mut keys = Vec::with_capacity(2);
        if record.spaces_input.is_some() {
            keys.push(input_key(task_id));
        }
        if record.spaces_output.is_some() {
            keys.push(output_key(task_id));
        }
        for key in keys {
            if let Err(e) = self
                .storage
                .mark_for_expiration(&key, self.options.expire_after_days)
                .await
            {
                warn!(task_id, key = %key, error = %e, "could not mark artifact for expiration");
            }
        }

        self.store.delete(task_id).await?;
        info!(task_id, "task deleted");
        Ok(())
    }

    /// Public location of the cleaned video, once the task completed.
    pub async fn download_url(&self, task_id: &str) -> Result<String, ServiceError> {
        let record = self.get(task_id).await?;
        match (record.status, record.spaces_output) {
            (TaskState::Completed, Some(url)) => Ok(url),
            (status, _) => Err(ServiceError::NotReady {
                task_id: task_id.to_owned(),
                status,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Collaborators, PipelineRunner, RunnerOptions};
    use crate::status::FileStatusBackend;
    use crate::testing::{
        CountingInpainter, MemoryStorage, ScriptedDetector, SyntheticMedia, WebhookSink,
    };
    use std::io::Write;
    use std::time::Duration;

    struct Fixture {
        service: TaskService,
        storage: Arc<MemoryStorage>,
        _work: tempfile::TempDir,
    }

    fn fixture(storage: MemoryStorage, media: SyntheticMedia) -> Fixture {
        let store = StatusStore::new(Arc::new(FileStatusBackend::in_memory(Duration::from_secs(
            3600,
        ))));
        let storage = Arc::new(storage);
        let work = tempfile::tempdir().unwrap();
        let notifier = WebhookNotifier::new().unwrap();
        let runner = PipelineRunner::new(
            store.clone(),
            Collaborators {
                storage: storage.clone(),
                media: Arc::new(media),
                detector: Arc::new(ScriptedDetector::default()),
                inpainter: Arc::new(CountingInpainter::default()),
            },
            notifier.clone(),
            RunnerOptions {
                work_root: work.path().to_path_buf(),
                flush_every: 10,
            },
        );
        let dispatcher = Arc::new(TaskDispatcher::local(2, Arc::new(runner)));
        let service = TaskService::new(
            store,
            storage.clone(),
            dispatcher,
            notifier,
            ServiceOptions::default(),
        );
        Fixture {
            service,
            storage,
            _work: work,
        }
    }

    fn upload() -> TempPath {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"fake video").unwrap();
        f.into_temp_path()
    }

    async fn wait_terminal(service: &TaskService, id: &str) -> TaskStatus {
        for _ in 0..500 {
            let s = service.get(id).await.unwrap();
            if s.status.is_terminal() {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn submit_returns_queued_record_with_clamped_params() {
        let fx = fixture(MemoryStorage::default(), SyntheticMedia::new(10));
        let record = fx
            .service
            .submit(Submission {
                source: upload(),
                overrides: ParamOverrides {
                    conf: Some(5.0),
                    mask_expand: Some(-3),
                    ..Default::default()
                },
                webhook_url: Some("not a url".into()),
            })
            .await
            .unwrap();

        assert_eq!(record.status, TaskState::Queued);
        assert_eq!(record.progress, 0);
        assert!(record.spaces_input.is_none());
        let params = record.params_effective.unwrap();
        assert_eq!(params.conf, 0.8);
        assert_eq!(params.mask_expand, 0);
    }

    #[tokio::test]
    async fn submitted_task_runs_to_completion() {
        let fx = fixture(MemoryStorage::default(), SyntheticMedia::new(10));
        let sink = WebhookSink::start(200).await;
        let record = fx
            .service
            .submit(Submission {
                source: upload(),
                overrides: ParamOverrides::default(),
                webhook_url: Some(sink.url()),
            })
            .await
            .unwrap();

        let done = wait_terminal(&fx.service, &record.task_id).await;
        assert_eq!(done.status, TaskState::Completed);
        assert_eq!(done.frames_total, Some(10));
        assert_eq!(done.frames_done, Some(10));
        assert!(done.spaces_input.is_some());
        assert_eq!(
            fx.service.download_url(&record.task_id).await.unwrap(),
            done.spaces_output.clone().unwrap()
        );

        // the webhook outcome lands right after the terminal write
        for _ in 0..100 {
            if !sink.bodies().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let bodies = sink.bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["status"], "completed");
    }

    #[tokio::test]
    async fn failed_source_upload_marks_task_error() {
        let storage = MemoryStorage {
            fail_uploads: true,
            ..Default::default()
        };
        let fx = fixture(storage, SyntheticMedia::new(3));
        let record = fx
            .service
            .submit(Submission {
                source: upload(),
                overrides: ParamOverrides::default(),
                webhook_url: None,
            })
            .await
            .unwrap();

        let done = wait_terminal(&fx.service, &record.task_id).await;
        assert_eq!(done.status, TaskState::Error);
        assert!(done.error_detail.unwrap().contains("source upload failed"));
        assert!(done.spaces_input.is_none());
    }

    #[tokio::test]
    async fn shutdown_waits_for_pending_intake() {
        let fx = fixture(MemoryStorage::default(), SyntheticMedia::new(3));
        let record = fx
            .service
            .submit(Submission {
                source: upload(),
                overrides: ParamOverrides::default(),
                webhook_url: None,
            })
            .await
            .unwrap();

        fx.service.shutdown().await;

        let key = input_key(&record.task_id);
        assert!(fx.storage.keys().contains(&key));
        let after = fx.service.get(&record.task_id).await.unwrap();
        assert!(after.spaces_input.is_some());
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let fx = fixture(MemoryStorage::default(), SyntheticMedia::new(3));
        assert!(matches!(
            fx.service.get("nope").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            fx.service.delete("nope").await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            fx.service.download_url("nope").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_expires_artifacts_and_drops_record() {
        let fx = fixture(MemoryStorage::default(), SyntheticMedia::new(3));
        let record = fx
            .service
            .submit(Submission {
                source: upload(),
                overrides: ParamOverrides::default(),
                webhook_url: None,
            })
            .await
            .unwrap();
        let id = record.task_id.clone();
        wait_terminal(&fx.service, &id).await;

        fx.service.delete(&id).await.unwrap();
        assert!(matches!(
            fx.service.get(&id).await,
            Err(ServiceError::NotFound(_))
        ));
        let marked = fx.storage.expirations.lock().unwrap().clone();
        assert_eq!(
            marked,
            [(input_key(&id), 7), (output_key(&id), 7)]
        );
    }

    #[tokio::test]
    async fn download_before_completion_is_not_ready() {
        let fx = fixture(MemoryStorage::default(), SyntheticMedia::failing("boom"));
        let record = fx
            .service
            .submit(Submission {
                source: upload(),
                overrides: ParamOverrides::default(),
                webhook_url: None,
            })
            .await
            .unwrap();
        wait_terminal(&fx.service, &record.task_id).await;

        assert!(matches!(
            fx.service.download_url(&record.task_id).await,
            Err(ServiceError::NotReady {
                status: TaskState::Error,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn list_limit_is_clamped() {
        let fx = fixture(MemoryStorage::default(), SyntheticMedia::new(3));
        for _ in 0..3 {
            fx.service
                .store()
                .create(&Uuid::new_v4().to_string(), TaskUpdate::default())
                .await
                .unwrap();
        }
        assert_eq!(fx.service.list_recent(0).await.unwrap().len(), 1);
        assert_eq!(fx.service.list_recent(10_000).await.unwrap().len(), 3);
    }
}
