//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - Middleware layers (CORS, per-request trace-ID injection, upload limit)
//! - OpenAPI document at `/api-docs/openapi.json`
//! - Health route
//! - `/v1` task routes

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Json, Router, middleware};
use tower::ServiceBuilder;

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Room for multipart framing and the small form fields around the file.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let body_limit =
        usize::try_from(state.config.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD))
            .unwrap_or(usize::MAX);

    Router::new()
        .merge(health::router())
        .nest("/v1", v1::router())
        .route("/api-docs/openapi.json", get(|| async { Json(doc::get_docs()) }))
        .layer(
            ServiceBuilder::new()
                .layer(cors::cors_layer(state.config.cors_origins.as_deref()))
                .layer(middleware::from_fn(trace::trace_middleware))
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use unmark_core::dispatch::{JobHandler, PipelineJob};
    use unmark_core::status::FileStatusBackend;
    use unmark_core::{
        ObjectStorage, PipelineError, ServiceOptions, StatusStore, StorageError, TaskDispatcher,
        TaskService, WebhookNotifier,
    };

    use super::build;
    use crate::config::Config;
    use crate::state::AppState;

    struct NullStorage;

    #[async_trait]
    impl ObjectStorage for NullStorage {
        async fn upload(&self, _local: &Path, key: &str) -> Result<String, StorageError> {
            Ok(format!("mem://bucket/{key}"))
        }
        async fn download(&self, key: &str, _local: &Path) -> Result<(), StorageError> {
            Err(StorageError::NotFound(key.to_owned()))
        }
        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
        async fn exists(&self, _key: &str) -> Result<bool, StorageError> {
            Ok(false)
        }
        async fn check(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    /// Accepts jobs and leaves the record queued.
    struct IdleHandler;

    #[async_trait]
    impl JobHandler for IdleHandler {
        async fn handle(&self, _job: PipelineJob) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    pub struct TestApp {
        state: Arc<AppState>,
        _work: tempfile::TempDir,
    }

    impl TestApp {
        pub fn new() -> Self {
            Self::with_upload_limit(8 * 1024 * 1024)
        }

        pub fn with_upload_limit(bytes: u64) -> Self {
            let work = tempfile::tempdir().unwrap();
            let config = Config {
                work_dir: work.path().to_path_buf(),
                max_upload_bytes: bytes,
                ..Config::from_env().unwrap()
            };
            let store = StatusStore::new(Arc::new(FileStatusBackend::in_memory(
                Duration::from_secs(3600),
            )));
            let service = TaskService::new(
                store,
                Arc::new(NullStorage),
                Arc::new(TaskDispatcher::local(1, Arc::new(IdleHandler))),
                WebhookNotifier::new().unwrap(),
                ServiceOptions::default(),
            );
            Self {
                state: Arc::new(AppState::new(config, service)),
                _work: work,
            }
        }

        pub fn router(&self) -> axum::Router {
            build(self.state.clone())
        }

        pub fn service(&self) -> &TaskService {
            &self.state.service
        }
    }

    /// Encode `fields` plus an optional `(file name, content type, bytes)`
    /// file part. Returns the boundary and the body.
    pub fn multipart_body(
        fields: &[(&str, &str)],
        file: Option<(&str, &str, &[u8])>,
    ) -> (String, Vec<u8>) {
        let boundary = "unmark-test-boundary".to_owned();
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((file_name, content_type, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: {content_type}\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        (boundary, body)
    }
}
