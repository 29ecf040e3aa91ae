//! Watermark removal task endpoints.

use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Redirect;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use unmark_core::Submission;
use unmark_types::{ParamOverrides, ParamSet, Stage, TaskState, TaskStatus, TaskSummary, VideoInfo};
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::config::Config;
use crate::error::ServerError;
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(OpenApi)]
#[openapi(
    paths(submit_task, list_tasks, get_task, delete_task, download_task),
    components(schemas(
        SubmitForm,
        TaskStatus,
        TaskSummary,
        TaskState,
        Stage,
        ParamSet,
        VideoInfo,
    ))
)]
pub struct TasksApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .route("/tasks/{id}/download", get(download_task))
}

/// Multipart body of `POST /v1/tasks`. Unparseable numeric fields count as
/// absent.
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct SubmitForm {
    /// The video (`video/mp4`, `video/quicktime`, `video/x-msvideo` by default).
    #[schema(value_type = String, format = Binary)]
    file: Vec<u8>,
    /// Detection confidence threshold, clamped to [0.05, 0.8].
    conf: Option<f64>,
    /// NMS IoU threshold, clamped to [0.1, 0.9].
    iou: Option<f64>,
    /// Pixels added around every detected box; negative values become 0.
    mask_expand: Option<i64>,
    /// Keep every n-th frame; values below 1 become 1.
    frame_stride: Option<i64>,
    /// Maximum detections per frame, clamped to [1, 50].
    max_det: Option<i64>,
    agnostic_nms: Option<bool>,
    /// Weight of the reconstruction, clamped to [0, 1].
    blend_alpha: Option<f64>,
    /// Receives the final status snapshot as a JSON POST.
    webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListQuery {
    /// Maximum rows, clamped to [1, 500]. Defaults to 50.
    pub limit: Option<usize>,
}

#[utoipa::path(
    post,
    path = "/v1/tasks",
    tag = "tasks",
    request_body(content = SubmitForm, content_type = "multipart/form-data"),
    responses(
        (status = 202, description = "Task accepted", body = TaskStatus),
        (status = 400, description = "Bad request"),
        (status = 413, description = "Upload too large"),
        (status = 415, description = "Unsupported content type"),
    )
)]
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<TaskStatus>), ServerError> {
    let mut source = None;
    let mut form = FormFields::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_owned();
        if name == "file" {
            source = Some(receive_file(field, &state.config).await?);
        } else {
            let text = field.text().await.map_err(multipart_error)?;
            form.set(&name, &text);
        }
    }
    let source =
        source.ok_or_else(|| ServerError::BadRequest("missing multipart field 'file'".into()))?;

    let record = state
        .service
        .submit(Submission {
            source,
            overrides: form.overrides,
            webhook_url: form.webhook_url,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

#[utoipa::path(
    get,
    path = "/v1/tasks",
    tag = "tasks",
    params(ListQuery),
    responses((status = 200, description = "Most recently updated tasks", body = [TaskSummary]))
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<TaskSummary>>, ServerError> {
    let rows = state
        .service
        .list_recent(q.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(rows))
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Current status snapshot", body = TaskStatus),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskStatus>, ServerError> {
    Ok(Json(state.service.get(&id).await?))
}

#[utoipa::path(
    delete,
    path = "/v1/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 204, description = "Record deleted, artifacts marked for expiration"),
        (status = 404, description = "Task not found"),
    )
)]
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ServerError> {
    state.service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}/download",
    tag = "tasks",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 307, description = "Redirect to the cleaned video"),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task not completed"),
    )
)]
pub async fn download_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Redirect, ServerError> {
    let url = state.service.download_url(&id).await?;
    Ok(Redirect::temporary(&url))
}

// ── upload handling ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FormFields {
    overrides: ParamOverrides,
    webhook_url: Option<String>,
}

impl FormFields {
    fn set(&mut self, name: &str, raw: &str) {
        let raw = raw.trim();
        let o = &mut self.overrides;
        match name {
            "conf" => o.conf = raw.parse().ok(),
            "iou" => o.iou = raw.parse().ok(),
            "blend_alpha" => o.blend_alpha = raw.parse().ok(),
            "mask_expand" => o.mask_expand = raw.parse().ok(),
            "frame_stride" => o.frame_stride = raw.parse().ok(),
            "max_det" => o.max_det = raw.parse().ok(),
            "agnostic_nms" => o.agnostic_nms = parse_flag(raw),
            "webhook_url" => self.webhook_url = (!raw.is_empty()).then(|| raw.to_owned()),
            other => debug!(field = other, "ignoring unknown form field"),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Keep the last path component and replace anything outside
/// `[A-Za-z0-9._-]`.
pub(crate) fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload.mp4".to_owned()
    } else {
        cleaned.chars().take(128).collect()
    }
}

fn check_content_type(content_type: Option<&str>, allowed: &[String]) -> Result<(), ServerError> {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if allowed.iter().any(|a| *a == essence) {
        Ok(())
    } else {
        Err(ServerError::UnsupportedMediaType(format!(
            "content type '{essence}' is not accepted; allowed: {}",
            allowed.join(", ")
        )))
    }
}

/// Stream the file field to a scratch file, enforcing the size limit. The
/// scratch file is removed if anything fails.
async fn receive_file(mut field: Field<'_>, cfg: &Config) -> Result<TempPath, ServerError> {
    check_content_type(field.content_type(), &cfg.allowed_mime)?;
    let file_name = sanitize_filename(field.file_name().unwrap_or_default());

    tokio::fs::create_dir_all(&cfg.work_dir)
        .await
        .map_err(|e| ServerError::Internal(format!("cannot create upload dir: {e}")))?;
    let (file, path) = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(".mp4")
        .tempfile_in(&cfg.work_dir)
        .map_err(|e| ServerError::Internal(format!("cannot create upload file: {e}")))?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let mut written: u64 = 0;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        written += chunk.len() as u64;
        if written > cfg.max_upload_bytes {
            return Err(too_large(cfg.max_upload_bytes));
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| ServerError::Internal(format!("cannot write upload: {e}")))?;
    }
    file.flush()
        .await
        .map_err(|e| ServerError::Internal(format!("cannot write upload: {e}")))?;

    if written == 0 {
        return Err(ServerError::BadRequest("uploaded file is empty".into()));
    }
    info!(file_name = %file_name, bytes = written, "upload received");
    Ok(path)
}

fn too_large(limit: u64) -> ServerError {
    ServerError::PayloadTooLarge(format!(
        "upload exceeds the {} MB limit",
        limit / (1024 * 1024)
    ))
}

fn multipart_error(e: MultipartError) -> ServerError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::PayloadTooLarge(e.body_text())
    } else {
        ServerError::BadRequest(e.body_text())
    }
}
