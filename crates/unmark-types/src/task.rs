//! The persisted per-task status record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::warn;

use crate::params::ParamSet;

/// High-level lifecycle state of a task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum TaskState {
    Queued,
    Processing,
    Completed,
    Error,
}

impl TaskState {
    /// `completed` and `error` never transition back to a transient state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Error)
    }
}

/// Pipeline step, declared in execution order so that `Ord` follows it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum Stage {
    Uploading,
    Downloading,
    Extracting,
    Detecting,
    Inpainting,
    Rendering,
    UploadingOutput,
    Finalizing,
}

/// Metadata probed from the source video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub has_audio: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

/// Full status snapshot of one task. This is also the webhook body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TaskStatus {
    pub task_id: String,
    pub status: TaskState,
    pub stage: Stage,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_seconds: f64,
    #[serde(default)]
    pub model_used: Option<String>,
    #[serde(default)]
    pub frames_total: Option<u32>,
    #[serde(default)]
    pub frames_done: Option<u32>,
    #[serde(default)]
    pub video: Option<VideoInfo>,
    #[serde(default)]
    pub spaces_input: Option<String>,
    #[serde(default)]
    pub spaces_output: Option<String>,
    #[serde(default)]
    pub log_excerpt: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub params_effective: Option<ParamSet>,
    #[serde(default)]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub webhook_status: Option<String>,
    #[serde(default)]
    pub webhook_error: Option<String>,
}

/// A partial update merged over a [`TaskStatus`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: Option<TaskState>,
    pub stage: Option<Stage>,
    pub progress: Option<u8>,
    pub model_used: Option<String>,
    pub frames_total: Option<u32>,
    pub frames_done: Option<u32>,
    pub video: Option<VideoInfo>,
    pub spaces_input: Option<String>,
    pub spaces_output: Option<String>,
    pub log_excerpt: Option<String>,
    pub message: Option<String>,
    pub params_effective: Option<ParamSet>,
    pub error_detail: Option<String>,
    pub webhook_status: Option<String>,
    pub webhook_error: Option<String>,
}

impl TaskUpdate {
    /// Move to `stage` while processing, at `progress`.
    pub fn stage(stage: Stage, progress: u8) -> Self {
        Self {
            status: Some(TaskState::Processing),
            stage: Some(stage),
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Row returned by `list_recent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TaskSummary {
    pub task_id: String,
    pub status: TaskState,
    pub progress: u8,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    /// A fresh `queued` record, still waiting for its source upload.
    pub fn new(task_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskState::Queued,
            stage: Stage::Uploading,
            progress: 0,
            started_at: now,
            updated_at: now,
            duration_seconds: 0.0,
            model_used: None,
            frames_total: None,
            frames_done: None,
            video: None,
            spaces_input: None,
            spaces_output: None,
            log_excerpt: None,
            message: None,
            params_effective: None,
            error_detail: None,
            webhook_status: None,
            webhook_error: None,
        }
    }

    /// Merge `update` into this record, recompute the duration and bump
    /// `updated_at` to `now`.
    ///
    /// A terminal record keeps its status: an update trying to move it back to
    /// `queued` or `processing` has that one field dropped.
    pub fn apply(&mut self, update: TaskUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            if self.status.is_terminal() && !status.is_terminal() {
                warn!(
                    task_id = %self.task_id,
                    current = %self.status,
                    requested = %status,
                    "ignoring transition out of terminal status"
                );
            } else {
                self.status = status;
            }
        }

        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $( if let Some(v) = update.$field { self.$field = v; } )*
            };
        }
        macro_rules! merge_opt {
            ($($field:ident),* $(,)?) => {
                $( if update.$field.is_some() { self.$field = update.$field; } )*
            };
        }

        merge!(stage, progress);
        self.progress = self.progress.min(100);
        merge_opt!(
            model_used,
            frames_total,
            frames_done,
            video,
            spaces_input,
            spaces_output,
            log_excerpt,
            message,
            params_effective,
            error_detail,
            webhook_status,
            webhook_error,
        );

        self.updated_at = now;
        self.duration_seconds = (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.task_id.clone(),
            status: self.status,
            progress: self.progress,
            updated_at: self.updated_at,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
