//! Error types, one enum per collaborator boundary.

use thiserror::Error;
use unmark_types::{Stage, TaskState};

/// Failures of a [`StatusBackend`](crate::status::StatusBackend).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("status record is not valid json: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("status snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
}

/// Failures of an [`ObjectStorage`](crate::capability::ObjectStorage).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage {op} failed for '{key}': {message}")]
    Backend {
        op: &'static str,
        key: String,
        message: String,
    },

    #[error("local file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a [`MediaTool`](crate::capability::MediaTool).
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with status {}: {stderr}", .code.map_or_else(|| "signal".to_owned(), |c| c.to_string()))]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("could not read media metadata: {0}")]
    Probe(String),

    #[error("media I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a [`Detector`](crate::capability::Detector).
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detection model unavailable: {0}")]
    Model(String),

    #[error("detection inference failed: {0}")]
    Inference(String),
}

/// Failures of an [`Inpainter`](crate::capability::Inpainter).
#[derive(Debug, Error)]
pub enum InpaintError {
    #[error("mask is {mask_w}x{mask_h} but frame is {frame_w}x{frame_h}")]
    DimensionMismatch {
        frame_w: u32,
        frame_h: u32,
        mask_w: u32,
        mask_h: u32,
    },

    #[error("inpainting failed: {0}")]
    Failed(String),
}

/// Underlying cause of a stage failure.
#[derive(Debug, Error)]
pub enum StageCause {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error(transparent)]
    Inpaint(#[from] InpaintError),

    #[error("frame image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("work directory I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no frames were extracted from the source")]
    NoFrames,

    #[error("worker thread failed: {0}")]
    Join(String),
}

/// Why a pipeline run aborted.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageCause,
    },

    #[error("status store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn stage(stage: Stage, cause: impl Into<StageCause>) -> Self {
        PipelineError::Stage {
            stage,
            source: cause.into(),
        }
    }

    /// Closure form of [`PipelineError::stage`] for use with `map_err`.
    pub fn at<E: Into<StageCause>>(stage: Stage) -> impl FnOnce(E) -> Self {
        move |e| Self::stage(stage, e)
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage { stage, .. } => Some(*stage),
            PipelineError::Store(_) => None,
        }
    }

    /// Tail of the external tool's diagnostic output, if any.
    pub fn log_excerpt(&self) -> Option<String> {
        match self {
            PipelineError::Stage {
                source: StageCause::Media(MediaError::ToolFailed { stderr, .. }),
                ..
            } => Some(tail(stderr, LOG_EXCERPT_CHARS)),
            _ => None,
        }
    }
}

/// Failures of a [`QueueBackend`](crate::dispatch::QueueBackend).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("broker error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("job payload is not valid json: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("timed out connecting to broker at {0}")]
    ConnectTimeout(String),

    #[error("worker pool is shut down")]
    Closed,
}

/// Errors surfaced by [`TaskService`](crate::service::TaskService).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {task_id} is {status}, output not available")]
    NotReady { task_id: String, status: TaskState },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

const LOG_EXCERPT_CHARS: usize = 2000;

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_owned();
    }
    text.chars().skip(count - max_chars).collect()
}
