//! Watermark removal task orchestration.
//!
//! The crate owns everything between an accepted upload and a finished task
//! record: the status store, the job dispatcher, the stage sequencer and the
//! completion webhook. The heavy lifting (ffmpeg, model inference, pixel
//! filling, object storage) is reached through the traits in [`capability`].

pub mod capability;
pub mod dispatch;
pub mod error;
pub mod mask;
pub mod pipeline;
pub mod service;
pub mod status;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use capability::{
    BoundingBox, DetectOptions, Detector, ExtractedFrames, Inpainter, MediaTool, ObjectStorage,
};
pub use dispatch::{DispatchConfig, JobHandler, PipelineJob, TaskDispatcher};
pub use error::{
    DetectError, DispatchError, InpaintError, MediaError, PipelineError, ServiceError, StageCause,
    StorageError, StoreError,
};
pub use pipeline::{Collaborators, PipelineRunner, RunOutcome, RunnerOptions};
pub use service::{ServiceOptions, Submission, TaskService};
pub use status::{StatusConfig, StatusStore};
pub use webhook::{WebhookNotifier, WebhookOutcome};
