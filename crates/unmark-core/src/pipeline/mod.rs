//! The watermark removal stage sequencer.
//!
//! A run walks `downloading → extracting → detecting → inpainting →
//! rendering → uploading_output → finalizing`, writing the task record at
//! each boundary. Progress bands:
//!
//! | stage            | progress |
//! |------------------|----------|
//! | downloading      | 5        |
//! | extracting       | 10       |
//! | detecting        | 15       |
//! | inpainting       | 20 → 80  |
//! | rendering        | 85       |
//! | uploading_output | 90       |
//! | finalizing       | 100      |
//!
//! Any failure sets `status=error`, `progress=0` and is returned to the
//! dispatcher after the webhook fired. Nothing is retried.

mod workspace;


use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use image::GrayImage;
use tracing::{Instrument, error, info, info_span};
use unmark_types::{ParamSet, Stage, TaskState, TaskUpdate};

use crate::capability::{BoundingBox, DetectOptions, Detector, Inpainter, MediaTool, ObjectStorage};
use crate::dispatch::{JobHandler, PipelineJob};
use crate::error::{PipelineError, StageCause};
use crate::mask::{build_mask, covered_pixels};
use crate::status::StatusStore;
use crate::webhook::WebhookNotifier;

use self::workspace::RunWorkspace;

pub const INPAINT_START: u8 = 20;
pub const INPAINT_SPAN: u8 = 60;

/// Storage key of a task's uploaded source.
pub fn input_key(task_id: &str) -> String {
    format!("uploads/{task_id}.mp4")
}

/// Storage key of a task's cleaned output.
pub fn output_key(task_id: &str) -> String {
    format!("outputs/{task_id}_clean.mp4")
}

/// Indices of the frames handed to the detector: first, middle (with at
/// least two frames) and last (with at least three).
pub fn sample_indices(len: usize) -> Vec<usize> {
    let mut idx = Vec::with_capacity(3);
    if len >= 1 {
        idx.push(0);
    }
    if len >= 2 {
        idx.push(len / 2);
    }
    if len >= 3 {
        idx.push(len - 1);
    }
    idx
}

/// Progress after `done` of `total` frames were inpainted.
pub fn inpaint_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return INPAINT_START + INPAINT_SPAN;
    }
    let done = done.min(total);
    INPAINT_START + (done * usize::from(INPAINT_SPAN) / total) as u8
}

/// Name of the `n`-th (1-based) frame, as the muxer expects it.
pub fn frame_file_name(n: usize) -> String {
    format!("frame_{n:06}.png")
}

/// External capabilities a run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn ObjectStorage>,
    pub media: Arc<dyn MediaTool>,
    pub detector: Arc<dyn Detector>,
    pub inpainter: Arc<dyn Inpainter>,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Parent of the per-run scratch directories.
    pub work_root: PathBuf,
    /// Write inpainting progress every this many frames (and on the last one).
    pub flush_every: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("unmark"),
            flush_every: 10,
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub output_url: String,
    pub frames: usize,
    pub boxes: usize,
}

pub struct PipelineRunner {
    store: StatusStore,
    deps: Collaborators,
    notifier: WebhookNotifier,
    options: RunnerOptions,
}

impl PipelineRunner {
    pub fn new(
        store: StatusStore,
        deps: Collaborators,
        notifier: WebhookNotifier,
        options: RunnerOptions,
    ) -> Self {
        Self {
            store,
            deps,
            notifier,
            options,
        }
    }

    /// Execute one run end to end. The scratch directory is gone by the time
    /// this returns, whatever the outcome.
    pub async fn run(&self, job: &PipelineJob) -> Result<RunOutcome, PipelineError> {
        let span = info_span!("pipeline_run", task_id = %job.task_id);
        self.run_in_span(job).instrument(span).await
    }

    async fn run_in_span(&self, job: &PipelineJob) -> Result<RunOutcome, PipelineError> {
        let started = Instant::now();
        info!(source = %job.source_key, params = ?job.params, "run started");

        let result = match RunWorkspace::create(&self.options.work_root, &job.task_id).await {
            Ok(ws) => {
                let result = self.execute(job, &ws).await;
                ws.close().await;
                result
            }
            Err(e) => Err(PipelineError::stage(Stage::Downloading, e)),
        };

        match &result {
            Ok(outcome) => info!(
                frames = outcome.frames,
                boxes = outcome.boxes,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "run completed"
            ),
            Err(err) => {
                error!(
                    stage = ?err.failed_stage(),
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "run failed"
                );
                self.record_failure(&job.task_id, err).await;
            }
        }

        self.notifier
            .deliver(&self.store, &job.task_id, job.webhook_url.as_deref())
            .await;
        result
    }

    async fn execute(&self, job: &PipelineJob, ws: &RunWorkspace) -> Result<RunOutcome, PipelineError> {
        let id = job.task_id.as_str();
        let params = &job.params;

        // ── 1. downloading ───────────────────────────────────────────────────
        self.advance(id, TaskUpdate::stage(Stage::Downloading, 5).message("downloading source"))
            .await?;
        let source = ws.source_path();
        self.deps
            .storage
            .download(&job.source_key, &source)
            .await
            .map_err(PipelineError::at(Stage::Downloading))?;

        // ── 2. extracting ────────────────────────────────────────────────────
        self.advance(id, TaskUpdate::stage(Stage::Extracting, 10).message("extracting frames"))
            .await?;
        let video = self
            .deps
            .media
            .probe(&source)
            .await
            .map_err(PipelineError::at(Stage::Extracting))?;
        let frames = self
            .deps
            .media
            .extract_frames(&source, &ws.frames_dir(), params.frame_stride)
            .await
            .map_err(PipelineError::at(Stage::Extracting))?;
        if frames.paths.is_empty() {
            return Err(PipelineError::stage(Stage::Extracting, StageCause::NoFrames));
        }
        let total = frames.paths.len();
        info!(frames = total, fps = video.fps, has_audio = video.has_audio, "frames extracted");

        // ── 3. detecting ─────────────────────────────────────────────────────
        self.advance(
            id,
            TaskUpdate {
                frames_total: Some(total as u32),
                frames_done: Some(0),
                video: Some(video.clone()),
                model_used: Some(self.deps.detector.model_id().to_owned()),
                ..TaskUpdate::stage(Stage::Detecting, 15).message("detecting watermark")
            },
        )
        .await?;
        let (boxes, (width, height)) = self.detect_samples(&frames.paths, params).await?;

        // ── 4. mask ──────────────────────────────────────────────────────────
        let mask = build_mask(&boxes, params.mask_expand, width, height);
        let covered = covered_pixels(&mask);
        info!(boxes = boxes.len(), covered_pixels = covered, "mask built");

        // ── 5. inpainting ────────────────────────────────────────────────────
        self.advance(id, TaskUpdate::stage(Stage::Inpainting, INPAINT_START).message("removing watermark"))
            .await?;
        let processed = ws.processed_dir();
        let mask = (covered > 0).then(|| Arc::new(mask));
        let flush_every = self.options.flush_every.max(1);

        for (idx, src) in frames.paths.iter().enumerate() {
            let dst = processed.join(frame_file_name(idx + 1));
            match &mask {
                // identity: hand the extracted bytes through untouched
                None => {
                    tokio::fs::copy(src, &dst)
                        .await
                        .map_err(PipelineError::at(Stage::Inpainting))?;
                }
                Some(mask) => {
                    self.inpaint_frame(src.clone(), dst, Arc::clone(mask), params.blend_alpha)
                        .await?;
                }
            }

            let done = idx + 1;
            if done % flush_every == 0 || done == total {
                self.advance(
                    id,
                    TaskUpdate {
                        frames_done: Some(done as u32),
                        ..TaskUpdate::progress(inpaint_progress(done, total))
                    },
                )
                .await?;
            }
        }

        // ── 6. rendering ─────────────────────────────────────────────────────
        self.advance(id, TaskUpdate::stage(Stage::Rendering, 85).message("rendering video"))
            .await?;
        let output = ws.output_path();
        let audio = video.has_audio.then_some(source.as_path());
        self.deps
            .media
            .render(&processed, &output, audio, video.fps)
            .await
            .map_err(PipelineError::at(Stage::Rendering))?;

        // ── 7. uploading_output ──────────────────────────────────────────────
        self.advance(id, TaskUpdate::stage(Stage::UploadingOutput, 90).message("uploading result"))
            .await?;
        let output_url = self
            .deps
            .storage
            .upload(&output, &output_key(id))
            .await
            .map_err(PipelineError::at(Stage::UploadingOutput))?;
        self.advance(
            id,
            TaskUpdate {
                spaces_output: Some(output_url.clone()),
                ..Default::default()
            },
        )
        .await?;

        // ── 8. finalizing ────────────────────────────────────────────────────
        self.advance(
            id,
            TaskUpdate {
                status: Some(TaskState::Completed),
                ..TaskUpdate::stage(Stage::Finalizing, 100).message("watermark removed")
            },
        )
        .await?;

        Ok(RunOutcome {
            output_url,
            frames: total,
            boxes: boxes.len(),
        })
    }

    /// Detect on the sample frames and union the boxes. Also returns the
    /// frame size, read from the first frame.
    async fn detect_samples(
        &self,
        frames: &[PathBuf],
        params: &ParamSet,
    ) -> Result<(Vec<BoundingBox>, (u32, u32)), PipelineError> {
        let opts = DetectOptions::from(params);
        let mut boxes = Vec::new();
        let mut dims = None;

        for idx in sample_indices(frames.len()) {
            let path = frames[idx].clone();
            let detector = Arc::clone(&self.deps.detector);
            let (found, size) = tokio::task::spawn_blocking(move || -> Result<_, StageCause> {
                let frame = image::open(&path)?.to_rgb8();
                let size = frame.dimensions();
                Ok((detector.detect(&frame, &opts)?, size))
            })
            .await
            .map_err(|e| PipelineError::stage(Stage::Detecting, StageCause::Join(e.to_string())))?
            .map_err(PipelineError::at(Stage::Detecting))?;

            info!(frame = idx, boxes = found.len(), "sample frame scanned");
            dims.get_or_insert(size);
            boxes.extend(found);
        }

        // sample_indices is non-empty for non-empty input
        let dims = dims.ok_or_else(|| PipelineError::stage(Stage::Detecting, StageCause::NoFrames))?;
        Ok((boxes, dims))
    }

    async fn inpaint_frame(
        &self,
        src: PathBuf,
        dst: PathBuf,
        mask: Arc<GrayImage>,
        blend_alpha: f32,
    ) -> Result<(), PipelineError> {
        let inpainter = Arc::clone(&self.deps.inpainter);
        tokio::task::spawn_blocking(move || -> Result<(), StageCause> {
            let frame = image::open(&src)?.to_rgb8();
            let out = inpainter.inpaint(&frame, &mask, blend_alpha)?;
            out.save(&dst)?;
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::stage(Stage::Inpainting, StageCause::Join(e.to_string())))?
        .map_err(PipelineError::at(Stage::Inpainting))
    }

    async fn advance(&self, task_id: &str, update: TaskUpdate) -> Result<(), PipelineError> {
        self.store.update(task_id, update).await?;
        Ok(())
    }

    async fn record_failure(&self, task_id: &str, err: &PipelineError) {
        let message = match err.failed_stage() {
            Some(stage) => format!("processing failed during {stage}"),
            None => "processing failed".to_owned(),
        };
        let update = TaskUpdate {
            status: Some(TaskState::Error),
            progress: Some(0),
            error_detail: Some(err.to_string()),
            message: Some(message),
            log_excerpt: err.log_excerpt(),
            ..Default::default()
        };
        if let Err(e) = self.store.update(task_id, update).await {
            error!(task_id, error = %e, "could not record run failure");
        }
    }
}

#[async_trait]
impl JobHandler for PipelineRunner {
    async fn handle(&self, job: PipelineJob) -> Result<(), PipelineError> {
        self.run(&job).await.map(|_| ())
    }
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("store", &self.store)
            .field("options", &self.options)
            .finish()
    }
}
