//! In-process fakes for the collaborator traits.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Json, Router, routing::post};
use image::{GrayImage, Rgb, RgbImage};
use serde_json::Value;
use unmark_types::{Stage, TaskState, TaskStatus, TaskSummary, TaskUpdate, VideoInfo};

use crate::capability::{
    BoundingBox, DetectOptions, Detector, ExtractedFrames, Inpainter, MediaTool, ObjectStorage,
};
use crate::error::{DetectError, InpaintError, MediaError, StorageError, StoreError};
use crate::status::{FileStatusBackend, StatusBackend};

// ── storage ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStorage {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub expirations: Mutex<Vec<(String, u32)>>,
    pub fail_uploads: bool,
}

impl MemoryStorage {
    pub fn with_object(key: &str, bytes: &[u8]) -> Self {
        let s = Self::default();
        s.objects.lock().unwrap().insert(key.to_owned(), bytes.to_vec());
        s
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(&self, local: &Path, key: &str) -> Result<String, StorageError> {
        if self.fail_uploads {
            return Err(StorageError::Backend {
                op: "upload",
                key: key.to_owned(),
                message: "bucket is read-only".to_owned(),
            });
        }
        let bytes = tokio::fs::read(local).await?;
        self.objects.lock().unwrap().insert(key.to_owned(), bytes);
        Ok(format!("mem://bucket/{key}"))
    }

    async fn download(&self, key: &str, local: &Path) -> Result<(), StorageError> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_owned()))?;
        tokio::fs::write(local, bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn mark_for_expiration(&self, key: &str, days: u32) -> Result<(), StorageError> {
        self.expirations.lock().unwrap().push((key.to_owned(), days));
        Ok(())
    }

    async fn check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

// ── media ────────────────────────────────────────────────────────────────────

/// Writes `frames` solid PNG stills whose red channel encodes the frame index
/// (`index * 10`), and captures what gets rendered.
pub struct SyntheticMedia {
    pub frames: usize,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
    pub fail_extract: Option<String>,
    pub extracted: Mutex<Vec<Vec<u8>>>,
    pub rendered: Mutex<Vec<Vec<u8>>>,
    pub rendered_with_audio: Mutex<Option<bool>>,
}

impl SyntheticMedia {
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            width: 32,
            height: 24,
            has_audio: false,
            fail_extract: None,
            extracted: Mutex::new(Vec::new()),
            rendered: Mutex::new(Vec::new()),
            rendered_with_audio: Mutex::new(None),
        }
    }

    pub fn failing(stderr: &str) -> Self {
        Self {
            fail_extract: Some(stderr.to_owned()),
            ..Self::new(10)
        }
    }
}

#[async_trait]
impl MediaTool for SyntheticMedia {
    async fn probe(&self, _video: &Path) -> Result<VideoInfo, MediaError> {
        Ok(VideoInfo {
            width: self.width,
            height: self.height,
            fps: 25.0,
            has_audio: self.has_audio,
            duration_seconds: Some(self.frames as f64 / 25.0),
        })
    }

    async fn extract_frames(
        &self,
        _video: &Path,
        out_dir: &Path,
        stride: u32,
    ) -> Result<ExtractedFrames, MediaError> {
        if let Some(stderr) = &self.fail_extract {
            return Err(MediaError::ToolFailed {
                tool: "ffmpeg".to_owned(),
                code: Some(1),
                stderr: stderr.clone(),
            });
        }
        let mut paths = Vec::new();
        for (n, i) in (0..self.frames).step_by(stride.max(1) as usize).enumerate() {
            let img = RgbImage::from_fn(self.width, self.height, |x, y| {
                Rgb([(i * 10) as u8, x as u8, y as u8])
            });
            let path = out_dir.join(format!("frame_{:06}.png", n + 1));
            img.save(&path).map_err(|e| MediaError::Probe(e.to_string()))?;
            self.extracted.lock().unwrap().push(std::fs::read(&path)?);
            paths.push(path);
        }
        Ok(ExtractedFrames::new(paths))
    }

    async fn render(
        &self,
        frames_dir: &Path,
        out_path: &Path,
        audio_source: Option<&Path>,
        _fps: f64,
    ) -> Result<(), MediaError> {
        let mut names: Vec<_> = std::fs::read_dir(frames_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        names.sort();
        let mut rendered = self.rendered.lock().unwrap();
        for p in names {
            rendered.push(std::fs::read(p)?);
        }
        *self.rendered_with_audio.lock().unwrap() = Some(audio_source.is_some());
        std::fs::write(out_path, b"rendered")?;
        Ok(())
    }
}

// ── detection / inpainting ──────────────────────────────────────────────────

/// Returns the same boxes for every frame and remembers which frames it saw.
#[derive(Default)]
pub struct ScriptedDetector {
    pub boxes: Vec<BoundingBox>,
    pub seen_frames: Mutex<Vec<u8>>,
    pub last_opts: Mutex<Option<DetectOptions>>,
}

impl Detector for ScriptedDetector {
    fn model_id(&self) -> &str {
        "scripted"
    }

    fn detect(&self, frame: &RgbImage, opts: &DetectOptions) -> Result<Vec<BoundingBox>, DetectError> {
        // red channel encodes index * 10
        self.seen_frames.lock().unwrap().push(frame.get_pixel(0, 0)[0] / 10);
        *self.last_opts.lock().unwrap() = Some(*opts);
        Ok(self.boxes.clone())
    }
}

/// Paints masked pixels pure green and counts calls.
#[derive(Default)]
pub struct CountingInpainter {
    pub calls: AtomicUsize,
}

impl CountingInpainter {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Inpainter for CountingInpainter {
    fn inpaint(
        &self,
        frame: &RgbImage,
        mask: &GrayImage,
        _blend_alpha: f32,
    ) -> Result<RgbImage, InpaintError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if frame.dimensions() != mask.dimensions() {
            return Err(InpaintError::DimensionMismatch {
                frame_w: frame.width(),
                frame_h: frame.height(),
                mask_w: mask.width(),
                mask_h: mask.height(),
            });
        }
        let mut out = frame.clone();
        for (x, y, m) in mask.enumerate_pixels() {
            if m[0] != 0 {
                out.put_pixel(x, y, Rgb([0, 255, 0]));
            }
        }
        Ok(out)
    }
}

// ── status recording ────────────────────────────────────────────────────────

/// In-memory backend that logs every state it stores.
pub struct RecordingBackend {
    inner: FileStatusBackend,
    pub history: Mutex<Vec<(TaskState, Stage, u8)>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            inner: FileStatusBackend::in_memory(std::time::Duration::from_secs(3600)),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn progress_values(&self) -> Vec<u8> {
        self.history.lock().unwrap().iter().map(|h| h.2).collect()
    }

    pub fn states(&self) -> Vec<TaskState> {
        let mut out: Vec<TaskState> = Vec::new();
        for (s, _, _) in self.history.lock().unwrap().iter() {
            if out.last() != Some(s) {
                out.push(*s);
            }
        }
        out
    }

    fn record(&self, s: &TaskStatus) {
        self.history.lock().unwrap().push((s.status, s.stage, s.progress));
    }
}

#[async_trait]
impl StatusBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn put(&self, record: TaskStatus) -> Result<(), StoreError> {
        self.record(&record);
        self.inner.put(record).await
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskStatus>, StoreError> {
        self.inner.get(task_id).await
    }

    async fn update(
        &self,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<Option<TaskStatus>, StoreError> {
        let merged = self.inner.update(task_id, update).await?;
        if let Some(s) = &merged {
            self.record(s);
        }
        Ok(merged)
    }

    async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        self.inner.delete(task_id).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<TaskSummary>, StoreError> {
        self.inner.list_recent(limit).await
    }

    async fn cleanup_old(&self) -> Result<usize, StoreError> {
        self.inner.cleanup_old().await
    }
}

// ── webhook receiver ────────────────────────────────────────────────────────

type Sink = Arc<Mutex<Vec<Value>>>;

/// Local HTTP endpoint answering every POST with a fixed status code.
pub struct WebhookSink {
    addr: SocketAddr,
    bodies: Sink,
}

impl WebhookSink {
    pub async fn start(reply: u16) -> Self {
        let bodies: Sink = Arc::default();
        let app = Router::new()
            .route("/hook", post(receive))
            .with_state((bodies.clone(), reply));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, bodies }
    }

    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }
}

async fn receive(
    State((bodies, reply)): State<(Sink, u16)>,
    Json(body): Json<Value>,
) -> StatusCode {
    bodies.lock().unwrap().push(body);
    StatusCode::from_u16(reply).unwrap_or(StatusCode::OK)
}
