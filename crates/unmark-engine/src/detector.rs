//! YOLO-style watermark detector on ONNX Runtime.
//!
//! Expects a single-input model taking `[1, 3, S, S]` RGB in `[0, 1]` and
//! producing `[1, 4 + classes, anchors]` with centre-format boxes in input
//! pixel space, the layout exported by ultralytics.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use image::RgbImage;
use image::imageops::{self, FilterType};
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};
use unmark_core::capability::{BoundingBox, DetectOptions, Detector};
use unmark_core::error::DetectError;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub model_path: PathBuf,
    /// Square model input edge.
    pub input_size: u32,
}

impl DetectorConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            input_size: 640,
        }
    }
}

pub struct YoloDetector {
    // `Session::run` needs `&mut`
    session: Mutex<Session>,
    input_size: u32,
    model_id: String,
}

impl std::fmt::Debug for YoloDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YoloDetector")
            .field("model_id", &self.model_id)
            .field("input_size", &self.input_size)
            .finish()
    }
}

impl YoloDetector {
    pub fn load(cfg: &DetectorConfig) -> Result<Self, DetectError> {
        if !cfg.model_path.is_file() {
            return Err(DetectError::Model(format!(
                "model file {} does not exist",
                cfg.model_path.display()
            )));
        }
        info!(path = %cfg.model_path.display(), "loading detection model");

        let session = Session::builder()
            .map_err(|e| DetectError::Model(e.to_string()))?
            .commit_from_file(&cfg.model_path)
            .map_err(|e| DetectError::Model(e.to_string()))?;

        Ok(Self {
            session: Mutex::new(session),
            input_size: cfg.input_size.max(32),
            model_id: model_id(&cfg.model_path),
        })
    }
}

impl Detector for YoloDetector {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn detect(&self, frame: &RgbImage, opts: &DetectOptions) -> Result<Vec<BoundingBox>, DetectError> {
        let size = self.input_size;
        let input = Tensor::from_array(([1usize, 3, size as usize, size as usize], to_chw(frame, size)))
            .map_err(|e| DetectError::Inference(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectError::Inference("detector session lock poisoned".to_owned()))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| DetectError::Inference(e.to_string()))?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectError::Inference(format!("failed to extract output: {e}")))?;

        let scale = (
            frame.width() as f32 / size as f32,
            frame.height() as f32 / size as f32,
        );
        let raw = decode(shape.as_ref(), data, opts.conf, scale, frame.dimensions())?;
        let kept = nms(raw, opts.iou, opts.agnostic_nms, opts.max_det);
        debug!(boxes = kept.len(), "detection finished");
        Ok(kept)
    }
}

fn model_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "onnx".to_owned())
}

/// Resize to `size`×`size` and lay out as planar RGB scaled to `[0, 1]`.
fn to_chw(frame: &RgbImage, size: u32) -> Vec<f32> {
    let resized = imageops::resize(frame, size, size, FilterType::Triangle);
    let plane = (size * size) as usize;
    let mut out = vec![0.0f32; 3 * plane];
    for (x, y, px) in resized.enumerate_pixels() {
        let i = (y * size + x) as usize;
        out[i] = f32::from(px[0]) / 255.0;
        out[plane + i] = f32::from(px[1]) / 255.0;
        out[2 * plane + i] = f32::from(px[2]) / 255.0;
    }
    out
}

/// Turn `[1, 4 + classes, anchors]` into frame-space boxes above `conf`.
fn decode(
    shape: &[i64],
    data: &[f32],
    conf: f32,
    (sx, sy): (f32, f32),
    (width, height): (u32, u32),
) -> Result<Vec<BoundingBox>, DetectError> {
    let &[_, features, anchors] = shape else {
        return Err(DetectError::Inference(format!(
            "expected a 3D output tensor, got shape {shape:?}"
        )));
    };
    let (features, anchors) = (features as usize, anchors as usize);
    if features < 5 || data.len() < features * anchors {
        return Err(DetectError::Inference(format!(
            "output shape {shape:?} does not match {} values",
            data.len()
        )));
    }

    let at = |feature: usize, anchor: usize| data[feature * anchors + anchor];
    let (w, h) = (width as f32, height as f32);
    let mut boxes = Vec::new();
    for a in 0..anchors {
        let (class_id, score) = (4..features)
            .map(|f| (f - 4, at(f, a)))
            .fold((0, f32::MIN), |best, c| if c.1 > best.1 { c } else { best });
        if score < conf {
            continue;
        }
        let (cx, cy, bw, bh) = (at(0, a) * sx, at(1, a) * sy, at(2, a) * sx, at(3, a) * sy);
        boxes.push(BoundingBox {
            x1: (cx - bw / 2.0).clamp(0.0, w),
            y1: (cy - bh / 2.0).clamp(0.0, h),
            x2: (cx + bw / 2.0).clamp(0.0, w),
            y2: (cy + bh / 2.0).clamp(0.0, h),
            confidence: score,
            class_id,
        });
    }
    Ok(boxes)
}

/// Greedy non-maximum suppression, highest confidence first. Boxes of
/// different classes never suppress each other unless `agnostic`.
fn nms(
    mut boxes: Vec<BoundingBox>,
    iou: f32,
    agnostic: bool,
    max_det: Option<u32>,
) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let limit = max_det.map_or(usize::MAX, |m| m as usize);

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(boxes.len().min(limit));
    for candidate in boxes {
        if keep.len() >= limit {
            break;
        }
        let suppressed = keep.iter().any(|k| {
            (agnostic || k.class_id == candidate.class_id) && k.iou(&candidate) > iou
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}
