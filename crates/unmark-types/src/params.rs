//! Processing parameters and their resolution from caller overrides.

use serde::{Deserialize, Serialize};

pub const CONF_RANGE: (f32, f32) = (0.05, 0.8);
pub const IOU_RANGE: (f32, f32) = (0.1, 0.9);
pub const MAX_DET_RANGE: (u32, u32) = (1, 50);
pub const BLEND_ALPHA_RANGE: (f32, f32) = (0.0, 1.0);

/// The effective parameter set of one run.
///
/// Only [`resolve`] builds values that honour every bound, so a `ParamSet`
/// read back from a status record is always within range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ParamSet {
    /// Detection confidence threshold, `0.05..=0.8`.
    pub conf: f32,
    /// NMS IoU threshold, `0.1..=0.9`.
    pub iou: f32,
    /// Pixels added on every side of each detected box.
    pub mask_expand: u32,
    /// Keep every n-th frame during extraction (`1` = all frames).
    pub frame_stride: u32,
    /// Detection cap per frame, `1..=50` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_det: Option<u32>,
    /// Suppress overlapping boxes across classes.
    #[serde(default)]
    pub agnostic_nms: bool,
    /// Weight of the reconstructed pixels inside the mask, `0.0..=1.0`.
    pub blend_alpha: f32,
}

/// Defaults are a parameter set too; they get clamped like any override.
pub type ParamDefaults = ParamSet;

impl Default for ParamSet {
    fn default() -> Self {
        Self {
            conf: 0.25,
            iou: 0.45,
            mask_expand: 18,
            frame_stride: 1,
            max_det: None,
            agnostic_nms: false,
            blend_alpha: 1.0,
        }
    }
}

/// Raw, caller-supplied overrides. Every field is optional and unchecked.
///
/// Integer fields are signed so that negative input survives parsing and
/// gets clamped instead of rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ParamOverrides {
    pub conf: Option<f64>,
    pub iou: Option<f64>,
    pub mask_expand: Option<i64>,
    pub frame_stride: Option<i64>,
    pub max_det: Option<i64>,
    pub agnostic_nms: Option<bool>,
    pub blend_alpha: Option<f64>,
}

/// Merge `overrides` over `defaults` and clamp the result into range.
///
/// Never fails: out-of-range values snap to the nearest bound and missing or
/// non-finite values fall back to the (clamped) default.
pub fn resolve(overrides: &ParamOverrides, defaults: &ParamDefaults) -> ParamSet {
    let conf = pick_f32(overrides.conf, defaults.conf, CONF_RANGE);
    let iou = pick_f32(overrides.iou, defaults.iou, IOU_RANGE);
    let blend_alpha = pick_f32(overrides.blend_alpha, defaults.blend_alpha, BLEND_ALPHA_RANGE);

    let mask_expand = overrides
        .mask_expand
        .map(|v| v.clamp(0, i64::from(u32::MAX)) as u32)
        .unwrap_or(defaults.mask_expand);

    let frame_stride = overrides
        .frame_stride
        .map(|v| v.clamp(1, i64::from(u32::MAX)) as u32)
        .unwrap_or(defaults.frame_stride)
        .max(1);

    let (lo, hi) = MAX_DET_RANGE;
    let max_det = match overrides.max_det {
        Some(v) => Some(v.clamp(i64::from(lo), i64::from(hi)) as u32),
        None => defaults.max_det.map(|v| v.clamp(lo, hi)),
    };

    ParamSet {
        conf,
        iou,
        mask_expand,
        frame_stride,
        max_det,
        agnostic_nms: overrides.agnostic_nms.unwrap_or(defaults.agnostic_nms),
        blend_alpha,
    }
}

fn pick_f32(value: Option<f64>, default: f32, (lo, hi): (f32, f32)) -> f32 {
    let fallback = if default.is_finite() { default } else { lo };
    let v = match value {
        Some(v) if v.is_finite() => v as f32,
        _ => fallback,
    };
    lo.max(hi.min(v))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
