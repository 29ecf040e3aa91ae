//! Boundary diffusion inpainting.
//!
//! Masked pixels are filled from the outside in: every pass assigns each
//! unknown pixel touching a known one the mean of its known 8-neighbours.
//! A few relaxation passes then smooth the filled region before it is
//! blended over the original with `blend_alpha`.

use image::{GrayImage, Rgb, RgbImage};
use unmark_core::capability::Inpainter;
use unmark_core::error::InpaintError;

#[derive(Debug, Clone, Copy)]
pub struct DiffusionInpainter {
    /// Jacobi relaxation passes over the filled region.
    pub smoothing_passes: usize,
}

impl Default for DiffusionInpainter {
    fn default() -> Self {
        Self {
            smoothing_passes: 8,
        }
    }
}

const NEIGHBOURS: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

impl Inpainter for DiffusionInpainter {
    fn inpaint(
        &self,
        frame: &RgbImage,
        mask: &GrayImage,
        blend_alpha: f32,
    ) -> Result<RgbImage, InpaintError> {
        if frame.dimensions() != mask.dimensions() {
            return Err(InpaintError::DimensionMismatch {
                frame_w: frame.width(),
                frame_h: frame.height(),
                mask_w: mask.width(),
                mask_h: mask.height(),
            });
        }

        let (w, h) = frame.dimensions();
        let idx = |x: u32, y: u32| (y * w + x) as usize;
        let mut field: Vec<[f32; 3]> = frame
            .pixels()
            .map(|p| [f32::from(p[0]), f32::from(p[1]), f32::from(p[2])])
            .collect();
        let masked: Vec<bool> = mask.pixels().map(|m| m[0] != 0).collect();
        let mut known: Vec<bool> = masked.iter().map(|m| !m).collect();

        let mut pending: Vec<(u32, u32)> = mask
            .enumerate_pixels()
            .filter(|(_, _, m)| m[0] != 0)
            .map(|(x, y, _)| (x, y))
            .collect();
        let region = pending.clone();

        // onion peel
        while !pending.is_empty() {
            let mut filled = Vec::new();
            let mut rest = Vec::new();
            for &(x, y) in &pending {
                match mean_of(&field, w, h, x, y, |i| known[i]) {
                    Some(v) => filled.push((x, y, v)),
                    None => rest.push((x, y)),
                }
            }
            if filled.is_empty() {
                // no known pixel reachable (fully masked frame)
                break;
            }
            for (x, y, v) in filled {
                field[idx(x, y)] = v;
                known[idx(x, y)] = true;
            }
            pending = rest;
        }

        for _ in 0..self.smoothing_passes {
            let next: Vec<_> = region
                .iter()
                .filter(|&&(x, y)| known[idx(x, y)])
                .filter_map(|&(x, y)| {
                    mean_of(&field, w, h, x, y, |i| known[i]).map(|v| (idx(x, y), v))
                })
                .collect();
            for (i, v) in next {
                field[i] = v;
            }
        }

        let alpha = blend_alpha.clamp(0.0, 1.0);
        let mut out = frame.clone();
        for (x, y, px) in out.enumerate_pixels_mut() {
            let i = idx(x, y);
            if !masked[i] || !known[i] {
                continue;
            }
            let orig = *px;
            let fill = field[i];
            *px = Rgb(std::array::from_fn(|c| {
                (alpha * fill[c] + (1.0 - alpha) * f32::from(orig[c]))
                    .round()
                    .clamp(0.0, 255.0) as u8
            }));
        }
        Ok(out)
    }
}

fn mean_of(
    field: &[[f32; 3]],
    w: u32,
    h: u32,
    x: u32,
    y: u32,
    usable: impl Fn(usize) -> bool,
) -> Option<[f32; 3]> {
    let mut sum = [0.0f32; 3];
    let mut n = 0u32;
    for (dx, dy) in NEIGHBOURS {
        let (nx, ny) = (i64::from(x) + dx, i64::from(y) + dy);
        if nx < 0 || ny < 0 || nx >= i64::from(w) || ny >= i64::from(h) {
            continue;
        }
        let i = (ny as u32 * w + nx as u32) as usize;
        if usable(i) {
            for c in 0..3 {
                sum[c] += field[i][c];
            }
            n += 1;
        }
    }
    (n > 0).then(|| sum.map(|s| s / n as f32))
}
