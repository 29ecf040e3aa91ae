//! Rasterizing detected boxes into the run's shared inpainting mask.

use image::{GrayImage, Luma};

use crate::capability::BoundingBox;

pub const MASK_ON: Luma<u8> = Luma([255]);

/// Build one `width`x`height` binary mask covering every box grown by
/// `expand` pixels on each side. Boxes are clamped to the frame; degenerate
/// or non-finite boxes are skipped.
pub fn build_mask(boxes: &[BoundingBox], expand: u32, width: u32, height: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    let grow = i64::from(expand);

    for b in boxes {
        if ![b.x1, b.y1, b.x2, b.y2].iter().all(|v| v.is_finite()) {
            continue;
        }
        let x0 = clamp_edge(b.x1.floor() as i64 - grow, width);
        let y0 = clamp_edge(b.y1.floor() as i64 - grow, height);
        let x1 = clamp_edge(b.x2.ceil() as i64 + grow, width);
        let y1 = clamp_edge(b.y2.ceil() as i64 + grow, height);

        for y in y0..y1 {
            for x in x0..x1 {
                mask.put_pixel(x, y, MASK_ON);
            }
        }
    }
    mask
}

/// `true` when no pixel is selected, i.e. inpainting would be the identity.
pub fn is_empty(mask: &GrayImage) -> bool {
    mask.as_raw().iter().all(|&v| v == 0)
}

pub fn covered_pixels(mask: &GrayImage) -> usize {
    mask.as_raw().iter().filter(|&&v| v != 0).count()
}

fn clamp_edge(v: i64, limit: u32) -> u32 {
    v.clamp(0, i64::from(limit)) as u32
}
