//! Merging per-detection masks into a single label raster.

use image::GrayImage;
use segment_anything::Mask;

pub const DEFAULT_MASK_MULTIPLIER: u8 = 255;

/// Sum masks into an integer label plane: pixels of mask `i` contribute
/// `i + 1`. Where masks overlap the labels add up (with 8-bit wraparound)
/// instead of one winning; the binarization step collapses the distinction,
/// so the summed value is kept as-is.
pub fn compose(masks: &[Mask], width: u32, height: u32) -> GrayImage {
    let mut accumulator = GrayImage::new(width, height);
    for (i, mask) in masks.iter().enumerate() {
        let label = (i + 1) as u8;
        for (x, y, pixel) in accumulator.enumerate_pixels_mut() {
            if mask.get(x, y) {
                pixel.0[0] = pixel.0[0].wrapping_add(label);
            }
        }
    }
    accumulator
}

/// Collapse the label accumulator into a foreground/background raster:
/// any covered pixel becomes `multiplier`, the rest stay zero.
pub fn binarize(accumulator: &GrayImage, multiplier: u8) -> GrayImage {
    let mut out = GrayImage::new(accumulator.width(), accumulator.height());
    for (source, target) in accumulator.pixels().zip(out.pixels_mut()) {
        target.0[0] = if source.0[0] > 0 { multiplier } else { 0 };
    }
    out
}
