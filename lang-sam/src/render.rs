//! Rendering predictions for human inspection: source image with the mask
//! overlay alpha-blended on top and box outlines drawn around detections.

use std::path::Path;

use anyhow::{Context, Result};
use grounding_dino::BBox;
use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

/// Foreground color near the top of the viridis ramp.
const OVERLAY_COLOR: Rgb<u8> = Rgb([253, 231, 37]);
const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub alpha: f32,
    pub overlay_color: Rgb<u8>,
    pub draw_boxes: bool,
    pub box_color: Rgb<u8>,
    pub box_linewidth: u32,
    /// Blend the overlay onto the source image; when false, the overlay is
    /// rendered on a black canvas by itself.
    pub blend: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            alpha: 0.4,
            overlay_color: OVERLAY_COLOR,
            draw_boxes: true,
            box_color: BOX_COLOR,
            box_linewidth: 1,
            blend: true,
        }
    }
}

/// Compose the annotated image.
pub fn render(
    image: &RgbImage,
    overlay: &GrayImage,
    boxes: &[BBox],
    options: &RenderOptions,
) -> RgbImage {
    let mut canvas = if options.blend {
        image.clone()
    } else {
        RgbImage::new(image.width(), image.height())
    };

    let alpha = options.alpha.clamp(0.0, 1.0);
    for (x, y, pixel) in canvas.enumerate_pixels_mut() {
        if overlay.get_pixel(x, y).0[0] == 0 {
            continue;
        }
        for c in 0..3 {
            let base = pixel.0[c] as f32;
            let top = options.overlay_color.0[c] as f32;
            pixel.0[c] = (base * (1.0 - alpha) + top * alpha).round() as u8;
        }
    }

    if options.draw_boxes {
        for bbox in boxes {
            draw_box_outline(&mut canvas, bbox, options.box_color, options.box_linewidth);
        }
    }

    canvas
}

/// Render and save in one step; the format follows the output extension.
pub fn save_annotations(
    path: &Path,
    image: &RgbImage,
    overlay: &GrayImage,
    boxes: &[BBox],
    options: &RenderOptions,
) -> Result<()> {
    render(image, overlay, boxes, options)
        .save(path)
        .with_context(|| format!("Failed to save annotated image to {}", path.display()))
}

/// Unfilled rectangle outline; line width is built from nested 1px rects.
fn draw_box_outline(canvas: &mut RgbImage, bbox: &BBox, color: Rgb<u8>, linewidth: u32) {
    for k in 0..linewidth.max(1) as i32 {
        let x = bbox.x1.round() as i32 + k;
        let y = bbox.y1.round() as i32 + k;
        let w = bbox.width().round() as i32 - 2 * k;
        let h = bbox.height().round() as i32 - 2 * k;
        if w <= 0 || h <= 0 {
            break;
        }
        draw_hollow_rect_mut(canvas, Rect::at(x, y).of_size(w as u32, h as u32), color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (RgbImage, GrayImage) {
        let image = RgbImage::from_pixel(10, 10, Rgb([100, 100, 100]));
        let mut overlay = GrayImage::new(10, 10);
        overlay.put_pixel(5, 5, image::Luma([255]));
        (image, overlay)
    }

    #[test]
    fn covered_pixels_are_blended() {
        let (image, overlay) = setup();
        let options = RenderOptions {
            draw_boxes: false,
            ..Default::default()
        };
        let out = render(&image, &overlay, &[], &options);

        // Uncovered pixel untouched, covered pixel pulled toward the
        // overlay color.
        assert_eq!(out.get_pixel(0, 0).0, [100, 100, 100]);
        assert_ne!(out.get_pixel(5, 5).0, [100, 100, 100]);
        let expected_r = (100.0 * 0.6 + 253.0 * 0.4_f32).round() as u8;
        assert_eq!(out.get_pixel(5, 5).0[0], expected_r);
    }

    #[test]
    fn unblended_render_starts_from_black() {
        let (image, overlay) = setup();
        let options = RenderOptions {
            blend: false,
            draw_boxes: false,
            ..Default::default()
        };
        let out = render(&image, &overlay, &[], &options);
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0]);
        assert!(out.get_pixel(5, 5).0[0] > 0);
    }

    #[test]
    fn boxes_are_outlines_not_fills() {
        let (image, overlay) = setup();
        let bbox = BBox {
            x1: 2.0,
            y1: 2.0,
            x2: 8.0,
            y2: 8.0,
        };
        let out = render(&image, &overlay, &[bbox], &RenderOptions::default());

        assert_eq!(out.get_pixel(2, 2).0, [255, 0, 0]);
        assert_eq!(out.get_pixel(2, 7).0, [255, 0, 0]);
        // Interior stays untouched.
        assert_eq!(out.get_pixel(4, 4).0, [100, 100, 100]);
    }

    #[test]
    fn degenerate_box_does_not_panic() {
        let (image, overlay) = setup();
        let bbox = BBox {
            x1: 3.0,
            y1: 3.0,
            x2: 3.0,
            y2: 3.0,
        };
        let options = RenderOptions {
            box_linewidth: 3,
            ..Default::default()
        };
        let _ = render(&image, &overlay, &[bbox], &options);
    }

    #[test]
    fn saves_to_disk() {
        let (image, overlay) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annotated.png");
        save_annotations(&path, &image, &overlay, &[], &RenderOptions::default()).unwrap();
        assert!(path.exists());
    }
}
