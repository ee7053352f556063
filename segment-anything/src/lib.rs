use std::thread;

use anyhow::{Context, Result, bail};
use hf_hub::api::sync::{Api, ApiBuilder};
use image::RgbImage;
use ndarray::{Array1, Array2, Array3, Array4};
use ort::{inputs, session::Session};
use tracing::debug;

const HF_REPO: &str = "vietanhdev/segment-anything-onnx-models";

/// Side length of the encoder's square input frame. Prompt coordinates are
/// transformed into this frame; masks are decoded back at the original
/// resolution and the internal sizes never reach the caller.
const IMAGE_SIZE: u32 = 1024;
const MASK_INPUT_SIZE: usize = 256;

const PIXEL_MEAN: [f32; 3] = [123.675, 116.28, 103.53];
const PIXEL_STD: [f32; 3] = [58.395, 57.12, 57.375];

/// SAM prompt-point labels for a box encoded as its two corners.
const LABEL_TOP_LEFT: f32 = 2.0;
const LABEL_BOTTOM_RIGHT: f32 = 3.0;

/// Supported SAM backbone sizes, keyed the way the original checkpoint
/// registry names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    VitH,
    VitL,
    VitB,
}

impl ModelType {
    /// Checkpoint basename on the hub; encoder/decoder ONNX files share it.
    fn checkpoint(&self) -> &'static str {
        match self {
            ModelType::VitH => "sam_vit_h_4b8939",
            ModelType::VitL => "sam_vit_l_0b3195",
            ModelType::VitB => "sam_vit_b_01ec64",
        }
    }

    pub fn encoder_file(&self) -> String {
        format!("{}.encoder.onnx", self.checkpoint())
    }

    pub fn decoder_file(&self) -> String {
        format!("{}.decoder.onnx", self.checkpoint())
    }
}

impl std::str::FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vit_h" => Ok(ModelType::VitH),
            "vit_l" => Ok(ModelType::VitL),
            "vit_b" => Ok(ModelType::VitB),
            _ => Err(format!("Unknown model type: {s}. Use vit_h, vit_l or vit_b")),
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelType::VitH => write!(f, "vit_h"),
            ModelType::VitL => write!(f, "vit_l"),
            ModelType::VitB => write!(f, "vit_b"),
        }
    }
}

/// Binary segmentation mask at the source image's resolution,
/// flattened row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<bool>,
}

impl Mask {
    pub fn new(width: u32, height: u32, data: Vec<bool>) -> Self {
        assert_eq!(
            data.len(),
            (width * height) as usize,
            "Mask data size must match width * height"
        );
        Self { width, height, data }
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.data[(y * self.width + x) as usize]
    }

    pub fn pixel_count(&self) -> usize {
        self.data.iter().filter(|&&b| b).count()
    }
}

/// Encoder output cached between prompts against the same image.
struct ImageEmbedding {
    tensor: Array4<f32>,
    width: u32,
    height: u32,
}

/// Promptable segmenter backed by the SAM encoder/decoder ONNX export.
///
/// `set_image` runs the expensive image encoder once; every box prompt after
/// that reuses the cached embedding through the lightweight decoder.
pub struct Sam {
    encoder: Session,
    decoder: Session,
    embedding: Option<ImageEmbedding>,
}

impl Sam {
    pub fn new(model_type: ModelType) -> Result<Self> {
        let api = hub_api()?;
        let repo = api.model(HF_REPO.to_string());
        let encoder_path = repo
            .get(&model_type.encoder_file())
            .with_context(|| format!("Failed to download SAM {model_type} encoder"))?;
        let decoder_path = repo
            .get(&model_type.decoder_file())
            .with_context(|| format!("Failed to download SAM {model_type} decoder"))?;

        let encoder = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(thread::available_parallelism()?.get())?
            .commit_from_file(encoder_path)
            .context("Failed to load SAM encoder ONNX model")?;

        let decoder = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(thread::available_parallelism()?.get())?
            .commit_from_file(decoder_path)
            .context("Failed to load SAM decoder ONNX model")?;

        Ok(Self {
            encoder,
            decoder,
            embedding: None,
        })
    }

    /// Set the working image, computing and caching its embedding.
    pub fn set_image(&mut self, image: &RgbImage) -> Result<()> {
        let tensor = encoder_tensor(image);

        let inputs = inputs! {
            "image" => tensor.view(),
        }?;
        let outputs = self.encoder.run(inputs)?;
        let embedding = outputs["image_embeddings"].try_extract_tensor::<f32>()?;
        let embedding = embedding.view();

        let shape = embedding.shape();
        let tensor = Array4::from_shape_vec(
            (shape[0], shape[1], shape[2], shape[3]),
            embedding.iter().copied().collect(),
        )?;

        debug!(
            "SAM: cached image embedding {:?} for {}x{} image",
            tensor.shape(),
            image.width(),
            image.height()
        );

        self.embedding = Some(ImageEmbedding {
            tensor,
            width: image.width(),
            height: image.height(),
        });

        Ok(())
    }

    /// Decode one mask per box against the cached embedding. Masks come back
    /// at the original image resolution, aligned 1:1 with the input boxes.
    pub fn segment_boxes(&self, boxes: &[[f32; 4]]) -> Result<Vec<Mask>> {
        let Some(embedding) = &self.embedding else {
            bail!("No working image: call set_image before requesting masks");
        };

        let mut masks = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            masks.push(self.decode_box(embedding, *bbox)?);
        }
        Ok(masks)
    }

    fn decode_box(&self, embedding: &ImageEmbedding, bbox: [f32; 4]) -> Result<Mask> {
        let (coords, labels) = box_prompt(bbox, embedding.width, embedding.height);

        let mask_input = Array4::<f32>::zeros((1, 1, MASK_INPUT_SIZE, MASK_INPUT_SIZE));
        let has_mask_input = Array1::<f32>::zeros(1);
        let orig_im_size =
            Array1::from_vec(vec![embedding.height as f32, embedding.width as f32]);

        let inputs = inputs! {
            "image_embeddings" => embedding.tensor.view(),
            "point_coords" => coords.view(),
            "point_labels" => labels.view(),
            "mask_input" => mask_input.view(),
            "has_mask_input" => has_mask_input.view(),
            "orig_im_size" => orig_im_size.view(),
        }?;
        let outputs = self.decoder.run(inputs)?;

        let decoded = outputs["masks"].try_extract_tensor::<f32>()?;
        let decoded = decoded.view();

        let shape = decoded.shape();
        let (mask_h, mask_w) = (shape[2], shape[3]);
        if (mask_w as u32, mask_h as u32) != (embedding.width, embedding.height) {
            bail!(
                "SAM decoder returned a {mask_w}x{mask_h} mask for a {}x{} image",
                embedding.width,
                embedding.height
            );
        }

        // Single-mask decode: batch 0, candidate 0, thresholded at zero.
        let mut data = Vec::with_capacity(mask_w * mask_h);
        for y in 0..mask_h {
            for x in 0..mask_w {
                data.push(decoded[[0, 0, y, x]] > 0.0);
            }
        }

        Ok(Mask::new(embedding.width, embedding.height, data))
    }
}

fn hub_api() -> Result<Api> {
    let api = match std::env::var_os("LANGSAM_CACHE_DIR") {
        Some(dir) => ApiBuilder::new().with_cache_dir(dir.into()).build()?,
        None => Api::new()?,
    };
    Ok(api)
}

/// Scale a coordinate from the original image into the encoder's
/// longest-side-1024 frame.
pub fn transform_coords(x: f32, y: f32, width: u32, height: u32) -> (f32, f32) {
    let scale = IMAGE_SIZE as f32 / width.max(height) as f32;
    (x * scale, y * scale)
}

/// Encode a box as its two corner points with SAM's box-prompt labels,
/// transformed into the encoder frame.
fn box_prompt(bbox: [f32; 4], width: u32, height: u32) -> (Array3<f32>, Array2<f32>) {
    let [x1, y1, x2, y2] = bbox;
    let (tx1, ty1) = transform_coords(x1, y1, width, height);
    let (tx2, ty2) = transform_coords(x2, y2, width, height);

    let coords = Array3::from_shape_vec((1, 2, 2), vec![tx1, ty1, tx2, ty2])
        .expect("box prompt is always 2x2");
    let labels = Array2::from_shape_vec((1, 2), vec![LABEL_TOP_LEFT, LABEL_BOTTOM_RIGHT])
        .expect("box prompt is always 2 labels");

    (coords, labels)
}

/// Resize to the encoder frame (longest side 1024, zero-padded to square) and
/// normalize with SAM's pixel statistics.
fn encoder_tensor(image: &RgbImage) -> Array4<f32> {
    let scale = IMAGE_SIZE as f32 / image.width().max(image.height()) as f32;
    let w = ((image.width() as f32 * scale).round() as u32).max(1);
    let h = ((image.height() as f32 * scale).round() as u32).max(1);
    let resized = image::imageops::resize(image, w, h, image::imageops::FilterType::Triangle);

    let size = IMAGE_SIZE as usize;
    let mut tensor = Array4::zeros((1, 3, size, size));
    for c in 0..3 {
        let fill = (0.0 - PIXEL_MEAN[c]) / PIXEL_STD[c];
        tensor
            .index_axis_mut(ndarray::Axis(1), c)
            .fill(fill);
    }
    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel[c] as f32 - PIXEL_MEAN[c]) / PIXEL_STD[c];
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn mask_get_and_bounds() {
        let mask = Mask::new(2, 2, vec![true, false, true, false]);
        assert!(mask.get(0, 0));
        assert!(!mask.get(1, 0));
        assert!(!mask.get(10, 10));
    }

    #[test]
    fn mask_pixel_count() {
        let mask = Mask::new(2, 2, vec![true, false, true, false]);
        assert_eq!(mask.pixel_count(), 2);
        let empty = Mask::new(2, 2, vec![false; 4]);
        assert_eq!(empty.pixel_count(), 0);
    }

    #[test]
    #[should_panic(expected = "Mask data size must match")]
    fn mask_rejects_mismatched_data() {
        Mask::new(3, 3, vec![false; 4]);
    }

    #[test]
    fn coords_scale_by_longest_side() {
        // 2048x1024 image: scale is 1024/2048 = 0.5
        let (x, y) = transform_coords(100.0, 200.0, 2048, 1024);
        assert_eq!(x, 50.0);
        assert_eq!(y, 100.0);
    }

    #[test]
    fn coords_are_identity_at_encoder_size() {
        let (x, y) = transform_coords(512.0, 256.0, 1024, 768);
        assert_eq!(x, 512.0);
        assert_eq!(y, 256.0);
    }

    #[test]
    fn box_prompt_uses_corner_labels() {
        let (coords, labels) = box_prompt([10.0, 20.0, 30.0, 40.0], 1024, 1024);
        assert_eq!(coords.shape(), &[1, 2, 2]);
        assert_eq!(coords[[0, 0, 0]], 10.0);
        assert_eq!(coords[[0, 1, 1]], 40.0);
        assert_eq!(labels[[0, 0]], LABEL_TOP_LEFT);
        assert_eq!(labels[[0, 1]], LABEL_BOTTOM_RIGHT);
    }

    #[test]
    fn model_type_registry() {
        assert_eq!(ModelType::from_str("vit_h").unwrap(), ModelType::VitH);
        assert_eq!(ModelType::from_str("VIT_B").unwrap(), ModelType::VitB);
        assert!(ModelType::from_str("vit_x").is_err());
        assert_eq!(ModelType::VitL.encoder_file(), "sam_vit_l_0b3195.encoder.onnx");
        assert_eq!(ModelType::VitL.decoder_file(), "sam_vit_l_0b3195.decoder.onnx");
    }

    #[test]
    fn encoder_tensor_is_square_and_padded() {
        let image = RgbImage::from_pixel(512, 256, image::Rgb([255, 255, 255]));
        let tensor = encoder_tensor(&image);
        assert_eq!(tensor.shape(), &[1, 3, 1024, 1024]);

        // Image content lands in the top-left 1024x512 region...
        let white = (255.0 - PIXEL_MEAN[0]) / PIXEL_STD[0];
        assert!((tensor[[0, 0, 0, 0]] - white).abs() < 1e-4);
        // ...and the rest is normalized zero padding.
        let pad = (0.0 - PIXEL_MEAN[0]) / PIXEL_STD[0];
        assert!((tensor[[0, 0, 1000, 0]] - pad).abs() < 1e-4);
    }
}
