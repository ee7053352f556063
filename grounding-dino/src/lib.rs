use std::thread;

use anyhow::{Context, Result};
use hf_hub::api::sync::{Api, ApiBuilder};
use image::RgbImage;
use ndarray::{Array2, Array4, ArrayViewD, s};
use ort::{inputs, session::Session};
use serde::Serialize;
use tracing::debug;

mod tokenizer;

pub use tokenizer::WordPieceTokenizer;

const HF_REPO: &str = "onnx-community/grounding-dino-tiny-ONNX";
const MODEL_FILE: &str = "onnx/model.onnx";
const VOCAB_FILE: &str = "vocab.txt";

/// GroundingDINO image transform: shorter side resized to 800, longer side
/// capped at 1333, aspect ratio preserved.
const TARGET_SIZE: u32 = 800;
const MAX_SIZE: u32 = 1333;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Bounding box in absolute pixel corner coordinates (x1, y1, x2, y2).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// One detected region: box in the original image's pixel space, confidence,
/// and the prompt phrase that matched.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub bbox: BBox,
    pub score: f32,
    pub phrase: String,
}

/// Open-vocabulary detector backed by the GroundingDINO ONNX export.
pub struct GroundingDino {
    session: Session,
    tokenizer: WordPieceTokenizer,
}

impl GroundingDino {
    /// Download the checkpoint and vocabulary from the Hugging Face hub and
    /// build the inference session. Any download or checkpoint failure is
    /// fatal; there is no degraded mode.
    pub fn new() -> Result<Self> {
        let api = hub_api()?;
        let repo = api.model(HF_REPO.to_string());
        let model_path = repo
            .get(MODEL_FILE)
            .context("Failed to download GroundingDINO model")?;
        let vocab_path = repo
            .get(VOCAB_FILE)
            .context("Failed to download GroundingDINO vocabulary")?;

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(thread::available_parallelism()?.get())?
            .commit_from_file(model_path)
            .context("Failed to load GroundingDINO ONNX model")?;

        let tokenizer = WordPieceTokenizer::from_file(&vocab_path)?;

        Ok(Self { session, tokenizer })
    }

    /// Detect regions matching a free-text prompt.
    ///
    /// Boxes come back in the original image's pixel coordinates, never the
    /// internal resized frame. An empty vector is a valid result.
    pub fn detect(
        &self,
        image: &RgbImage,
        prompt: &str,
        box_threshold: f32,
        text_threshold: f32,
    ) -> Result<Vec<Detection>> {
        let caption = canonicalize_caption(prompt);
        let encoding = self.tokenizer.encode(&caption);
        let seq_len = encoding.ids.len();

        let pixel_values = image_tensor(image);
        let input_ids = Array2::from_shape_vec((1, seq_len), encoding.ids.clone())?;
        let attention_mask = Array2::<i64>::ones((1, seq_len));
        let token_type_ids = Array2::<i64>::zeros((1, seq_len));

        let inputs = inputs! {
            "pixel_values" => pixel_values.view(),
            "input_ids" => input_ids.view(),
            "attention_mask" => attention_mask.view(),
            "token_type_ids" => token_type_ids.view(),
        }?;
        let outputs = self.session.run(inputs)?;

        let logits = outputs["logits"].try_extract_tensor::<f32>()?;
        let pred_boxes = outputs["pred_boxes"].try_extract_tensor::<f32>()?;

        let detections = collect_detections(
            &self.tokenizer,
            &encoding,
            logits.view(),
            pred_boxes.view(),
            box_threshold,
            text_threshold,
            image.width() as f32,
            image.height() as f32,
        );

        debug!(
            "GroundingDINO: {} detection(s) for prompt {caption:?}",
            detections.len()
        );

        Ok(detections)
    }
}

/// Score and convert the model's raw outputs into detections. The logit text
/// axis has a fixed number of slots; a prompt that tokenizes past it is scored
/// on the slots that exist rather than indexing out of bounds.
fn collect_detections(
    tokenizer: &WordPieceTokenizer,
    encoding: &tokenizer::Encoding,
    logits: ArrayViewD<f32>,
    pred_boxes: ArrayViewD<f32>,
    box_threshold: f32,
    text_threshold: f32,
    width: f32,
    height: f32,
) -> Vec<Detection> {
    let num_queries = logits.shape()[1];
    let text_len = encoding.ids.len().min(logits.shape()[2]);

    let mut detections = Vec::new();
    for q in 0..num_queries {
        let token_logits = logits.slice(s![0, q, ..text_len]);

        let score = token_logits
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        let score = sigmoid(score);
        if score < box_threshold {
            continue;
        }

        let phrase = extract_phrase(
            tokenizer,
            encoding,
            token_logits.iter().copied(),
            text_threshold,
        );

        let bbox = cxcywh_to_xyxy(
            [
                pred_boxes[[0, q, 0]],
                pred_boxes[[0, q, 1]],
                pred_boxes[[0, q, 2]],
                pred_boxes[[0, q, 3]],
            ],
            width,
            height,
        );

        detections.push(Detection { bbox, score, phrase });
    }

    detections
}

/// Join the prompt tokens whose sigmoid logit clears the text threshold,
/// skipping [CLS]/[SEP] and reattaching subword pieces.
fn extract_phrase(
    tokenizer: &WordPieceTokenizer,
    encoding: &tokenizer::Encoding,
    token_logits: impl Iterator<Item = f32>,
    text_threshold: f32,
) -> String {
    let mut phrase = String::new();
    for ((logit, id), token) in token_logits.zip(&encoding.ids).zip(&encoding.tokens) {
        if tokenizer.is_special(*id) || sigmoid(logit) < text_threshold {
            continue;
        }
        if let Some(rest) = token.strip_prefix("##") {
            phrase.push_str(rest);
        } else {
            if !phrase.is_empty() {
                phrase.push(' ');
            }
            phrase.push_str(token);
        }
    }
    phrase
}

fn hub_api() -> Result<Api> {
    let api = match std::env::var_os("LANGSAM_CACHE_DIR") {
        Some(dir) => ApiBuilder::new().with_cache_dir(dir.into()).build()?,
        None => Api::new()?,
    };
    Ok(api)
}

/// GroundingDINO canonicalizes captions to lowercase with a trailing period.
fn canonicalize_caption(prompt: &str) -> String {
    let mut caption = prompt.trim().to_lowercase();
    if !caption.ends_with('.') {
        caption.push('.');
    }
    caption
}

/// Resized dimensions for the detector's input frame.
pub fn resize_dims(width: u32, height: u32) -> (u32, u32) {
    let (short, long) = if width <= height {
        (width, height)
    } else {
        (height, width)
    };

    let mut scale = TARGET_SIZE as f64 / short as f64;
    if (long as f64 * scale).round() as u32 > MAX_SIZE {
        scale = MAX_SIZE as f64 / long as f64;
    }

    let w = (width as f64 * scale).round().max(1.0) as u32;
    let h = (height as f64 * scale).round().max(1.0) as u32;
    (w, h)
}

/// Resize and ImageNet-normalize into an NCHW f32 tensor.
fn image_tensor(image: &RgbImage) -> Array4<f32> {
    let (w, h) = resize_dims(image.width(), image.height());
    let resized = image::imageops::resize(image, w, h, image::imageops::FilterType::Triangle);

    let mut tensor = Array4::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    tensor
}

/// Convert a normalized center-size box to absolute corner coordinates in the
/// original image's pixel space.
pub fn cxcywh_to_xyxy(cxcywh: [f32; 4], width: f32, height: f32) -> BBox {
    let [cx, cy, w, h] = cxcywh;
    BBox {
        x1: (cx - w / 2.0) * width,
        y1: (cy - h / 2.0) * height,
        x2: (cx + w / 2.0) * width,
        y2: (cy + h / 2.0) * height,
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
