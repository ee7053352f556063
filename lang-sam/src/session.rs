//! The LangSam orchestrator: chain the text-prompted detector into the
//! box-prompted segmenter and composite the result into an overlay raster.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use grounding_dino::{BBox, Detection, GroundingDino};
use image::{GrayImage, RgbImage};
use segment_anything::{Mask, ModelType, Sam};
use tracing::info;

use crate::geo::{self, GeoReference, Raster};
use crate::overlay;
use crate::render::{self, RenderOptions};

/// Detector capability: image + free-text prompt to scored boxes.
/// Implemented by GroundingDINO and by deterministic stubs in tests.
pub trait TextDetector {
    fn detect(
        &self,
        image: &RgbImage,
        prompt: &str,
        box_threshold: f32,
        text_threshold: f32,
    ) -> Result<Vec<Detection>>;
}

/// Segmenter capability: image + boxes to one mask per box, at the image's
/// own resolution.
pub trait BoxSegmenter {
    fn segment(&mut self, image: &RgbImage, boxes: &[BBox]) -> Result<Vec<Mask>>;
}

impl TextDetector for GroundingDino {
    fn detect(
        &self,
        image: &RgbImage,
        prompt: &str,
        box_threshold: f32,
        text_threshold: f32,
    ) -> Result<Vec<Detection>> {
        GroundingDino::detect(self, image, prompt, box_threshold, text_threshold)
    }
}

impl BoxSegmenter for Sam {
    fn segment(&mut self, image: &RgbImage, boxes: &[BBox]) -> Result<Vec<Mask>> {
        // One embedding per prediction call; every box decodes against it.
        self.set_image(image)?;
        let raw: Vec<[f32; 4]> = boxes.iter().map(|b| [b.x1, b.y1, b.x2, b.y2]).collect();
        self.segment_boxes(&raw)
    }
}

/// Where a prediction's image comes from.
pub enum Source {
    Path(PathBuf),
    Url(String),
    Image(RgbImage),
}

impl Source {
    /// Interpret a CLI-style string: anything starting with an HTTP scheme is
    /// a URL, the rest are local paths.
    pub fn parse(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            Source::Url(s.to_string())
        } else {
            Source::Path(PathBuf::from(s))
        }
    }
}

impl From<RgbImage> for Source {
    fn from(image: RgbImage) -> Self {
        Source::Image(image)
    }
}

#[derive(Debug, Clone)]
pub struct PredictOptions {
    pub box_threshold: f32,
    pub text_threshold: f32,
    pub mask_multiplier: u8,
    /// Overlay raster written on success when set; skipped on zero detections.
    pub output: Option<PathBuf>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            box_threshold: 0.5,
            text_threshold: 0.5,
            mask_multiplier: overlay::DEFAULT_MASK_MULTIPLIER,
            output: None,
        }
    }
}

/// Immutable result of one successful prediction. The box, score, phrase and
/// mask sequences are aligned index-for-index and always the same length.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub image: RgbImage,
    pub georef: GeoReference,
    pub boxes: Vec<BBox>,
    pub scores: Vec<f32>,
    pub phrases: Vec<String>,
    pub masks: Vec<Mask>,
    pub overlay: GrayImage,
}

/// Text-prompted segmentation session.
///
/// Models load once at construction and are reused across predictions; a
/// prediction runs detection then segmentation synchronously, so one session
/// supports a single in-flight prediction at a time (`&mut self`). The latest
/// successful prediction is cached for `show_annotations`; a failed or empty
/// run leaves the cache untouched.
pub struct LangSam<D = GroundingDino, S = Sam> {
    detector: D,
    segmenter: S,
    latest: Option<Prediction>,
    last_run_empty: bool,
}

impl LangSam {
    /// Build the session with the real models; weights download on first use.
    pub fn new(model_type: ModelType) -> Result<Self> {
        let detector = GroundingDino::new().context("Failed to build the detector")?;
        let segmenter = Sam::new(model_type).context("Failed to build the segmenter")?;
        Ok(Self::with_models(detector, segmenter))
    }
}

impl<D: TextDetector, S: BoxSegmenter> LangSam<D, S> {
    pub fn with_models(detector: D, segmenter: S) -> Self {
        Self {
            detector,
            segmenter,
            latest: None,
            last_run_empty: false,
        }
    }

    /// Run a prediction. `Ok(None)` means the detector matched nothing, which
    /// is a valid outcome, not an error; no output file is written and the
    /// cached result is unchanged.
    pub fn predict(
        &mut self,
        source: Source,
        prompt: &str,
        options: &PredictOptions,
    ) -> Result<Option<Prediction>> {
        let (image, georef) = load_source(source)?;

        let detections = self.detector.detect(
            &image,
            prompt,
            options.box_threshold,
            options.text_threshold,
        )?;

        if detections.is_empty() {
            info!("No objects found in the image.");
            self.last_run_empty = true;
            return Ok(None);
        }

        let boxes: Vec<BBox> = detections.iter().map(|d| d.bbox).collect();
        let masks = self.segmenter.segment(&image, &boxes)?;
        if masks.len() != boxes.len() {
            bail!(
                "Segmenter returned {} masks for {} boxes",
                masks.len(),
                boxes.len()
            );
        }
        for mask in &masks {
            if (mask.width, mask.height) != (image.width(), image.height()) {
                bail!(
                    "Segmenter returned a {}x{} mask for a {}x{} image",
                    mask.width,
                    mask.height,
                    image.width(),
                    image.height()
                );
            }
        }

        let accumulator = overlay::compose(&masks, image.width(), image.height());
        let overlay = overlay::binarize(&accumulator, options.mask_multiplier);

        if let Some(path) = &options.output {
            geo::write_overlay(path, &overlay, &georef)
                .with_context(|| format!("Failed to write overlay to {}", path.display()))?;
        }

        let prediction = Prediction {
            image,
            georef,
            boxes,
            scores: detections.iter().map(|d| d.score).collect(),
            phrases: detections.into_iter().map(|d| d.phrase).collect(),
            masks,
            overlay,
        };

        self.last_run_empty = false;
        self.latest = Some(prediction.clone());
        Ok(Some(prediction))
    }

    /// Latest successful prediction, if any.
    pub fn latest(&self) -> Option<&Prediction> {
        self.latest.as_ref()
    }

    /// Save the annotated rendering of the latest prediction. Without one
    /// this logs a message and returns cleanly instead of erroring.
    pub fn show_annotations(&self, output: &Path, options: &RenderOptions) -> Result<()> {
        let Some(prediction) = &self.latest else {
            if self.last_run_empty {
                info!("No objects found in the image.");
            } else {
                info!("Please run predict() first.");
            }
            return Ok(());
        };

        render::save_annotations(
            output,
            &prediction.image,
            &prediction.overlay,
            &prediction.boxes,
            options,
        )
    }
}

fn load_source(source: Source) -> Result<(RgbImage, GeoReference)> {
    match source {
        Source::Url(url) => {
            // Keep the temp file alive until the raster is decoded.
            let file = geo::fetch_to_temp(&url)?;
            let raster = Raster::open(file.path())?;
            Ok((raster.to_rgb(), raster.georef))
        }
        Source::Path(path) => {
            let raster = Raster::open(&path)?;
            Ok((raster.to_rgb(), raster.georef))
        }
        Source::Image(image) => Ok((image, GeoReference::default())),
    }
}
