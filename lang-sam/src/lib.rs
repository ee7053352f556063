pub mod geo;
pub mod overlay;
pub mod render;
pub mod runtime;
pub mod session;

pub use grounding_dino::{BBox, Detection, GroundingDino};
pub use segment_anything::{Mask, ModelType, Sam};

pub use geo::{GeoReference, Raster};
pub use render::RenderOptions;
pub use runtime::Device;
pub use session::{BoxSegmenter, LangSam, PredictOptions, Prediction, Source, TextDetector};
