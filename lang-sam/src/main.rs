use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde_json::json;

use lang_sam::{Detection, Device, LangSam, ModelType, PredictOptions, RenderOptions, Source, runtime};

/// Segment objects in an image from a natural-language prompt.
#[derive(Parser, Debug)]
#[command(name = "lang-sam", version)]
struct Cli {
    /// Path or URL of the input image (GeoTIFF georeferencing is preserved)
    #[arg(long)]
    image: String,

    /// Text prompt describing the objects to segment
    #[arg(long)]
    prompt: String,

    /// Box confidence threshold
    #[arg(long = "box_threshold", default_value_t = 0.5)]
    box_threshold: f32,

    /// Text token confidence threshold
    #[arg(long = "text_threshold", default_value_t = 0.5)]
    text_threshold: f32,

    /// SAM backbone size
    #[arg(long, default_value = "vit_h")]
    model_type: ModelType,

    /// Output mask raster; a .tif extension keeps the input's georeference
    #[arg(long, default_value = "mask.tif")]
    output: PathBuf,

    /// Also save a rendered image with masks blended and boxes drawn
    #[arg(long)]
    annotated: Option<PathBuf>,

    /// Compute device
    #[arg(long, default_value = "cpu")]
    device: Device,

    /// Print detections as JSON instead of text
    #[arg(long)]
    json: bool,

    /// Verbose logging (can be repeated: -v, -vv)
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                log_level(cli.verbose)
                    .parse()
                    .unwrap_or_else(|_| "info".parse().unwrap()),
            ),
        )
        .init();

    runtime::init(cli.device)?;

    let mut session = LangSam::new(cli.model_type)?;

    let options = PredictOptions {
        box_threshold: cli.box_threshold,
        text_threshold: cli.text_threshold,
        output: Some(cli.output.clone()),
        ..Default::default()
    };

    let Some(prediction) = session.predict(Source::parse(&cli.image), &cli.prompt, &options)?
    else {
        println!("No objects found in the image.");
        return Ok(());
    };

    if cli.json {
        let detections: Vec<Detection> = prediction
            .boxes
            .iter()
            .zip(&prediction.scores)
            .zip(&prediction.phrases)
            .map(|((bbox, score), phrase)| Detection {
                bbox: *bbox,
                score: *score,
                phrase: phrase.clone(),
            })
            .collect();
        let report = json!({
            "image": cli.image,
            "prompt": cli.prompt,
            "output": cli.output,
            "epsg": prediction.georef.epsg_code(),
            "detections": detections,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Detections: {}", prediction.boxes.len());
        for (i, ((bbox, score), phrase)) in prediction
            .boxes
            .iter()
            .zip(&prediction.scores)
            .zip(&prediction.phrases)
            .enumerate()
        {
            println!(
                "  {}: {:?} ({:.2}) at ({:.0}, {:.0}, {:.0}, {:.0})",
                i + 1,
                phrase,
                score,
                bbox.x1,
                bbox.y1,
                bbox.x2,
                bbox.y2,
            );
        }
        println!("Wrote {}", cli.output.display());
    }

    if let Some(path) = &cli.annotated {
        session.show_annotations(path, &RenderOptions::default())?;
        println!("Wrote {}", path.display());
    }

    Ok(())
}
