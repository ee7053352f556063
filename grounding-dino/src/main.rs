use clap::Parser;
use grounding_dino::GroundingDino;

#[derive(Parser)]
struct Args {
    #[arg(long)]
    image: String,

    #[arg(long)]
    prompt: String,

    #[arg(long, default_value_t = 0.3)]
    box_threshold: f32,

    #[arg(long, default_value_t = 0.25)]
    text_threshold: f32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let detector = GroundingDino::new()?;

    let image = image::open(&args.image)
        .map_err(|e| anyhow::anyhow!("Failed to open image: {e}"))?
        .to_rgb8();

    let detections = detector.detect(&image, &args.prompt, args.box_threshold, args.text_threshold)?;

    println!("Detections: {}", detections.len());
    for (i, detection) in detections.iter().enumerate() {
        println!(
            "  {}: {:?} ({:.2}) at ({:.0}, {:.0}, {:.0}, {:.0})",
            i + 1,
            detection.phrase,
            detection.score,
            detection.bbox.x1,
            detection.bbox.y1,
            detection.bbox.x2,
            detection.bbox.y2,
        );
    }

    Ok(())
}
