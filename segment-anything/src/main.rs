use clap::Parser;
use segment_anything::{ModelType, Sam};

#[derive(Parser)]
struct Args {
    #[arg(long)]
    image: String,

    /// Box prompt as x1,y1,x2,y2 in pixel coordinates
    #[arg(long, value_delimiter = ',', num_args = 1..=4, required = true)]
    r#box: Vec<f32>,

    #[arg(long, default_value = "vit_b")]
    model_type: ModelType,

    #[arg(long, default_value = "mask.png")]
    output: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let image = image::open(&args.image)
        .map_err(|e| anyhow::anyhow!("Failed to open image: {e}"))?
        .to_rgb8();

    let mut sam = Sam::new(args.model_type)?;
    sam.set_image(&image)?;

    let bbox = [args.r#box[0], args.r#box[1], args.r#box[2], args.r#box[3]];
    let masks = sam.segment_boxes(&[bbox])?;
    let mask = &masks[0];

    let mut out = image::GrayImage::new(mask.width, mask.height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        pixel.0[0] = if mask.get(x, y) { 255 } else { 0 };
    }
    out.save(&args.output)
        .map_err(|e| anyhow::anyhow!("Failed to save mask: {e}"))?;

    println!(
        "Saved mask to {} ({} foreground pixels)",
        args.output,
        mask.pixel_count()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_argument_is_required() {
        let result = Args::try_parse_from(["segment-anything", "--image", "scene.png"]);
        assert!(result.is_err());
    }

    #[test]
    fn box_argument_parses_four_coordinates() {
        let args = Args::try_parse_from([
            "segment-anything",
            "--image",
            "scene.png",
            "--box",
            "1,2,3,4",
        ])
        .unwrap();
        assert_eq!(args.r#box, [1.0, 2.0, 3.0, 4.0]);
    }
}
