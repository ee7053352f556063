//! Raster I/O that keeps georeferencing intact.
//!
//! TIFF sources are decoded directly with the `tiff` codec so the GeoTIFF
//! tags (pixel scale, tiepoints, geokeys) can be captured on read and written
//! back verbatim on export. Everything else goes through `image` and carries
//! no georeference.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use image::{GrayImage, RgbImage};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{TiffEncoder, colortype};
use tiff::tags::Tag;
use tracing::debug;

// GeoTIFF tag ids.
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_DOUBLE_PARAMS: u16 = 34736;
const GEO_ASCII_PARAMS: u16 = 34737;

// Geokey ids inside the key directory.
const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;

/// Captured GeoTIFF metadata, held raw so write-back reproduces the source
/// georeference exactly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoReference {
    pub pixel_scale: Option<Vec<f64>>,
    pub tiepoints: Option<Vec<f64>>,
    pub transformation: Option<Vec<f64>>,
    pub key_directory: Option<Vec<u16>>,
    pub double_params: Option<Vec<f64>>,
    pub ascii_params: Option<String>,
}

impl GeoReference {
    pub fn is_georeferenced(&self) -> bool {
        self.transformation.is_some() || (self.pixel_scale.is_some() && self.tiepoints.is_some())
    }

    /// The 6-parameter pixel-to-world transform `[a, b, c, d, e, f]` mapping
    /// (col, row) to `(a*col + b*row + c, d*col + e*row + f)`.
    pub fn affine(&self) -> Option<[f64; 6]> {
        if let Some(m) = &self.transformation {
            if m.len() >= 16 {
                return Some([m[0], m[1], m[3], m[4], m[5], m[7]]);
            }
        }

        let scale = self.pixel_scale.as_ref()?;
        let tie = self.tiepoints.as_ref()?;
        if scale.len() < 2 || tie.len() < 6 {
            return None;
        }

        let (sx, sy) = (scale[0], scale[1]);
        let (col, row, x, y) = (tie[0], tie[1], tie[3], tie[4]);
        // Row coordinates grow downward while world Y grows upward.
        Some([sx, 0.0, x - sx * col, 0.0, -sy, y + sy * row])
    }

    /// EPSG code of the projected (or, failing that, geographic) coordinate
    /// system from the geokey directory.
    pub fn epsg_code(&self) -> Option<u16> {
        let keys = self.key_directory.as_ref()?;
        let mut geographic = None;

        // Four-short header, then four-short key entries. Value fits in the
        // entry itself when the location field is zero.
        for entry in keys.chunks_exact(4).skip(1) {
            if entry[1] != 0 {
                continue;
            }
            match entry[0] {
                PROJECTED_CS_TYPE_KEY => return Some(entry[3]),
                GEOGRAPHIC_TYPE_KEY => geographic = Some(entry[3]),
                _ => {}
            }
        }
        geographic
    }
}

/// Decoded raster in (row, col, band) layout, with whatever georeference the
/// source carried.
#[derive(Debug, Clone)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub bands: usize,
    pub pixels: Vec<u8>,
    pub georef: GeoReference,
}

impl Raster {
    /// Open a raster file. A nonexistent path is a fatal input-validation
    /// error, raised here before any model is touched.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Input path {} does not exist.", path.display());
        }
        if is_tiff(path) {
            Self::open_tiff(path)
        } else {
            Self::open_plain(path)
        }
    }

    fn open_tiff(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut decoder = Decoder::new(BufReader::new(file))
            .with_context(|| format!("Failed to parse TIFF {}", path.display()))?;

        let (width, height) = decoder.dimensions()?;
        let georef = read_geo_tags(&mut decoder);

        let image = decoder.read_image()?;
        let pixels = match image {
            DecodingResult::U8(data) => data,
            _ => bail!(
                "Only 8-bit rasters are supported: {} has a wider sample format",
                path.display()
            ),
        };

        let plane = (width as usize) * (height as usize);
        if plane == 0 || pixels.len() % plane != 0 {
            bail!("Unexpected band layout in {}", path.display());
        }
        let bands = pixels.len() / plane;

        debug!(
            "Read {}x{} raster with {} band(s), georeferenced: {}",
            width,
            height,
            bands,
            georef.is_georeferenced()
        );

        Ok(Self {
            width,
            height,
            bands,
            pixels,
            georef,
        })
    }

    fn open_plain(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("Failed to open image {}", path.display()))?
            .to_rgb8();
        Ok(Self {
            width: image.width(),
            height: image.height(),
            bands: 3,
            pixels: image.into_raw(),
            georef: GeoReference::default(),
        })
    }

    /// Three-band color view for the models: extra bands (alpha) are dropped,
    /// a single band is replicated across the channels.
    pub fn to_rgb(&self) -> RgbImage {
        let mut rgb = RgbImage::new(self.width, self.height);
        for (x, y, pixel) in rgb.enumerate_pixels_mut() {
            let base = ((y * self.width + x) as usize) * self.bands;
            for c in 0..3 {
                pixel.0[c] = self.pixels[base + c.min(self.bands - 1)];
            }
        }
        rgb
    }
}

/// Write a single-band overlay. `.tif` targets become GeoTIFFs carrying the
/// captured tags; any other extension is encoded as a plain image.
pub fn write_overlay(path: &Path, overlay: &GrayImage, georef: &GeoReference) -> Result<()> {
    if is_tiff(path) {
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
        let mut image = encoder.new_image::<colortype::Gray8>(overlay.width(), overlay.height())?;
        write_geo_tags(image.encoder(), georef)?;
        image.write_data(overlay.as_raw())?;
    } else {
        overlay
            .save(path)
            .with_context(|| format!("Failed to save overlay to {}", path.display()))?;
    }

    debug!("Wrote overlay to {}", path.display());
    Ok(())
}

/// Fetch a URL source to a temporary file, preserving the extension so the
/// TIFF path detection still applies.
pub fn fetch_to_temp(url: &str) -> Result<tempfile::NamedTempFile> {
    let response = reqwest::blocking::get(url)
        .with_context(|| format!("Failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("Server rejected {url}"))?;
    let bytes = response.bytes()?;

    let suffix = url_extension(url).map(|extension| format!(".{extension}"));
    let mut builder = tempfile::Builder::new();
    if let Some(suffix) = &suffix {
        builder.suffix(suffix.as_str());
    }
    let mut file = builder.tempfile()?;
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(file)
}

fn is_tiff(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff")
    )
}

fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    let (_, extension) = name.rsplit_once('.')?;
    (!extension.is_empty()).then(|| extension.to_string())
}

fn read_geo_tags<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> GeoReference {
    // The decoder stores these GeoTIFF tags under their named `Tag` variants,
    // so lookups must use those rather than `Tag::Unknown(id)`.
    let f64_tag = |decoder: &mut Decoder<R>, tag: Tag| {
        decoder
            .find_tag(tag)
            .ok()
            .flatten()
            .and_then(|v| v.into_f64_vec().ok())
    };

    let pixel_scale = f64_tag(decoder, Tag::ModelPixelScaleTag);
    let tiepoints = f64_tag(decoder, Tag::ModelTiepointTag);
    let transformation = f64_tag(decoder, Tag::ModelTransformationTag);
    let double_params = f64_tag(decoder, Tag::GeoDoubleParamsTag);
    let key_directory = decoder
        .find_tag(Tag::GeoKeyDirectoryTag)
        .ok()
        .flatten()
        .and_then(|v| v.into_u16_vec().ok());
    let ascii_params = decoder
        .find_tag(Tag::GeoAsciiParamsTag)
        .ok()
        .flatten()
        .and_then(|v| v.into_string().ok());

    GeoReference {
        pixel_scale,
        tiepoints,
        transformation,
        key_directory,
        double_params,
        ascii_params,
    }
}

fn write_geo_tags<W, K>(
    encoder: &mut tiff::encoder::DirectoryEncoder<W, K>,
    georef: &GeoReference,
) -> Result<()>
where
    W: std::io::Write + std::io::Seek,
    K: tiff::encoder::TiffKind,
{
    if let Some(v) = &georef.pixel_scale {
        encoder.write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), v.as_slice())?;
    }
    if let Some(v) = &georef.tiepoints {
        encoder.write_tag(Tag::Unknown(MODEL_TIEPOINT), v.as_slice())?;
    }
    if let Some(v) = &georef.transformation {
        encoder.write_tag(Tag::Unknown(MODEL_TRANSFORMATION), v.as_slice())?;
    }
    if let Some(v) = &georef.key_directory {
        encoder.write_tag(Tag::Unknown(GEO_KEY_DIRECTORY), v.as_slice())?;
    }
    if let Some(v) = &georef.double_params {
        encoder.write_tag(Tag::Unknown(GEO_DOUBLE_PARAMS), v.as_slice())?;
    }
    if let Some(v) = &georef.ascii_params {
        encoder.write_tag(Tag::Unknown(GEO_ASCII_PARAMS), v.as_str())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// UTM zone 18N over a 10m-resolution tile, the shape of georeference the
    /// fixture imagery uses.
    fn sample_georef() -> GeoReference {
        GeoReference {
            pixel_scale: Some(vec![10.0, 10.0, 0.0]),
            tiepoints: Some(vec![0.0, 0.0, 0.0, 500_000.0, 4_650_000.0, 0.0]),
            transformation: None,
            key_directory: Some(vec![
                1, 1, 0, 2, // header: version, revision, minor, key count
                1024, 0, 1, 1, // GTModelTypeGeoKey = projected
                3072, 0, 1, 32618, // ProjectedCSTypeGeoKey = EPSG:32618
            ]),
            double_params: None,
            ascii_params: Some("WGS 84 / UTM zone 18N|".to_string()),
        }
    }

    #[test]
    fn affine_from_scale_and_tiepoint() {
        let affine = sample_georef().affine().unwrap();
        assert_eq!(affine, [10.0, 0.0, 500_000.0, 0.0, -10.0, 4_650_000.0]);
    }

    #[test]
    fn affine_prefers_model_transformation() {
        let mut georef = sample_georef();
        georef.transformation = Some(vec![
            5.0, 0.0, 0.0, 100.0, //
            0.0, -5.0, 0.0, 200.0, //
            0.0, 0.0, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ]);
        let affine = georef.affine().unwrap();
        assert_eq!(affine, [5.0, 0.0, 100.0, 0.0, -5.0, 200.0]);
    }

    #[test]
    fn affine_absent_without_georeference() {
        assert_eq!(GeoReference::default().affine(), None);
        assert!(!GeoReference::default().is_georeferenced());
    }

    #[test]
    fn epsg_code_from_key_directory() {
        assert_eq!(sample_georef().epsg_code(), Some(32618));
    }

    #[test]
    fn epsg_code_falls_back_to_geographic() {
        let mut georef = sample_georef();
        georef.key_directory = Some(vec![1, 1, 0, 1, 2048, 0, 1, 4326]);
        assert_eq!(georef.epsg_code(), Some(4326));
    }

    #[test]
    fn tiff_detection_is_case_insensitive() {
        assert!(is_tiff(Path::new("scene.tif")));
        assert!(is_tiff(Path::new("scene.TIFF")));
        assert!(!is_tiff(Path::new("scene.png")));
        assert!(!is_tiff(Path::new("scene")));
    }

    #[test]
    fn url_extension_ignores_query() {
        assert_eq!(
            url_extension("https://example.com/tiles/scene.tif?token=abc"),
            Some("tif".to_string())
        );
        assert_eq!(url_extension("https://example.com/scene"), None);
    }

    #[test]
    fn missing_path_is_fatal() {
        let err = Raster::open(Path::new("/no/such/raster.tif")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn overlay_roundtrip_preserves_georeference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.tif");

        let georef = sample_georef();
        let overlay = GrayImage::from_fn(8, 4, |x, _| image::Luma([if x < 4 { 255 } else { 0 }]));
        write_overlay(&path, &overlay, &georef).unwrap();

        let raster = Raster::open(&path).unwrap();
        assert_eq!((raster.width, raster.height, raster.bands), (8, 4, 1));
        assert_eq!(raster.georef, georef);
        assert_eq!(raster.georef.epsg_code(), Some(32618));
        assert_eq!(raster.pixels[0], 255);
        assert_eq!(raster.pixels[7], 0);
    }

    #[test]
    fn plain_extension_writes_plain_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");

        let overlay = GrayImage::from_pixel(4, 4, image::Luma([255]));
        write_overlay(&path, &overlay, &GeoReference::default()).unwrap();

        let raster = Raster::open(&path).unwrap();
        assert_eq!((raster.width, raster.height), (4, 4));
        assert!(!raster.georef.is_georeferenced());
    }

    #[test]
    fn single_band_replicates_into_rgb() {
        let raster = Raster {
            width: 2,
            height: 1,
            bands: 1,
            pixels: vec![10, 200],
            georef: GeoReference::default(),
        };
        let rgb = raster.to_rgb();
        assert_eq!(rgb.get_pixel(0, 0).0, [10, 10, 10]);
        assert_eq!(rgb.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn alpha_band_is_dropped() {
        let raster = Raster {
            width: 1,
            height: 1,
            bands: 4,
            pixels: vec![1, 2, 3, 4],
            georef: GeoReference::default(),
        };
        assert_eq!(raster.to_rgb().get_pixel(0, 0).0, [1, 2, 3]);
    }
}
