//! Image validation and variant rendering.
//!
//! Pure CPU work; the pipeline runs it on the blocking pool.

use crate::config::{CropPolicy, NetworkConfig, SizeVariant};
use crate::error::{ArtworkError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader, Rgb, RgbImage};
use std::io::Cursor;

/// What was learned about an original without keeping it decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl ImageInfo {
    /// Preferred file extension for the detected format.
    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("img")
    }
}

fn malformed(url: &str, message: impl Into<String>) -> ArtworkError {
    ArtworkError::MalformedAsset {
        url: url.to_string(),
        message: message.into(),
    }
}

/// Sniff the format and check dimensions without a full decode.
pub fn inspect(url: &str, bytes: &[u8]) -> Result<ImageInfo> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| malformed(url, format!("unreadable image: {}", e)))?;
    let format = reader
        .format()
        .ok_or_else(|| malformed(url, "unrecognized image format"))?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| malformed(url, format!("undecodable image: {}", e)))?;

    if width < NetworkConfig::MIN_DIMENSION || height < NetworkConfig::MIN_DIMENSION {
        return Err(malformed(url, format!("image too small: {}x{}", width, height)));
    }
    if width > NetworkConfig::MAX_DIMENSION || height > NetworkConfig::MAX_DIMENSION {
        return Err(malformed(url, format!("image too large: {}x{}", width, height)));
    }

    Ok(ImageInfo {
        format,
        width,
        height,
    })
}

pub fn decode(url: &str, bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| malformed(url, format!("decode failed: {}", e)))
}

/// Composite onto white so transparent regions don't turn black in JPEG.
fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = a as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

/// Fit `image` into a `width`x`height` square per the crop policy.
pub fn fit(image: &DynamicImage, width: u32, height: u32, policy: CropPolicy) -> RgbImage {
    let flat = DynamicImage::ImageRgb8(flatten_onto_white(image));
    match policy {
        CropPolicy::CenterCrop => flat.resize_to_fill(width, height, FilterType::Lanczos3).to_rgb8(),
        CropPolicy::Letterbox => {
            let scaled = flat.resize(width, height, FilterType::Lanczos3).to_rgb8();
            let mut canvas = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
            let x = (width.saturating_sub(scaled.width()) / 2) as i64;
            let y = (height.saturating_sub(scaled.height()) / 2) as i64;
            imageops::overlay(&mut canvas, &scaled, x, y);
            canvas
        }
    }
}

/// Render one derived variant as JPEG bytes.
pub fn render_variant(
    url: &str,
    image: &DynamicImage,
    size: SizeVariant,
    policy: CropPolicy,
) -> Result<Vec<u8>> {
    let (width, height, quality) = match (size.dimensions(), size.jpeg_quality()) {
        (Some((width, height)), Some(quality)) => (width, height, quality),
        _ => return Err(ArtworkError::Other(format!("{} is not a derived variant", size))),
    };

    let rendered = if image.dimensions() == (width, height) && !image.color().has_alpha() {
        image.to_rgb8()
    } else {
        fit(image, width, height, policy)
    };

    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder
        .encode_image(&rendered)
        .map_err(|e| malformed(url, format!("encode failed: {}", e)))?;
    Ok(buf)
}

#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_fn(width, height, |x, _| {
        image::Rgba([(x % 255) as u8, 40, 200, if x % 2 == 0 { 255 } else { 0 }])
    });
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}
