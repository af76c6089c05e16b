//! Image encoding: JPEG re-encoding for compression and base64 page payloads.
//!
//! The planner receives a handful of page images alongside the extracted
//! text. JPEG keeps those payloads small; the same encoder drives the
//! raster compression of oversized PDFs in [`super::pdf`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use tracing::debug;

/// Quality used for planner page images.
pub const PAYLOAD_JPEG_QUALITY: u8 = 80;

/// Encode an image as JPEG at the given quality (1–100).
pub fn jpeg_bytes(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)))?;
    Ok(buf)
}

/// Round-trip through JPEG so the pixels carry the chosen quality loss.
pub fn reencode_jpeg(img: &DynamicImage, quality: u8) -> Result<DynamicImage, image::ImageError> {
    let bytes = jpeg_bytes(img, quality)?;
    image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg)
}

/// Encode a rasterised page as a base64 JPEG for the planner request.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let bytes = jpeg_bytes(img, PAYLOAD_JPEG_QUALITY)?;
    let b64 = STANDARD.encode(&bytes);
    debug!("Encoded page image → {} bytes base64", b64.len());
    Ok(ImageData::new(b64, "image/jpeg").with_detail("high"))
}
