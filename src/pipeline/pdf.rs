//! pdfium work: text extraction, page rasterisation and raster compression.
//!
//! pdfium is a C++ library with thread-local state, so every operation runs
//! inside `tokio::task::spawn_blocking` and binds its own `Pdfium` instance.
//!
//! ## Compression
//!
//! An oversized PDF is rebuilt page by page: each page is rendered at a
//! reduced scale, passed through a lossy JPEG round-trip and placed as a
//! full-page image in a fresh document. Two passes exist:
//!
//! | Pass       | Scale | JPEG quality |
//! |------------|-------|--------------|
//! | standard   | 0.8   | 75           |
//! | aggressive | 0.6   | 50           |
//!
//! The aggressive pass only runs when the standard one is still above the
//! compression threshold. The smallest copy wins, and the original is kept
//! whenever compression does not shrink it.

use crate::error::PipelineError;
use crate::pipeline::encode;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A raster compression pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionPass {
    pub scale: f32,
    pub jpeg_quality: u8,
}

pub const STANDARD_PASS: CompressionPass = CompressionPass {
    scale: 0.8,
    jpeg_quality: 75,
};

pub const AGGRESSIVE_PASS: CompressionPass = CompressionPass {
    scale: 0.6,
    jpeg_quality: 50,
};

/// The copy of the source used by size-limited steps.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadCopy {
    pub path: PathBuf,
    pub bytes: u64,
    pub compressed: bool,
}

/// Extracted text of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfText {
    pub page_count: usize,
    /// Page texts joined in page order.
    pub text: String,
}

/// Bind pdfium from `PDFIUM_LIB_PATH`, the working directory, or the system.
fn bind_pdfium() -> Result<Pdfium, PipelineError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(p) if !p.is_empty() => {
            let p = PathBuf::from(p);
            let lib = if p.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&p)
            } else {
                p
            };
            Pdfium::bind_to_library(&lib)
        }
        _ => Pdfium::bind_to_library(&Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| PipelineError::PdfiumBindingFailed(format!("{e:?}")))?;
    Ok(Pdfium::new(bindings))
}

fn load<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, PipelineError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| PipelineError::Parse {
            path: path.to_path_buf(),
            detail: format!("{e:?}"),
        })
}

/// Extract the text of every page, in order.
pub async fn extract_text(pdf_path: &Path) -> Result<PdfText, PipelineError> {
    let path = pdf_path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_text_blocking(&path))
        .await
        .map_err(|e| PipelineError::Internal(format!("Text extraction task panicked: {e}")))?
}

fn extract_text_blocking(pdf_path: &Path) -> Result<PdfText, PipelineError> {
    let pdfium = bind_pdfium()?;
    let document = load(&pdfium, pdf_path)?;
    let pages = document.pages();
    let page_count = pages.len() as usize;

    let mut parts = Vec::with_capacity(page_count);
    for (idx, page) in pages.iter().enumerate() {
        match page.text() {
            Ok(text) => parts.push(text.all()),
            Err(e) => {
                warn!("Page {}: text extraction failed: {:?}", idx + 1, e);
                parts.push(String::new());
            }
        }
    }

    info!("Extracted text from {} pages", page_count);
    Ok(PdfText {
        page_count,
        text: join_pages(&parts),
    })
}

/// Join page texts with blank lines, skipping empty pages.
pub fn join_pages(pages: &[String]) -> String {
    pages
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Rasterise the first `count` pages, longest edge capped at `max_pixels`.
pub async fn render_page_images(
    pdf_path: &Path,
    count: usize,
    max_pixels: u32,
) -> Result<Vec<DynamicImage>, PipelineError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let path = pdf_path.to_path_buf();
    tokio::task::spawn_blocking(move || render_pages_blocking(&path, count, max_pixels))
        .await
        .map_err(|e| PipelineError::Internal(format!("Render task panicked: {e}")))?
}

fn render_pages_blocking(
    pdf_path: &Path,
    count: usize,
    max_pixels: u32,
) -> Result<Vec<DynamicImage>, PipelineError> {
    let pdfium = bind_pdfium()?;
    let document = load(&pdfium, pdf_path)?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut images = Vec::with_capacity(count);
    for (idx, page) in document.pages().iter().take(count).enumerate() {
        match page.render_with_config(&render_config) {
            Ok(bitmap) => {
                let image = bitmap.as_image();
                debug!("Rendered page {} → {}x{} px", idx + 1, image.width(), image.height());
                images.push(image);
            }
            Err(e) => warn!("Page {}: rasterisation failed: {:?}", idx + 1, e),
        }
    }
    Ok(images)
}

/// Rebuild `src` as a raster PDF at `dst`; returns the new file size.
pub async fn rasterize_pdf(
    src: &Path,
    dst: &Path,
    pass: CompressionPass,
) -> Result<u64, PipelineError> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    tokio::task::spawn_blocking(move || rasterize_blocking(&src, &dst, pass))
        .await
        .map_err(|e| PipelineError::Internal(format!("Compression task panicked: {e}")))?
}

fn rasterize_blocking(src: &Path, dst: &Path, pass: CompressionPass) -> Result<u64, PipelineError> {
    let pdfium = bind_pdfium()?;
    let source = load(&pdfium, src)?;
    let fail = |detail: String| PipelineError::Parse {
        path: src.to_path_buf(),
        detail,
    };

    let mut out = pdfium
        .create_new_pdf()
        .map_err(|e| fail(format!("create document: {e:?}")))?;
    let render_config = PdfRenderConfig::new().scale_page_by_factor(pass.scale);

    for (idx, page) in source.pages().iter().enumerate() {
        let (width, height) = (page.width(), page.height());
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| fail(format!("page {}: {e:?}", idx + 1)))?;
        let image = encode::reencode_jpeg(&bitmap.as_image(), pass.jpeg_quality)
            .map_err(|e| fail(format!("page {}: {e}", idx + 1)))?;

        let mut new_page = out
            .pages_mut()
            .create_page_at_end(PdfPagePaperSize::from_points(width, height))
            .map_err(|e| fail(format!("page {}: {e:?}", idx + 1)))?;
        new_page
            .objects_mut()
            .create_image_object(PdfPoints::ZERO, PdfPoints::ZERO, &image, Some(width), Some(height))
            .map_err(|e| fail(format!("page {}: {e:?}", idx + 1)))?;
    }

    out.save_to_file(dst)
        .map_err(|e| fail(format!("save: {e:?}")))?;

    std::fs::metadata(dst)
        .map(|m| m.len())
        .map_err(|e| PipelineError::OutputWriteFailed {
            path: dst.to_path_buf(),
            source: e,
        })
}

/// Pick the copy to upload given the original size and the compressed sizes
/// that succeeded. Returns the index into `candidates` (`None` = original)
/// and its size, or `Err(smallest)` when nothing fits under `limit`.
pub fn choose_upload(
    original: u64,
    candidates: &[u64],
    limit: u64,
) -> Result<(Option<usize>, u64), u64> {
    let best = candidates
        .iter()
        .enumerate()
        .filter(|(_, size)| **size < original)
        .min_by_key(|(_, size)| **size)
        .map(|(i, size)| (Some(i), *size))
        .unwrap_or((None, original));

    if best.1 > limit {
        Err(best.1)
    } else {
        Ok(best)
    }
}

/// Produce the upload copy of `pdf_path`, compressing into `scratch_dir` when
/// the source exceeds `threshold`.
pub async fn prepare_upload_copy(
    pdf_path: &Path,
    scratch_dir: &Path,
    threshold: u64,
    limit: u64,
) -> Result<UploadCopy, PipelineError> {
    let original = tokio::fs::metadata(pdf_path)
        .await
        .map_err(|_| PipelineError::FileNotFound {
            path: pdf_path.to_path_buf(),
        })?
        .len();

    let mut produced: Vec<(PathBuf, u64)> = Vec::new();
    if original > threshold {
        info!(
            "Source is {:.1} MiB, compressing",
            original as f64 / 1_048_576.0
        );
        for (name, pass) in [("standard", STANDARD_PASS), ("aggressive", AGGRESSIVE_PASS)] {
            if produced.iter().any(|(_, size)| *size <= threshold) {
                break;
            }
            let dst = scratch_dir.join(format!("compressed_{name}.pdf"));
            match rasterize_pdf(pdf_path, &dst, pass).await {
                Ok(size) => {
                    info!("{} compression: {} → {} bytes", name, original, size);
                    produced.push((dst, size));
                }
                Err(e) => warn!("{} compression failed: {}", name, e),
            }
        }
    }

    let sizes: Vec<u64> = produced.iter().map(|(_, s)| *s).collect();
    match choose_upload(original, &sizes, limit) {
        Ok((Some(i), bytes)) => Ok(UploadCopy {
            path: produced[i].0.clone(),
            bytes,
            compressed: true,
        }),
        Ok((None, bytes)) => Ok(UploadCopy {
            path: pdf_path.to_path_buf(),
            bytes,
            compressed: false,
        }),
        Err(smallest) => Err(PipelineError::SourceTooLarge {
            path: pdf_path.to_path_buf(),
            bytes: smallest,
            limit,
        }),
    }
}
