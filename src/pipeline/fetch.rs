//! Source Fetcher: resolve, verify, size-limit and read the paper.

use crate::error::PipelineError;
use crate::job::SourceRef;
use crate::pipeline::input::{self, ResolvedInput};
use crate::pipeline::pdf::{self, UploadCopy};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// A fetched paper, ready for planning.
pub struct SourceDocument {
    /// Page-ordered extracted text.
    pub text: String,
    pub page_count: usize,
    /// Copy respecting the upload bound (compressed or original).
    pub upload: UploadCopy,
    /// Keeps a downloaded source's temp dir alive.
    _resolved: Option<ResolvedInput>,
}

impl SourceDocument {
    pub fn new(text: impl Into<String>, page_count: usize, upload: UploadCopy) -> Self {
        Self {
            text: text.into(),
            page_count,
            upload,
            _resolved: None,
        }
    }
}

/// Acquisition strategy for the pipeline's input.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch `source`; scratch files go under `scratch_dir`.
    async fn fetch(
        &self,
        source: &SourceRef,
        scratch_dir: &Path,
    ) -> Result<SourceDocument, PipelineError>;
}

/// Fetcher backed by reqwest downloads and pdfium.
#[derive(Debug, Clone)]
pub struct PdfSourceFetcher {
    pub download_timeout_secs: u64,
    pub compress_threshold_bytes: u64,
    pub max_upload_bytes: u64,
}

impl PdfSourceFetcher {
    pub fn from_config(config: &crate::config::PipelineConfig) -> Self {
        Self {
            download_timeout_secs: config.download_timeout_secs,
            compress_threshold_bytes: config.compress_threshold_bytes,
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

#[async_trait]
impl SourceFetcher for PdfSourceFetcher {
    async fn fetch(
        &self,
        source: &SourceRef,
        scratch_dir: &Path,
    ) -> Result<SourceDocument, PipelineError> {
        let resolved = input::resolve_source(source, self.download_timeout_secs).await?;
        let pdf_path: PathBuf = resolved.path().to_path_buf();

        // Size policy first: an oversized paper fails before any model call.
        let upload = pdf::prepare_upload_copy(
            &pdf_path,
            scratch_dir,
            self.compress_threshold_bytes,
            self.max_upload_bytes,
        )
        .await?;

        let extracted = pdf::extract_text(&pdf_path).await?;
        info!(
            "Fetched '{}': {} pages, {} chars, upload copy {} bytes{}",
            source,
            extracted.page_count,
            extracted.text.len(),
            upload.bytes,
            if upload.compressed { " (compressed)" } else { "" }
        );

        Ok(SourceDocument {
            text: extracted.text,
            page_count: extracted.page_count,
            upload,
            _resolved: Some(resolved),
        })
    }
}
