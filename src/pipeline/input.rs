//! Source acquisition: turn a [`SourceRef`] into a local, verified PDF file.
//!
//! pdfium needs a file-system path, so URLs are downloaded into a `TempDir`
//! owned by the returned [`ResolvedInput`]; the directory is removed when
//! the value is dropped. Both paths check the `%PDF` magic bytes before
//! returning so a bad source fails with a parse error rather than a pdfium
//! crash later on.

use crate::error::PipelineError;
use crate::job::SourceRef;
use std::io::Read;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// The resolved source: a local path or a downloaded temp file.
pub enum ResolvedInput {
    Local(PathBuf),
    /// The `TempDir` is kept alive until processing completes.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a source to a local PDF file.
pub async fn resolve_source(
    source: &SourceRef,
    timeout_secs: u64,
) -> Result<ResolvedInput, PipelineError> {
    match source {
        SourceRef::Url(url) if is_url(url) => download_url(url, timeout_secs).await,
        SourceRef::Url(other) => Err(PipelineError::InvalidInput {
            input: other.clone(),
        }),
        SourceRef::File(path) => resolve_local(path),
    }
}

/// Validate existence, readability and PDF magic bytes of a local file.
fn resolve_local(path: &Path) -> Result<ResolvedInput, PipelineError> {
    let path = path.to_path_buf();

    if !path.exists() {
        return Err(PipelineError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            let n = f.read(&mut magic).unwrap_or(0);
            check_magic(&path, &magic[..n])?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(PipelineError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(PipelineError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Download a URL into a temporary directory.
async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, PipelineError> {
    info!("Downloading PDF from: {}", url);

    let fetch_err = |reason: String| PipelineError::Fetch {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| fetch_err(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            PipelineError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            fetch_err(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(fetch_err(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            PipelineError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            fetch_err(e.to_string())
        }
    })?;

    let temp_dir = TempDir::new().map_err(|e| PipelineError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(filename_from_url(url));

    check_magic(&file_path, &bytes)?;

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| PipelineError::OutputWriteFailed {
            path: file_path.clone(),
            source: e,
        })?;

    info!("Downloaded {} bytes to: {}", bytes.len(), file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

fn check_magic(path: &Path, head: &[u8]) -> Result<(), PipelineError> {
    if head.len() >= 4 && &head[..4] == b"%PDF" {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    let n = head.len().min(4);
    magic[..n].copy_from_slice(&head[..n]);
    Err(PipelineError::NotAPdf {
        path: path.to_path_buf(),
        magic,
    })
}

/// Last URL path segment when it looks like a file name, else `paper.pdf`.
/// arXiv-style `/pdf/1706.03762` links get a `.pdf` suffix.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                let safe: String = last
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
                    .collect();
                if safe.ends_with(".pdf") {
                    return safe;
                }
                if !safe.is_empty() {
                    return format!("{safe}.pdf");
                }
            }
        }
    }
    "paper.pdf".to_string()
}
