//! Error types for the paper2video library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal**, the job cannot produce a video at all
//!   (unreachable source, not a PDF, unusable script, nothing rendered).
//!   Returned as `Err(PipelineError)` and recorded on the failed job.
//!
//! * [`ClipError`]: **Non-fatal**, one clip lost its render, narration,
//!   composition or normalization, or the closing clip could not be produced.
//!   Stored inside [`crate::job::JobMetrics`] so callers can tell a degraded
//!   video from a clean one.
//!
//! * [`MediaError`]: failures of an external tool invocation (manim, ffmpeg,
//!   ffprobe, edge-tts). The pipeline stages translate these into one of the
//!   two tiers above depending on where they happen.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the paper2video library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Source errors ─────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is neither a file path nor an HTTP/HTTPS URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// The URL was unreachable or answered with a non-success status.
    #[error("Failed to fetch '{url}': {reason}\nCheck the URL and your internet connection.")]
    Fetch { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// pdfium could not parse the document.
    #[error("PDF '{path}' could not be parsed: {detail}")]
    Parse { path: PathBuf, detail: String },

    /// Even the smallest available copy of the source exceeds the upload bound.
    #[error(
        "PDF '{path}' is too large: {bytes} bytes after compression (limit {limit} bytes)\n\
Try a shorter paper or raise --max-upload-mb."
    )]
    SourceTooLarge { path: PathBuf, bytes: u64, limit: u64 },

    // ── Planner errors ────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The LLM call failed after every retry.
    #[error("LLM request failed after {retries} retries: {detail}")]
    PlannerFailed { retries: u32, detail: String },

    /// The model answered, but no usable clip plan could be extracted.
    #[error("Could not parse the scene plan: {reason}")]
    PlanParse { reason: String },

    // ── Assembly errors ───────────────────────────────────────────────────
    /// Every planned clip failed to render.
    #[error("All {total} clips failed to render.\nFirst error: {first_error}")]
    NoRenderedClips { total: usize, first_error: String },

    /// The final concatenation could not run or had no valid input.
    #[error("Failed to stitch the final video: {reason}")]
    Stitch { reason: String },

    // ── Job store errors ──────────────────────────────────────────────────
    /// No job with the given id exists.
    #[error("Job '{id}' not found")]
    JobNotFound { id: String },

    /// Reading or writing the job table failed.
    #[error("Job store error at '{path}': {detail}")]
    Store { path: PathBuf, detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file or directory.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install pdfium for your platform, then either:\n\
  • place libpdfium on the system library path, or\n\
  • set PDFIUM_LIB_PATH=/path/to/dir/containing/libpdfium.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single clip (or the closing clip).
///
/// The job continues; the affected clip is dropped, silenced or left
/// un-normalized, and the error is recorded in the job metrics.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClipError {
    /// The renderer produced no artifact for this clip.
    #[error("Clip {clip}: render failed: {detail}")]
    RenderFailed { clip: usize, detail: String },

    /// Both speech providers failed; the clip stays silent.
    #[error("Clip {clip}: narration failed: {detail}")]
    VoiceGenFailed { clip: usize, detail: String },

    /// Muxing failed; the silent rendered clip is used instead.
    #[error("Clip {clip}: composition degraded to silent clip: {detail}")]
    ComposeDegraded { clip: usize, detail: String },

    /// Normalization failed; the clip is scaled inside the concat graph.
    #[error("Clip {clip}: normalization degraded: {detail}")]
    NormalizeDegraded { clip: usize, detail: String },

    /// No closing clip source succeeded; the video ends without one.
    #[error("Closing clip unavailable: {detail}")]
    ClosingClipUnavailable { detail: String },
}

/// Failure of an external tool invocation or media inspection.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The binary could not be located on PATH.
    #[error("'{tool}' not found on PATH; install it or pass its location explicitly")]
    ToolNotFound { tool: String },

    /// The process could not be started.
    #[error("Failed to spawn '{tool}': {detail}")]
    Spawn { tool: String, detail: String },

    /// The process ran and exited unsuccessfully.
    #[error("'{tool}' exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    /// The process exceeded its time budget.
    #[error("'{tool}' timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    /// ffprobe output was missing or could not be understood.
    #[error("Could not probe '{path}': {detail}")]
    Probe { path: PathBuf, detail: String },
}

impl ClipError {
    /// Index of the affected clip, if the error belongs to a content clip.
    pub fn clip(&self) -> Option<usize> {
        match self {
            ClipError::RenderFailed { clip, .. }
            | ClipError::VoiceGenFailed { clip, .. }
            | ClipError::ComposeDegraded { clip, .. }
            | ClipError::NormalizeDegraded { clip, .. } => Some(*clip),
            ClipError::ClosingClipUnavailable { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_too_large_display() {
        let e = PipelineError::SourceTooLarge {
            path: PathBuf::from("paper.pdf"),
            bytes: 7_000_000,
            limit: 5_242_880,
        };
        let msg = e.to_string();
        assert!(msg.contains("7000000"), "got: {msg}");
        assert!(msg.contains("5242880"), "got: {msg}");
    }

    #[test]
    fn no_rendered_clips_display() {
        let e = PipelineError::NoRenderedClips {
            total: 4,
            first_error: "manim exited with 1".into(),
        };
        assert!(e.to_string().contains("All 4 clips"));
        assert!(e.to_string().contains("manim exited"));
    }

    #[test]
    fn clip_error_index() {
        let e = ClipError::VoiceGenFailed {
            clip: 2,
            detail: "lmnt: 500".into(),
        };
        assert_eq!(e.clip(), Some(2));
        let closing = ClipError::ClosingClipUnavailable {
            detail: "timeout".into(),
        };
        assert_eq!(closing.clip(), None);
    }

    #[test]
    fn clip_error_serializes_with_kind_tag() {
        let e = ClipError::RenderFailed {
            clip: 1,
            detail: "no SimpleScene".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"kind\":\"render_failed\""), "got: {json}");
        let back: ClipError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn media_failed_display() {
        let e = MediaError::Failed {
            tool: "ffmpeg".into(),
            status: "exit status: 1".into(),
            stderr: "Invalid data found".into(),
        };
        assert!(e.to_string().contains("ffmpeg"));
        assert!(e.to_string().contains("Invalid data"));
    }
}
