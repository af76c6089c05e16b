//! Media tooling: ffprobe inspection and ffmpeg execution.
//!
//! Pipeline stages talk to [`MediaEngine`] rather than to ffmpeg directly, so
//! composition, normalization and stitching can be exercised in tests with a
//! scripted engine.

pub mod command;
pub mod probe;

use crate::config::{PipelineConfig, ToolPaths};
use crate::error::MediaError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use command::{FfmpegArgs, ToolCommand, ToolOutput};
pub use probe::{AudioStreamInfo, MediaInfo, VideoStreamInfo};

/// Probe and transcode capability used by the assembly stages.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Inspect a media file.
    async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaError>;

    /// Run ffmpeg with a complete argument vector (see [`FfmpegArgs::build`]).
    async fn ffmpeg(&self, args: Vec<String>) -> Result<(), MediaError>;
}

/// [`MediaEngine`] backed by the ffmpeg and ffprobe binaries.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfmpegEngine {
    pub fn new(tools: &ToolPaths, timeout: Duration) -> Self {
        Self {
            ffmpeg: tools.ffmpeg.clone(),
            ffprobe: tools.ffprobe.clone(),
            timeout,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            &config.tools,
            Duration::from_secs(config.media_timeout_secs),
        )
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaError> {
        if !path.exists() {
            return Err(MediaError::Probe {
                path: path.to_path_buf(),
                detail: "file does not exist".into(),
            });
        }
        let out = ToolCommand::new(self.ffprobe.clone())
            .args(probe::probe_args(path))
            .timeout(self.timeout)
            .execute()
            .await?;
        probe::parse_probe_output(&out.stdout, path)
    }

    async fn ffmpeg(&self, args: Vec<String>) -> Result<(), MediaError> {
        ToolCommand::new(self.ffmpeg.clone())
            .args(args)
            .timeout(self.timeout)
            .execute()
            .await?;
        Ok(())
    }
}

/// Best-effort removal of a scratch file; a missing file is fine.
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::debug!("Could not remove {}: {}", path.display(), e),
    }
}
