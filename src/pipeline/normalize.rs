//! Normalizer: bring a clip to the canonical resolution and frame rate.
//!
//! Clips already in the canonical format are passed through untouched.
//! Some ffmpeg builds drop the audio stream while rescaling; after every
//! transform the output is probed and, if audio went missing, the source
//! audio is muxed back in.

use crate::config::CanonicalFormat;
use crate::error::ClipError;
use crate::media::{remove_quietly, FfmpegArgs, MediaEngine, MediaInfo};
use crate::output::NormalizedClip;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a clip needs to become canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizePlan {
    pub scale: bool,
    pub retime: bool,
}

impl NormalizePlan {
    pub fn is_noop(&self) -> bool {
        !self.scale && !self.retime
    }
}

/// Compare a probed clip against the canonical format.
pub fn plan(width: u32, height: u32, fps: f64, canonical: &CanonicalFormat) -> NormalizePlan {
    NormalizePlan {
        scale: !canonical.matches_resolution(width, height),
        retime: !canonical.matches_fps(fps),
    }
}

/// `scale=W:H,setsar=1[,fps=F]`.
pub fn video_filter(plan: NormalizePlan, canonical: &CanonicalFormat) -> String {
    let mut filter = format!("scale={}:{},setsar=1", canonical.width, canonical.height);
    if plan.retime {
        filter.push_str(&format!(",fps={}", canonical.fps));
    }
    filter
}

pub fn normalize_args(
    input: &Path,
    output: &Path,
    plan: NormalizePlan,
    canonical: &CanonicalFormat,
    has_audio: bool,
) -> Vec<String> {
    let args = FfmpegArgs::new()
        .input(input)
        .video_filter(video_filter(plan, canonical))
        .map("0:v:0")
        .h264();
    let args = if has_audio {
        args.map("0:a:0").aac(canonical.audio_sample_rate)
    } else {
        args.no_audio()
    };
    args.faststart().build(output)
}

/// Re-mux `audio_source`'s audio under `video`'s picture.
pub fn reattach_audio_args(
    video: &Path,
    audio_source: &Path,
    output: &Path,
    sample_rate: u32,
) -> Vec<String> {
    FfmpegArgs::new()
        .input(video)
        .input(audio_source)
        .map("0:v")
        .map("1:a")
        .video_codec("copy")
        .aac(sample_rate)
        .build(output)
}

pub struct Normalizer {
    media: Arc<dyn MediaEngine>,
    canonical: CanonicalFormat,
}

impl Normalizer {
    pub fn new(media: Arc<dyn MediaEngine>, canonical: CanonicalFormat) -> Self {
        Self { media, canonical }
    }

    /// Normalize clip `index` from `input` into `output`.
    ///
    /// Returns the input itself when it is already canonical.
    pub async fn normalize(
        &self,
        index: usize,
        input: &Path,
        output: &Path,
    ) -> Result<NormalizedClip, ClipError> {
        let fail = |detail: String| ClipError::NormalizeDegraded { clip: index, detail };

        let source = self.media.probe(input).await.map_err(|e| fail(e.to_string()))?;
        let video = source
            .video
            .as_ref()
            .ok_or_else(|| fail("no video stream".to_string()))?;

        let plan = plan(video.width, video.height, video.fps, &self.canonical);
        if plan.is_noop() {
            debug!("Clip {}: already canonical", index);
            return Ok(NormalizedClip {
                path: input.to_path_buf(),
                duration_secs: source.duration_secs,
                has_audio: source.has_audio(),
                canonical: true,
            });
        }

        info!(
            "Clip {}: normalizing {}x{}@{:.2} → {}x{}@{}",
            index,
            video.width,
            video.height,
            video.fps,
            self.canonical.width,
            self.canonical.height,
            self.canonical.fps
        );

        let args = normalize_args(input, output, plan, &self.canonical, source.has_audio());
        self.media.ffmpeg(args).await.map_err(|e| fail(e.to_string()))?;

        let mut result = self.media.probe(output).await.map_err(|e| fail(e.to_string()))?;
        if source.has_audio() && !result.has_audio() {
            warn!("Clip {}: audio lost while normalizing, re-attaching", index);
            result = self
                .reattach(input, output)
                .await
                .map_err(fail)?;
        }

        Ok(NormalizedClip {
            path: output.to_path_buf(),
            duration_secs: result.duration_secs,
            has_audio: result.has_audio(),
            canonical: true,
        })
    }

    async fn reattach(&self, source: &Path, normalized: &Path) -> Result<MediaInfo, String> {
        let remuxed = normalized.with_extension("audio.mp4");
        let args = reattach_audio_args(
            normalized,
            source,
            &remuxed,
            self.canonical.audio_sample_rate,
        );
        if let Err(e) = self.media.ffmpeg(args).await {
            remove_quietly(&remuxed).await;
            return Err(format!("audio re-attach failed: {e}"));
        }

        let info = self.media.probe(&remuxed).await.map_err(|e| e.to_string())?;
        if !info.has_audio() {
            remove_quietly(&remuxed).await;
            return Err("audio still missing after re-attach".to_string());
        }

        tokio::fs::rename(&remuxed, normalized)
            .await
            .map_err(|e| format!("replace {}: {e}", normalized.display()))?;
        Ok(info)
    }
}
