//! Configuration types for paper-to-video generation.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. One struct holds every knob so a config can
//! be shared across spawned jobs, logged, and compared between runs.

use crate::error::PipelineError;
use crate::progress::ObserverHandle;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for a paper-to-video job.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use paper2video::{PipelineConfig, RenderQuality};
///
/// let config = PipelineConfig::builder()
///     .quality(RenderQuality::High)
///     .voice_id("amy")
///     .max_clips(3)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    // ── Locations ─────────────────────────────────────────────────────────
    /// Directory receiving `video_<job_id>.mp4`. Default: `outputs`.
    pub output_dir: PathBuf,

    /// Scratch directory; each job works in `<work_dir>/<job_id>`. Default: `work`.
    pub work_dir: PathBuf,

    /// Where [`crate::Orchestrator::submit_bytes`] stores uploaded PDFs. Default: `uploads`.
    pub upload_dir: PathBuf,

    /// Keep the per-job scratch directory after the job ends. Default: false.
    pub keep_work_dir: bool,

    /// JSON job table used by [`crate::store::JsonFileJobStore`] (default: `jobs.json`).
    pub jobs_file: PathBuf,

    // ── Planner ───────────────────────────────────────────────────────────
    /// Maximum number of content clips taken from the plan. Default: 4.
    pub max_clips: usize,

    /// LLM model name. `None` → provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "gemini").
    pub provider_name: Option<String>,

    /// Pre-built provider instance (bypasses provider_name/model).
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.7.
    pub temperature: f32,

    /// Maximum tokens for the plan response. Default: 8192.
    pub max_tokens: usize,

    /// Retries for a failed planner call. Default: 3.
    pub max_retries: u32,

    /// Initial retry backoff in milliseconds (doubles each attempt). Default: 500.
    pub retry_backoff_ms: u64,

    /// Extracted paper text beyond this many characters is dropped. Default: 60 000.
    pub max_source_chars: usize,

    /// Pages of the upload copy attached as images to the planner request. Default: 4.
    pub planner_page_images: usize,

    /// Custom planner system prompt. `None` → [`crate::prompts::PLANNER_SYSTEM_PROMPT`].
    pub system_prompt: Option<String>,

    // ── Source ────────────────────────────────────────────────────────────
    /// Sources larger than this are raster-compressed. Default: 2.5 MiB.
    pub compress_threshold_bytes: u64,

    /// Hard upper bound for the copy sent to the planner. Default: 5 MiB.
    pub max_upload_bytes: u64,

    /// HTTP download timeout in seconds. Default: 120.
    pub download_timeout_secs: u64,

    // ── Rendering ─────────────────────────────────────────────────────────
    /// Renderer quality tier. Default: medium.
    pub quality: RenderQuality,

    /// Canonical frame width. Default: 1280.
    pub width: u32,

    /// Canonical frame height. Default: 720.
    pub height: u32,

    /// Canonical frame rate. Default: 24.
    pub fps: f64,

    /// Frame rates within this distance of `fps` count as canonical. Default: 0.1.
    pub fps_tolerance: f64,

    /// Budget for one renderer invocation in seconds. Default: 600.
    pub render_timeout_secs: u64,

    // ── Narration ─────────────────────────────────────────────────────────
    /// Primary TTS voice id; mapped for the fallback provider. Default: "juniper".
    pub voice_id: String,

    /// Sample rate requested from the primary TTS provider. Default: 24 000.
    pub tts_sample_rate: u32,

    /// Primary TTS key. `None` → `LMNT_API_KEY` at runtime.
    pub lmnt_api_key: Option<String>,

    /// Narration requests in flight at once. Default: 1.
    pub narration_concurrency: usize,

    // ── Assembly ──────────────────────────────────────────────────────────
    /// Extra seconds of frozen frame added when narration outruns video. Default: 0.1.
    pub freeze_margin_secs: f64,

    /// Audio sample rate of the final video. Default: 44 100.
    pub audio_sample_rate: u32,

    /// Budget for one ffmpeg/ffprobe invocation in seconds. Default: 600.
    pub media_timeout_secs: u64,

    // ── Closing clip ──────────────────────────────────────────────────────
    /// Append a closing "thank you" clip. Default: true.
    pub closing_clip: bool,

    /// Previously rendered closing clip reused when present.
    pub closing_clip_cache: Option<PathBuf>,

    /// Generative video key. `None` → `GOOGLE_API_KEY` / `GEMINI_API_KEY` at runtime.
    pub google_api_key: Option<String>,

    /// Upper bound on waiting for the generative closing clip. Default: 300.
    pub closing_clip_timeout_secs: u64,

    /// Poll interval for the generative operation. Default: 15.
    pub closing_clip_poll_secs: u64,

    // ── Tools & events ────────────────────────────────────────────────────
    /// External binaries.
    pub tools: ToolPaths,

    /// Receives pipeline state transitions. `None` → [`crate::progress::TracingObserver`].
    pub observer: Option<ObserverHandle>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("outputs"),
            work_dir: PathBuf::from("work"),
            upload_dir: PathBuf::from("uploads"),
            keep_work_dir: false,
            jobs_file: PathBuf::from("jobs.json"),
            max_clips: 4,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.7,
            max_tokens: 8192,
            max_retries: 3,
            retry_backoff_ms: 500,
            max_source_chars: 60_000,
            planner_page_images: 4,
            system_prompt: None,
            compress_threshold_bytes: 2_621_440,
            max_upload_bytes: 5_242_880,
            download_timeout_secs: 120,
            quality: RenderQuality::default(),
            width: 1280,
            height: 720,
            fps: 24.0,
            fps_tolerance: 0.1,
            render_timeout_secs: 600,
            voice_id: "juniper".to_string(),
            tts_sample_rate: 24_000,
            lmnt_api_key: None,
            narration_concurrency: 1,
            freeze_margin_secs: 0.1,
            audio_sample_rate: 44_100,
            media_timeout_secs: 600,
            closing_clip: true,
            closing_clip_cache: None,
            google_api_key: None,
            closing_clip_timeout_secs: 300,
            closing_clip_poll_secs: 15,
            tools: ToolPaths::default(),
            observer: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("output_dir", &self.output_dir)
            .field("work_dir", &self.work_dir)
            .field("max_clips", &self.max_clips)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("quality", &self.quality)
            .field("canonical", &format!("{}x{}@{}", self.width, self.height, self.fps))
            .field("voice_id", &self.voice_id)
            .field("lmnt_api_key", &self.lmnt_api_key.as_ref().map(|_| "<redacted>"))
            .field("google_api_key", &self.google_api_key.as_ref().map(|_| "<redacted>"))
            .field("closing_clip", &self.closing_clip)
            .field("tools", &self.tools)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Canonical `(width, height, fps)` every clip is normalized to.
    pub fn canonical(&self) -> CanonicalFormat {
        CanonicalFormat {
            width: self.width,
            height: self.height,
            fps: self.fps,
            fps_tolerance: self.fps_tolerance,
            audio_sample_rate: self.audio_sample_rate,
        }
    }

    /// Primary TTS key from config, else `LMNT_API_KEY`.
    pub fn resolved_lmnt_key(&self) -> Option<String> {
        self.lmnt_api_key
            .clone()
            .or_else(|| std::env::var("LMNT_API_KEY").ok())
            .filter(|k| !k.is_empty())
    }

    /// Generative video key from config, else `GOOGLE_API_KEY` or `GEMINI_API_KEY`.
    pub fn resolved_google_key(&self) -> Option<String> {
        self.google_api_key
            .clone()
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok())
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .filter(|k| !k.is_empty())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.upload_dir = dir.into();
        self
    }

    pub fn jobs_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.jobs_file = path.into();
        self
    }

    pub fn keep_work_dir(mut self, v: bool) -> Self {
        self.config.keep_work_dir = v;
        self
    }

    pub fn max_clips(mut self, n: usize) -> Self {
        self.config.max_clips = n;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_source_chars(mut self, n: usize) -> Self {
        self.config.max_source_chars = n;
        self
    }

    pub fn planner_page_images(mut self, n: usize) -> Self {
        self.config.planner_page_images = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn compress_threshold_bytes(mut self, bytes: u64) -> Self {
        self.config.compress_threshold_bytes = bytes;
        self
    }

    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn quality(mut self, quality: RenderQuality) -> Self {
        self.config.quality = quality;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.config.width = width;
        self.config.height = height;
        self
    }

    pub fn fps(mut self, fps: f64) -> Self {
        self.config.fps = fps;
        self
    }

    pub fn render_timeout_secs(mut self, secs: u64) -> Self {
        self.config.render_timeout_secs = secs;
        self
    }

    pub fn voice_id(mut self, voice: impl Into<String>) -> Self {
        self.config.voice_id = voice.into();
        self
    }

    pub fn lmnt_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.lmnt_api_key = Some(key.into());
        self
    }

    pub fn narration_concurrency(mut self, n: usize) -> Self {
        self.config.narration_concurrency = n.max(1);
        self
    }

    pub fn freeze_margin_secs(mut self, secs: f64) -> Self {
        self.config.freeze_margin_secs = secs.max(0.0);
        self
    }

    pub fn media_timeout_secs(mut self, secs: u64) -> Self {
        self.config.media_timeout_secs = secs;
        self
    }

    pub fn closing_clip(mut self, v: bool) -> Self {
        self.config.closing_clip = v;
        self
    }

    pub fn closing_clip_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.closing_clip_cache = Some(path.into());
        self
    }

    pub fn google_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.google_api_key = Some(key.into());
        self
    }

    pub fn closing_clip_timeout_secs(mut self, secs: u64) -> Self {
        self.config.closing_clip_timeout_secs = secs;
        self
    }

    pub fn closing_clip_poll_secs(mut self, secs: u64) -> Self {
        self.config.closing_clip_poll_secs = secs;
        self
    }

    pub fn tools(mut self, tools: ToolPaths) -> Self {
        self.config.tools = tools;
        self
    }

    pub fn observer(mut self, observer: ObserverHandle) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.max_clips == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_clips must be ≥ 1".into(),
            ));
        }
        if c.width == 0 || c.height == 0 || c.width % 2 != 0 || c.height % 2 != 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "Resolution must be even and non-zero, got {}x{}",
                c.width, c.height
            )));
        }
        if !(c.fps > 0.0 && c.fps <= 120.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "fps must be in (0, 120], got {}",
                c.fps
            )));
        }
        if c.compress_threshold_bytes > c.max_upload_bytes {
            return Err(PipelineError::InvalidConfig(format!(
                "Compression threshold ({} bytes) exceeds the upload limit ({} bytes)",
                c.compress_threshold_bytes, c.max_upload_bytes
            )));
        }
        if c.closing_clip_poll_secs == 0
            || c.closing_clip_poll_secs > c.closing_clip_timeout_secs
        {
            return Err(PipelineError::InvalidConfig(format!(
                "Closing clip poll interval must be 1–{}s, got {}s",
                c.closing_clip_timeout_secs, c.closing_clip_poll_secs
            )));
        }
        if c.voice_id.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("voice_id is empty".into()));
        }
        Ok(self.config)
    }
}

// ── Supporting types ─────────────────────────────────────────────────────

/// Renderer quality tier, mapped onto the renderer's `-q` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl RenderQuality {
    /// The manim command-line flag for this tier.
    pub fn flag(self) -> &'static str {
        match self {
            RenderQuality::Low => "-ql",
            RenderQuality::Medium => "-qm",
            RenderQuality::High => "-qh",
        }
    }
}

/// Target format shared by every clip before concatenation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanonicalFormat {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub fps_tolerance: f64,
    pub audio_sample_rate: u32,
}

impl CanonicalFormat {
    /// Whether a stream with these parameters needs no resize.
    pub fn matches_resolution(&self, width: u32, height: u32) -> bool {
        width == self.width && height == self.height
    }

    /// Whether a stream with this frame rate needs no retime.
    pub fn matches_fps(&self, fps: f64) -> bool {
        (fps - self.fps).abs() <= self.fps_tolerance
    }
}

/// Locations of the external binaries. Bare names are looked up on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    pub manim: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub edge_tts: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            manim: PathBuf::from("manim"),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            edge_tts: PathBuf::from("edge-tts"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_canonical_format() {
        let c = PipelineConfig::default();
        assert_eq!((c.width, c.height), (1280, 720));
        assert_eq!(c.fps, 24.0);
        assert_eq!(c.max_clips, 4);
        assert_eq!(c.audio_sample_rate, 44_100);
        assert_eq!(c.closing_clip_timeout_secs, 300);
        assert_eq!(c.closing_clip_poll_secs, 15);
    }

    #[test]
    fn builder_rejects_zero_clips() {
        let err = PipelineConfig::builder().max_clips(0).build().unwrap_err();
        assert!(err.to_string().contains("max_clips"));
    }

    #[test]
    fn builder_rejects_odd_resolution() {
        assert!(PipelineConfig::builder()
            .resolution(1281, 720)
            .build()
            .is_err());
    }

    #[test]
    fn builder_rejects_threshold_above_limit() {
        let err = PipelineConfig::builder()
            .compress_threshold_bytes(6_000_000)
            .max_upload_bytes(5_000_000)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("upload limit"));
    }

    #[test]
    fn builder_rejects_poll_longer_than_timeout() {
        assert!(PipelineConfig::builder()
            .closing_clip_timeout_secs(10)
            .closing_clip_poll_secs(15)
            .build()
            .is_err());
    }

    #[test]
    fn quality_flags() {
        assert_eq!(RenderQuality::Low.flag(), "-ql");
        assert_eq!(RenderQuality::Medium.flag(), "-qm");
        assert_eq!(RenderQuality::High.flag(), "-qh");
    }

    #[test]
    fn canonical_fps_tolerance() {
        let canon = PipelineConfig::default().canonical();
        assert!(canon.matches_fps(24.05));
        assert!(!canon.matches_fps(25.0));
        assert!(canon.matches_resolution(1280, 720));
        assert!(!canon.matches_resolution(1920, 1080));
    }

    #[test]
    fn debug_redacts_keys() {
        let c = PipelineConfig::builder()
            .lmnt_api_key("secret-lmnt")
            .build()
            .unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("secret-lmnt"));
        assert!(dbg.contains("<redacted>"));
    }
}
