//! # paper2video
//!
//! Turn a research paper (PDF) into a short narrated explainer video.
//!
//! An LLM reads the paper and writes a plan of up to four animation clips,
//! each a manim scene plus an optional voice-over. Every clip is rendered,
//! narrated and muxed independently, so one broken scene or one failed
//! speech request costs a clip, not the video. The surviving clips are
//! normalized to one format and concatenated, optionally followed by a
//! closing clip.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF (URL or file)
//!  │
//!  ├─ 1. Fetch     download / resolve, compress when over 2.5 MiB, 5 MiB cap
//!  ├─ 2. Plan      LLM → JSON {"clips": [...]} → at most 4 clips
//!  ├─ 3. Render    manim, one scene at a time
//!  ├─ 4. Narrate   LMNT, then edge-tts (bounded concurrency)
//!  ├─ 5. Compose   freeze last frame to fit narration, mux AAC
//!  ├─ 6. Closing   cached file → Veo → rendered scene → none
//!  └─ 7. Stitch    normalize to 1280x720@24 and concatenate
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use paper2video::{Orchestrator, PipelineConfig, SourceRef};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::builder().output_dir("videos").build()?;
//!     let orchestrator = Orchestrator::from_config(config).await?;
//!     let job = orchestrator
//!         .run(SourceRef::parse("https://arxiv.org/pdf/1706.03762"), None)
//!         .await?;
//!     println!("{} -> {:?}", job.status, job.video_path);
//!     Ok(())
//! }
//! ```
//!
//! ## External tools
//!
//! `manim`, `ffmpeg` and `ffprobe` must be installed; `edge-tts` is needed
//! only when LMNT is unavailable. Paths can be overridden with
//! [`PipelineConfigBuilder::tools`].
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `paper2video` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod job;
pub mod media;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder, RenderQuality, ToolPaths};
pub use error::{ClipError, MediaError, PipelineError};
pub use job::{Job, JobId, JobMetrics, JobStatus, SourceRef};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use output::{ClipKind, ClipPlan, PipelineOutput};
pub use progress::{NoopObserver, ObserverHandle, PipelineObserver, Stage, TracingObserver};
pub use store::{InMemoryJobStore, JobRepository, JsonFileJobStore};
