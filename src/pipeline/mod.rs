//! Pipeline stages for paper-to-video generation.
//!
//! Each submodule implements one step. Stages that call external tools or
//! services sit behind a trait, so the orchestrator can be driven by fakes
//! in tests.
//!
//! ## Data Flow
//!
//! ```text
//! fetch ──▶ planner ──▶ renderer ──▶ composer ──▶ stitch ──▶ video
//! (pdfium)   (LLM)      (manim)   ▲  (ffmpeg)     (normalize + concat)
//!                       narrator ─┘                 ▲
//!                       (TTS)              closing ─┘
//! ```
//!
//! 1. [`fetch`]    resolve the source ([`input`]), size-limit and read it ([`pdf`])
//! 2. [`planner`]  ask the LLM for the clip plan; page images via [`encode`]
//! 3. [`renderer`] render each clip, one at a time
//! 4. [`narrator`] synthesize narration through a [`fallback`] chain
//! 5. [`composer`] mux clip and narration, holding the last frame if needed
//! 6. [`closing`]  obtain the closing clip
//! 7. [`stitch`]   [`normalize`] every clip and concatenate

pub mod closing;
pub mod composer;
pub mod encode;
pub mod fallback;
pub mod fetch;
pub mod input;
pub mod narrator;
pub mod normalize;
pub mod pdf;
pub mod planner;
pub mod renderer;
pub mod stitch;
