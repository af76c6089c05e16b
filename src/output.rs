//! Artifacts passed between pipeline stages.
//!
//! Each stage owns the type it produces and hands it on by value:
//!
//! ```text
//! ClipPlan ─render→ RenderedClip ─┐
//!          ─narrate→ NarrationClip ┴compose→ ComposedClip ─normalize→ NormalizedClip ─stitch→ PipelineOutput
//! ```

use crate::job::JobMetrics;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One planned scene as returned by the script planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipPlan {
    /// Clip kind tag. Only [`ClipKind::Manim`] is rendered.
    #[serde(rename = "type", default)]
    pub kind: ClipKind,

    /// Animation descriptor handed to the renderer.
    #[serde(default)]
    pub code: String,

    /// Narration text; absent or blank means a silent clip.
    #[serde(default)]
    pub voice_over: Option<String>,
}

impl ClipPlan {
    /// Whether the renderer can consume this entry.
    pub fn is_renderable(&self) -> bool {
        self.kind == ClipKind::Manim && !self.code.trim().is_empty()
    }

    /// Narration text, if any non-blank text was planned.
    pub fn narration(&self) -> Option<&str> {
        self.voice_over
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Kind tag of a [`ClipPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipKind {
    /// Rendered animation (the only kind the pipeline consumes).
    #[default]
    Manim,
    /// Anything else the model invented; skipped.
    #[serde(other)]
    Other,
}

/// A silent video produced by the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedClip {
    /// 0-based position in the plan.
    pub index: usize,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_secs: f64,
}

/// A validated narration track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationClip {
    pub path: PathBuf,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub channels: u32,
    /// Name of the speech provider that produced the file.
    pub provider: String,
}

/// A rendered clip paired with its narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedClip {
    pub index: usize,
    pub path: PathBuf,
    pub has_audio: bool,
    /// Set when composition fell back to the silent rendered clip.
    pub degraded: Option<String>,
}

/// A clip in (or, when degraded, destined for) the canonical format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedClip {
    pub path: PathBuf,
    pub duration_secs: f64,
    pub has_audio: bool,
    /// False when normalization failed and the stitcher must scale in-graph.
    pub canonical: bool,
}

/// Result of a successful pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub video_path: PathBuf,
    pub metrics: JobMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_plan_parses_wire_shape() {
        let json = r#"{"type":"manim","code":"class SimpleScene(Scene): pass","voice_over":"Hello"}"#;
        let plan: ClipPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.kind, ClipKind::Manim);
        assert!(plan.is_renderable());
        assert_eq!(plan.narration(), Some("Hello"));
    }

    #[test]
    fn unknown_kind_is_not_renderable() {
        let json = r#"{"type":"veo","code":"x"}"#;
        let plan: ClipPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.kind, ClipKind::Other);
        assert!(!plan.is_renderable());
    }

    #[test]
    fn blank_voice_over_is_silent() {
        let plan = ClipPlan {
            kind: ClipKind::Manim,
            code: "x".into(),
            voice_over: Some("   ".into()),
        };
        assert_eq!(plan.narration(), None);
    }

    #[test]
    fn missing_kind_defaults_to_manim() {
        let plan: ClipPlan = serde_json::from_str(r#"{"code":"x"}"#).unwrap();
        assert_eq!(plan.kind, ClipKind::Manim);
        assert_eq!(plan.voice_over, None);
    }
}
