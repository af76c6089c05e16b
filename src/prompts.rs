//! Prompts and fixed scene text used by the pipeline.
//!
//! Everything the pipeline says to a model, and every scene it renders on its
//! own, lives here so it can be read and changed in one place. Callers can
//! override the planner prompt via
//! [`crate::config::PipelineConfig::system_prompt`].

/// Name of the scene class every descriptor must define.
pub const SCENE_ENTRY_POINT: &str = "SimpleScene";

/// Imports prepended to descriptors that do not bring their own.
pub const SCENE_PREAMBLE: &str = "from manim import *\nimport numpy as np\n\n";

/// Default system prompt for turning a paper into a clip plan.
pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are an expert science communicator who explains research papers with precise, elegant mathematical animations.

Produce a plan for a short explainer video about the paper you are given.

1. STRUCTURE
   - Exactly {max_clips} clips, about 12 seconds of narration each
   - Clip 1 introduces the problem, the middle clips explain the core method, the last clip states the key result
   - Each clip is independent: never reference objects from another clip

2. ANIMATION CODE
   - Python code for the Manim Community edition
   - Start with: from manim import * and import numpy as np
   - Define exactly one class named SimpleScene deriving from Scene
   - Use Create (not ShowCreation) and axes.plot (not axes.get_graph)
   - Put titles and labels at the screen edges with .to_edge(UP) or .to_edge(DOWN); keep diagrams centred
   - End construct() with self.wait(1)

3. NARRATION
   - One voice_over per clip, spoken English, no markup, 25–35 words

4. OUTPUT FORMAT
   - Output ONLY a single JSON object, no commentary and no code fences:
     {"clips": [{"type": "manim", "code": "<python>", "voice_over": "<narration>"}]}"#;

/// Build the planner system prompt for the configured clip count.
pub fn planner_system_prompt(override_prompt: Option<&str>, max_clips: usize) -> String {
    override_prompt
        .unwrap_or(PLANNER_SYSTEM_PROMPT)
        .replace("{max_clips}", &max_clips.to_string())
}

/// Build the user turn carrying the paper text and the steering prompt.
pub fn planner_user_message(paper_text: &str, steering: Option<&str>) -> String {
    let mut msg = String::new();
    if let Some(steer) = steering.map(str::trim).filter(|s| !s.is_empty()) {
        msg.push_str("Focus of the video: ");
        msg.push_str(steer);
        msg.push_str("\n\n");
    }
    msg.push_str("Paper text:\n\"\"\"\n");
    msg.push_str(paper_text);
    msg.push_str("\n\"\"\"");
    msg
}

/// Prompts for the generated closing clip; one is picked per job.
pub const CLOSING_CLIP_PROMPTS: [&str; 4] = [
    "Elegant thank you message with flowing particles and gentle animations, professional academic style, exactly 3 seconds duration",
    "Abstract thank you visualization with geometric shapes forming a thank you message, clean modern aesthetic, exactly 3 seconds duration",
    "Thank you text with subtle background animation and soft lighting effects, professional presentation style, exactly 3 seconds duration",
    "Minimalist thank you design with animated typography and smooth transitions, elegant academic finish, exactly 3 seconds duration",
];

/// Full generative-video prompt for the closing clip.
pub fn closing_clip_prompt(seed: usize) -> String {
    format!(
        "Generate exactly 3 seconds of video for a thank you ending with the following prompt: {}",
        CLOSING_CLIP_PROMPTS[seed % CLOSING_CLIP_PROMPTS.len()]
    )
}

/// Scene rendered locally when the generated closing clip is unavailable.
pub const CLOSING_SCENE: &str = r#"from manim import *

class SimpleScene(Scene):
    def construct(self):
        title = Text("Thank You", font_size=48, color=WHITE).to_edge(UP)
        subtitle = Text("For Watching", font_size=36, color=BLUE).move_to(ORIGIN)
        ring = Circle(radius=1.5, color=BLUE, fill_opacity=0.1).move_to(ORIGIN)

        self.play(Write(title, run_time=0.8))
        self.wait(0.2)
        self.play(Create(ring, run_time=1), FadeIn(subtitle, run_time=1))
        self.wait(1)
        self.play(
            FadeOut(title, run_time=0.25),
            FadeOut(subtitle, run_time=0.25),
            FadeOut(ring, run_time=0.25),
        )
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_substitutes_clip_count() {
        let p = planner_system_prompt(None, 4);
        assert!(p.contains("Exactly 4 clips"));
        assert!(!p.contains("{max_clips}"));
    }

    #[test]
    fn override_prompt_is_used() {
        let p = planner_system_prompt(Some("Make {max_clips} scenes."), 2);
        assert_eq!(p, "Make 2 scenes.");
    }

    #[test]
    fn user_message_includes_steering() {
        let m = planner_user_message("Attention is all you need.", Some("  the math  "));
        assert!(m.starts_with("Focus of the video: the math"));
        assert!(m.contains("Attention is all you need."));

        let plain = planner_user_message("body", Some("   "));
        assert!(plain.starts_with("Paper text:"));
    }

    #[test]
    fn closing_prompt_rotates() {
        assert_ne!(closing_clip_prompt(0), closing_clip_prompt(1));
        assert_eq!(closing_clip_prompt(0), closing_clip_prompt(4));
    }

    #[test]
    fn closing_scene_defines_entry_point() {
        assert!(CLOSING_SCENE.contains(&format!("class {SCENE_ENTRY_POINT}(Scene)")));
    }
}
