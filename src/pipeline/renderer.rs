//! Clip Renderer: turn an animation descriptor into a silent video.
//!
//! [`ManimRenderer`] shells out to the manim CLI. manim keeps global state
//! in its media directory and saturates the CPU, so the renderer holds a
//! mutex for the whole of each call: at most one render runs per instance,
//! across clips and across jobs sharing the instance. Callers that want the
//! guarantee process-wide must share one `Arc<ManimRenderer>`.

use crate::config::{PipelineConfig, RenderQuality};
use crate::error::ClipError;
use crate::media::{MediaEngine, ToolCommand};
use crate::output::RenderedClip;
use crate::prompts::{SCENE_ENTRY_POINT, SCENE_PREAMBLE};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Renders animation descriptors to video files.
///
/// Implementations must not run two renders at once; concurrent callers
/// wait their turn.
#[async_trait]
pub trait ClipRenderer: Send + Sync {
    /// Render `descriptor` as clip `index`, writing under `media_dir`.
    async fn render(
        &self,
        index: usize,
        descriptor: &str,
        media_dir: &Path,
    ) -> Result<RenderedClip, ClipError>;
}

static RE_CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```(?:python|py)?\s*\n(.*?)\n?```\s*$").unwrap());

static RE_BARE_SCENE_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bclass\s+Scene\s*\(").unwrap());

static RE_SCENE_SUBCLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bclass\s+(\w+)\s*\(\s*[\w.]*Scene\s*\)").unwrap());

fn defines_entry_point(code: &str) -> bool {
    code.contains(&format!("class {SCENE_ENTRY_POINT}"))
}

/// Make a descriptor runnable: strip code fences, ensure the entry-point
/// class exists and the manim imports are present.
///
/// Returns `Err` when no scene class can be found to rename.
pub fn repair_descriptor(descriptor: &str) -> Result<String, String> {
    let mut code = match RE_CODE_FENCE.captures(descriptor) {
        Some(caps) => caps[1].to_string(),
        None => descriptor.to_string(),
    };

    if !defines_entry_point(&code) {
        if RE_BARE_SCENE_CLASS.is_match(&code) {
            code = RE_BARE_SCENE_CLASS
                .replace(&code, format!("class {SCENE_ENTRY_POINT}("))
                .into_owned();
        } else if let Some(caps) = RE_SCENE_SUBCLASS.captures(&code) {
            let name = caps[1].to_string();
            debug!("Renaming scene class '{}' to '{}'", name, SCENE_ENTRY_POINT);
            let whole = caps[0].to_string();
            let renamed = whole.replacen(&name, SCENE_ENTRY_POINT, 1);
            code = code.replacen(&whole, &renamed, 1);
        }
    }

    if !defines_entry_point(&code) {
        return Err(format!("descriptor defines no '{SCENE_ENTRY_POINT}' scene class"));
    }

    if !code.contains("from manim import") {
        code = format!("{SCENE_PREAMBLE}{code}");
    }
    Ok(code)
}

/// Newest `*.mp4` under `dir`, ignoring anything inside a `partial…` path.
pub fn select_newest_artifact(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "mp4"))
        .filter(|e| {
            !e.path()
                .strip_prefix(dir)
                .unwrap_or(e.path())
                .components()
                .any(|c| c.as_os_str().to_string_lossy().contains("partial"))
        })
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, e.into_path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// [`ClipRenderer`] backed by the manim CLI.
pub struct ManimRenderer {
    manim: PathBuf,
    quality: RenderQuality,
    width: u32,
    height: u32,
    fps: f64,
    timeout: Duration,
    media: Arc<dyn MediaEngine>,
    lock: Mutex<()>,
}

impl ManimRenderer {
    pub fn new(config: &PipelineConfig, media: Arc<dyn MediaEngine>) -> Self {
        Self {
            manim: config.tools.manim.clone(),
            quality: config.quality,
            width: config.width,
            height: config.height,
            fps: config.fps,
            timeout: Duration::from_secs(config.render_timeout_secs),
            media,
            lock: Mutex::new(()),
        }
    }

    fn command(&self, scene_file: &Path, index: usize, media_dir: &Path) -> ToolCommand {
        let mut cmd = ToolCommand::new(self.manim.clone());
        cmd.arg(scene_file.to_string_lossy())
            .arg(SCENE_ENTRY_POINT)
            .args(["-o".to_string(), format!("clip_{index}")])
            .args(["--media_dir".to_string(), media_dir.to_string_lossy().to_string()])
            .args(["-v", "WARNING"])
            .arg(self.quality.flag())
            .args([
                "--resolution".to_string(),
                format!("{},{}", self.width, self.height),
            ])
            .args(["--frame_rate".to_string(), format!("{}", self.fps)])
            .timeout(self.timeout)
            .current_dir(media_dir);
        cmd
    }
}

#[async_trait]
impl ClipRenderer for ManimRenderer {
    async fn render(
        &self,
        index: usize,
        descriptor: &str,
        media_dir: &Path,
    ) -> Result<RenderedClip, ClipError> {
        let fail = |detail: String| ClipError::RenderFailed { clip: index, detail };

        let code = repair_descriptor(descriptor).map_err(fail)?;

        tokio::fs::create_dir_all(media_dir)
            .await
            .map_err(|e| fail(format!("create {}: {e}", media_dir.display())))?;
        // manim runs inside media_dir, so every path it sees must be absolute.
        let media_dir = tokio::fs::canonicalize(media_dir)
            .await
            .map_err(|e| fail(format!("resolve {}: {e}", media_dir.display())))?;
        let media_dir = media_dir.as_path();
        let scene_file = media_dir.join(format!("scene_{index}.py"));
        tokio::fs::write(&scene_file, code)
            .await
            .map_err(|e| fail(format!("write {}: {e}", scene_file.display())))?;

        let _guard = self.lock.lock().await;
        info!("Rendering clip {} ({})", index, self.quality.flag());

        self.command(&scene_file, index, media_dir)
            .execute()
            .await
            .map_err(|e| fail(e.to_string()))?;

        let artifact = select_newest_artifact(media_dir)
            .ok_or_else(|| fail("manim exited cleanly but wrote no video".to_string()))?;

        let info = self
            .media
            .probe(&artifact)
            .await
            .map_err(|e| fail(e.to_string()))?;
        let video = info
            .video
            .ok_or_else(|| fail(format!("{} has no video stream", artifact.display())))?;

        if (video.width, video.height) != (self.width, self.height) {
            warn!(
                "Clip {} rendered at {}x{}, expected {}x{}",
                index, video.width, video.height, self.width, self.height
            );
        }
        debug!("Clip {} → {}", index, artifact.display());

        Ok(RenderedClip {
            index,
            path: artifact,
            width: video.width,
            height: video.height,
            fps: video.fps,
            duration_secs: info.duration_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn entry_point_is_kept() {
        let code = "from manim import *\nclass SimpleScene(Scene):\n    pass\n";
        assert_eq!(repair_descriptor(code).unwrap(), code);
    }

    #[test]
    fn preamble_added_when_imports_missing() {
        let out = repair_descriptor("class SimpleScene(Scene):\n    pass").unwrap();
        assert!(out.starts_with(SCENE_PREAMBLE));
    }

    #[test]
    fn bare_scene_class_is_renamed() {
        let out = repair_descriptor("class Scene(MovingCameraScene):\n    pass").unwrap();
        assert!(out.contains("class SimpleScene(MovingCameraScene)"));
    }

    #[test]
    fn first_scene_subclass_is_renamed() {
        let code = "class Helper:\n    pass\n\nclass AttentionDemo(Scene):\n    def construct(self):\n        pass\n";
        let out = repair_descriptor(code).unwrap();
        assert!(out.contains("class SimpleScene(Scene)"));
        assert!(out.contains("class Helper:"));
        assert!(!out.contains("AttentionDemo"));
    }

    #[test]
    fn code_fences_are_stripped() {
        let out = repair_descriptor("```python\nclass SimpleScene(Scene):\n    pass\n```").unwrap();
        assert!(!out.contains("```"));
        assert!(out.contains("class SimpleScene(Scene)"));
    }

    #[test]
    fn descriptor_without_scene_is_rejected() {
        assert!(repair_descriptor("print('hello')").is_err());
    }

    #[test]
    fn newest_artifact_skips_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let final_dir = dir.path().join("videos/scene_0/720p24");
        let partial_dir = final_dir.join("partial_movie_files/SimpleScene");
        fs::create_dir_all(&partial_dir).unwrap();

        fs::write(final_dir.join("clip_0.mp4"), b"final").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(partial_dir.join("00000.mp4"), b"partial").unwrap();
        fs::write(final_dir.join("notes.txt"), b"x").unwrap();

        let picked = select_newest_artifact(dir.path()).unwrap();
        assert_eq!(picked, final_dir.join("clip_0.mp4"));
    }

    #[test]
    fn newest_artifact_prefers_latest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.mp4"), b"a").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        fs::write(dir.path().join("new.mp4"), b"b").unwrap();
        assert_eq!(
            select_newest_artifact(dir.path()),
            Some(dir.path().join("new.mp4"))
        );
    }

    #[test]
    fn no_artifact_in_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(select_newest_artifact(dir.path()), None);
    }

    #[test]
    fn command_carries_quality_and_format() {
        struct NoMedia;
        #[async_trait]
        impl MediaEngine for NoMedia {
            async fn probe(&self, p: &Path) -> Result<crate::media::MediaInfo, crate::error::MediaError> {
                Err(crate::error::MediaError::Probe {
                    path: p.to_path_buf(),
                    detail: "unused".into(),
                })
            }
            async fn ffmpeg(&self, _args: Vec<String>) -> Result<(), crate::error::MediaError> {
                Ok(())
            }
        }

        let config = PipelineConfig::builder()
            .quality(RenderQuality::High)
            .build()
            .unwrap();
        let renderer = ManimRenderer::new(&config, Arc::new(NoMedia));
        let cmd = format!(
            "{:?}",
            renderer.command(Path::new("/w/scene_2.py"), 2, Path::new("/w"))
        );
        assert!(cmd.contains("\"-qh\""));
        assert!(cmd.contains("\"1280,720\""));
        assert!(cmd.contains("\"24\""));
        assert!(cmd.contains("\"clip_2\""));
    }
}
