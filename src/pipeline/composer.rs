//! Clip Composer: mux a rendered clip with its narration.
//!
//! When the narration runs longer than the animation, the last frame is
//! held (`tpad=stop_mode=clone`) for the difference plus a small margin.
//! The audio is padded with silence and the output bounded by `-shortest`,
//! so the composed audio track is never shorter than the narration.
//!
//! Composition never fails a job: on any error the silent rendered clip is
//! returned with [`ComposedClip::degraded`] set.

use crate::config::PipelineConfig;
use crate::media::{remove_quietly, FfmpegArgs, MediaEngine};
use crate::output::{ComposedClip, NarrationClip, RenderedClip};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Allowed shortfall of the composed audio against the narration.
const AUDIO_TOLERANCE_SECS: f64 = 0.05;

/// Seconds of frozen last frame needed to fit `audio_secs` of narration.
pub fn freeze_duration(video_secs: f64, audio_secs: f64, margin_secs: f64) -> Option<f64> {
    (audio_secs > video_secs).then(|| audio_secs - video_secs + margin_secs)
}

/// ffmpeg arguments muxing `video` with `audio` into `output`.
pub fn compose_args(
    video: &Path,
    video_secs: f64,
    audio: &Path,
    audio_secs: f64,
    output: &Path,
    margin_secs: f64,
    sample_rate: u32,
) -> Vec<String> {
    let args = FfmpegArgs::new().input(video).input(audio);
    let args = match freeze_duration(video_secs, audio_secs, margin_secs) {
        Some(freeze) => args
            .filter_complex(format!(
                "[0:v]tpad=stop_mode=clone:stop_duration={freeze:.3}[v];[1:a]apad[a]"
            ))
            .map("[v]")
            .map("[a]")
            .h264(),
        None => args
            .filter_complex("[1:a]apad[a]")
            .map("0:v")
            .map("[a]")
            .video_codec("copy"),
    };
    args.aac(sample_rate).shortest().build(output)
}

pub struct Composer {
    media: Arc<dyn MediaEngine>,
    freeze_margin_secs: f64,
    audio_sample_rate: u32,
}

impl Composer {
    pub fn new(media: Arc<dyn MediaEngine>, config: &PipelineConfig) -> Self {
        Self {
            media,
            freeze_margin_secs: config.freeze_margin_secs,
            audio_sample_rate: config.audio_sample_rate,
        }
    }

    /// Pair `rendered` with `narration`, writing to `output`.
    ///
    /// Without narration the rendered clip passes through untouched.
    pub async fn compose(
        &self,
        rendered: &RenderedClip,
        narration: Option<&NarrationClip>,
        output: &Path,
    ) -> ComposedClip {
        let Some(narration) = narration else {
            return ComposedClip {
                index: rendered.index,
                path: rendered.path.clone(),
                has_audio: false,
                degraded: None,
            };
        };

        match self.mux(rendered, narration, output).await {
            Ok(()) => ComposedClip {
                index: rendered.index,
                path: output.to_path_buf(),
                has_audio: true,
                degraded: None,
            },
            Err(reason) => {
                warn!("Clip {}: composition degraded: {}", rendered.index, reason);
                remove_quietly(output).await;
                ComposedClip {
                    index: rendered.index,
                    path: rendered.path.clone(),
                    has_audio: false,
                    degraded: Some(reason),
                }
            }
        }
    }

    async fn mux(
        &self,
        rendered: &RenderedClip,
        narration: &NarrationClip,
        output: &Path,
    ) -> Result<(), String> {
        let args = compose_args(
            &rendered.path,
            rendered.duration_secs,
            &narration.path,
            narration.duration_secs,
            output,
            self.freeze_margin_secs,
            self.audio_sample_rate,
        );
        self.media.ffmpeg(args).await.map_err(|e| e.to_string())?;

        let info = self.media.probe(output).await.map_err(|e| e.to_string())?;
        let audio = info
            .audio
            .as_ref()
            .ok_or_else(|| "composed clip has no audio stream".to_string())?;
        let audio_secs = if audio.duration_secs > 0.0 {
            audio.duration_secs
        } else {
            info.duration_secs
        };
        if audio_secs + AUDIO_TOLERANCE_SECS < narration.duration_secs {
            return Err(format!(
                "composed audio {:.2}s shorter than narration {:.2}s",
                audio_secs, narration.duration_secs
            ));
        }

        debug!(
            "Clip {}: composed {:.2}s video with {:.2}s narration",
            rendered.index, info.duration_secs, narration.duration_secs
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use crate::media::{AudioStreamInfo, MediaInfo, VideoStreamInfo};
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[test]
    fn freeze_only_when_audio_is_longer() {
        assert_eq!(freeze_duration(5.0, 4.0, 0.1), None);
        assert_eq!(freeze_duration(5.0, 5.0, 0.1), None);
        let f = freeze_duration(5.0, 8.0, 0.1).unwrap();
        assert!((f - 3.1).abs() < 1e-9);
    }

    #[test]
    fn long_narration_freezes_last_frame() {
        let args = compose_args(
            Path::new("v.mp4"),
            5.0,
            Path::new("n.wav"),
            8.0,
            Path::new("out.mp4"),
            0.1,
            44_100,
        );
        let joined = args.join(" ");
        assert!(joined.contains("tpad=stop_mode=clone:stop_duration=3.100"));
        assert!(joined.contains("apad"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-shortest"));
    }

    #[test]
    fn short_narration_copies_video() {
        let joined = compose_args(
            Path::new("v.mp4"),
            10.0,
            Path::new("n.wav"),
            3.0,
            Path::new("out.mp4"),
            0.1,
            44_100,
        )
        .join(" ");
        assert!(!joined.contains("tpad"));
        assert!(joined.contains("-map 0:v"));
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a aac"));
    }

    struct FakeMedia {
        fail_ffmpeg: bool,
        audio_secs: Option<f64>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl MediaEngine for FakeMedia {
        async fn probe(&self, _path: &Path) -> Result<MediaInfo, MediaError> {
            Ok(MediaInfo {
                duration_secs: self.audio_secs.unwrap_or(5.0),
                video: Some(VideoStreamInfo {
                    width: 1280,
                    height: 720,
                    fps: 24.0,
                }),
                audio: self.audio_secs.map(|d| AudioStreamInfo {
                    duration_secs: d,
                    sample_rate: 44_100,
                    channels: 2,
                }),
            })
        }

        async fn ffmpeg(&self, args: Vec<String>) -> Result<(), MediaError> {
            self.calls.lock().unwrap().push(args);
            if self.fail_ffmpeg {
                return Err(MediaError::Failed {
                    tool: "ffmpeg".into(),
                    status: "exit status: 1".into(),
                    stderr: "Invalid data".into(),
                });
            }
            Ok(())
        }
    }

    fn rendered() -> RenderedClip {
        RenderedClip {
            index: 1,
            path: PathBuf::from("/w/clip_1.mp4"),
            width: 1280,
            height: 720,
            fps: 24.0,
            duration_secs: 5.0,
        }
    }

    fn narration(secs: f64) -> NarrationClip {
        NarrationClip {
            path: PathBuf::from("/w/narration_1.wav"),
            duration_secs: secs,
            sample_rate: 24_000,
            channels: 1,
            provider: "lmnt".into(),
        }
    }

    fn composer(media: FakeMedia) -> (Composer, Arc<FakeMedia>) {
        let media = Arc::new(media);
        let c = Composer::new(media.clone(), &PipelineConfig::default());
        (c, media)
    }

    #[tokio::test]
    async fn silent_clip_passes_through() {
        let (c, media) = composer(FakeMedia {
            fail_ffmpeg: false,
            audio_secs: None,
            calls: Mutex::new(vec![]),
        });
        let out = c.compose(&rendered(), None, Path::new("/w/composed_1.mp4")).await;
        assert_eq!(out.path, rendered().path);
        assert!(!out.has_audio);
        assert!(out.degraded.is_none());
        assert!(media.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_mux_keeps_audio() {
        let (c, _) = composer(FakeMedia {
            fail_ffmpeg: false,
            audio_secs: Some(8.1),
            calls: Mutex::new(vec![]),
        });
        let out = c
            .compose(&rendered(), Some(&narration(8.0)), Path::new("/w/composed_1.mp4"))
            .await;
        assert_eq!(out.path, PathBuf::from("/w/composed_1.mp4"));
        assert!(out.has_audio);
        assert!(out.degraded.is_none());
    }

    #[tokio::test]
    async fn ffmpeg_failure_degrades_to_rendered() {
        let (c, _) = composer(FakeMedia {
            fail_ffmpeg: true,
            audio_secs: Some(8.0),
            calls: Mutex::new(vec![]),
        });
        let out = c
            .compose(&rendered(), Some(&narration(8.0)), Path::new("/w/composed_1.mp4"))
            .await;
        assert_eq!(out.path, rendered().path);
        assert!(!out.has_audio);
        assert!(out.degraded.unwrap().contains("Invalid data"));
    }

    #[tokio::test]
    async fn truncated_audio_degrades() {
        let (c, _) = composer(FakeMedia {
            fail_ffmpeg: false,
            audio_secs: Some(5.0),
            calls: Mutex::new(vec![]),
        });
        let out = c
            .compose(&rendered(), Some(&narration(8.0)), Path::new("/w/composed_1.mp4"))
            .await;
        assert!(out.degraded.unwrap().contains("shorter than narration"));
    }
}
