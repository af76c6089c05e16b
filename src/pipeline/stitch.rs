//! Stitcher: normalize every clip and concatenate them into one video.
//!
//! All segments go through a single `filter_complex` concat with one video
//! and one audio stream per segment. Silent segments get generated silence
//! of their own length so the output audio track is continuous; segments
//! that could not be normalized are scaled inside the graph instead.

use crate::config::CanonicalFormat;
use crate::error::{ClipError, PipelineError};
use crate::media::{remove_quietly, FfmpegArgs, MediaEngine};
use crate::output::{ComposedClip, NormalizedClip};
use crate::pipeline::closing::ClosingClip;
use crate::pipeline::normalize::Normalizer;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a successful stitch.
#[derive(Debug, Clone, PartialEq)]
pub struct StitchOutcome {
    pub path: PathBuf,
    /// Segments in the output, closing clip included.
    pub segments: usize,
    pub duration_secs: f64,
    /// Degradations met while preparing segments.
    pub clip_errors: Vec<ClipError>,
}

/// `filter_complex` graph concatenating `segments` into `[v]` and `[a]`.
pub fn build_concat_graph(segments: &[NormalizedClip], canonical: &CanonicalFormat) -> String {
    let mut graph = String::new();
    let rate = canonical.audio_sample_rate;

    for (i, seg) in segments.iter().enumerate() {
        if seg.canonical {
            let _ = write!(graph, "[{i}:v]setsar=1[v{i}];");
        } else {
            let _ = write!(
                graph,
                "[{i}:v]scale={w}:{h},setsar=1,fps={fps}[v{i}];",
                w = canonical.width,
                h = canonical.height,
                fps = canonical.fps
            );
        }

        let dur = seg.duration_secs.max(0.0);
        if seg.has_audio {
            let _ = write!(
                graph,
                "[{i}:a]aresample={rate},aformat=sample_fmts=fltp:channel_layouts=stereo,\
                 apad,atrim=0:{dur:.3},asetpts=PTS-STARTPTS[a{i}];"
            );
        } else {
            let _ = write!(
                graph,
                "anullsrc=r={rate}:cl=stereo,atrim=0:{dur:.3},asetpts=PTS-STARTPTS[a{i}];"
            );
        }
    }

    for i in 0..segments.len() {
        let _ = write!(graph, "[v{i}][a{i}]");
    }
    let _ = write!(graph, "concat=n={}:v=1:a=1[v][a]", segments.len());
    graph
}

/// ffmpeg arguments for the final concat.
pub fn stitch_args(
    segments: &[NormalizedClip],
    canonical: &CanonicalFormat,
    output: &Path,
) -> Vec<String> {
    let args = segments
        .iter()
        .fold(FfmpegArgs::new(), |args, seg| args.input(&seg.path));
    args.filter_complex(build_concat_graph(segments, canonical))
        .map("[v]")
        .map("[a]")
        .h264()
        .aac(canonical.audio_sample_rate)
        .faststart()
        .build(output)
}

pub struct Stitcher {
    media: Arc<dyn MediaEngine>,
    normalizer: Normalizer,
    canonical: CanonicalFormat,
}

impl Stitcher {
    pub fn new(media: Arc<dyn MediaEngine>, canonical: CanonicalFormat) -> Self {
        Self {
            normalizer: Normalizer::new(Arc::clone(&media), canonical),
            media,
            canonical,
        }
    }

    /// Normalize one input, falling back to the raw clip when it is readable.
    async fn prepare(
        &self,
        index: usize,
        input: &Path,
        scratch: &Path,
        errors: &mut Vec<ClipError>,
    ) -> Option<NormalizedClip> {
        let target = scratch.join(format!("normalized_{index}.mp4"));
        match self.normalizer.normalize(index, input, &target).await {
            Ok(clip) => Some(clip),
            Err(e) => {
                warn!("{}", e);
                errors.push(e);
                match self.media.probe(input).await {
                    Ok(info) if info.video.is_some() => Some(NormalizedClip {
                        path: input.to_path_buf(),
                        duration_secs: info.duration_secs,
                        has_audio: info.has_audio(),
                        canonical: false,
                    }),
                    Ok(_) | Err(_) => {
                        warn!("Clip {}: unreadable, dropped from the video", index);
                        None
                    }
                }
            }
        }
    }

    /// Stitch `clips` (and `closing`, last) into `output`.
    pub async fn stitch(
        &self,
        clips: &[ComposedClip],
        closing: Option<&ClosingClip>,
        scratch: &Path,
        output: &Path,
    ) -> Result<StitchOutcome, PipelineError> {
        tokio::fs::create_dir_all(scratch)
            .await
            .map_err(|e| PipelineError::Stitch {
                reason: format!("create {}: {e}", scratch.display()),
            })?;

        let mut errors = Vec::new();
        let mut segments = Vec::with_capacity(clips.len() + 1);
        for clip in clips {
            if let Some(seg) = self.prepare(clip.index, &clip.path, scratch, &mut errors).await {
                segments.push(seg);
            }
        }

        // A closing clip alone is not a video.
        if segments.is_empty() {
            return Err(PipelineError::Stitch {
                reason: format!("none of {} content clips is readable", clips.len()),
            });
        }

        if let Some(closing) = closing {
            let index = clips.iter().map(|c| c.index + 1).max().unwrap_or(0);
            if let Some(seg) = self.prepare(index, &closing.path, scratch, &mut errors).await {
                segments.push(seg);
            }
        }

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::OutputWriteFailed {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let partial = output.with_extension("stitching.mp4");
        info!("Stitching {} segments → {}", segments.len(), output.display());
        if let Err(e) = self
            .media
            .ffmpeg(stitch_args(&segments, &self.canonical, &partial))
            .await
        {
            remove_quietly(&partial).await;
            return Err(PipelineError::Stitch {
                reason: e.to_string(),
            });
        }

        tokio::fs::rename(&partial, output)
            .await
            .map_err(|e| PipelineError::OutputWriteFailed {
                path: output.to_path_buf(),
                source: e,
            })?;

        Ok(StitchOutcome {
            path: output.to_path_buf(),
            segments: segments.len(),
            duration_secs: segments.iter().map(|s| s.duration_secs).sum(),
            clip_errors: errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::MediaError;
    use crate::media::{AudioStreamInfo, MediaInfo, VideoStreamInfo};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn canonical() -> CanonicalFormat {
        PipelineConfig::default().canonical()
    }

    fn seg(path: &str, secs: f64, audio: bool, canonical: bool) -> NormalizedClip {
        NormalizedClip {
            path: PathBuf::from(path),
            duration_secs: secs,
            has_audio: audio,
            canonical,
        }
    }

    #[test]
    fn silent_segment_gets_generated_silence() {
        let graph = build_concat_graph(
            &[seg("a.mp4", 5.0, true, true), seg("b.mp4", 4.0, false, true)],
            &canonical(),
        );
        assert!(graph.contains("[0:a]aresample=44100"));
        assert!(graph.contains("anullsrc=r=44100:cl=stereo,atrim=0:4.000"));
        assert!(!graph.contains("[1:a]"));
        assert!(graph.ends_with("[v0][a0][v1][a1]concat=n=2:v=1:a=1[v][a]"));
    }

    #[test]
    fn non_canonical_segment_is_scaled_in_graph() {
        let graph = build_concat_graph(
            &[seg("a.mp4", 5.0, true, true), seg("b.mp4", 3.0, true, false)],
            &canonical(),
        );
        assert!(graph.contains("[0:v]setsar=1[v0]"));
        assert!(graph.contains("[1:v]scale=1280:720,setsar=1,fps=24[v1]"));
    }

    #[test]
    fn output_args_use_aac_at_44100() {
        let args = stitch_args(&[seg("a.mp4", 5.0, true, true)], &canonical(), Path::new("o.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-ar 44100"));
        assert!(joined.contains("+faststart"));
        assert!(joined.contains("-map [v] -map [a]"));
    }

    /// Canonical clips for known paths; ffmpeg writes its output file.
    struct FakeMedia {
        known: HashMap<PathBuf, MediaInfo>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl MediaEngine for FakeMedia {
        async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaError> {
            self.known.get(path).cloned().ok_or_else(|| MediaError::Probe {
                path: path.to_path_buf(),
                detail: "unreadable".into(),
            })
        }
        async fn ffmpeg(&self, args: Vec<String>) -> Result<(), MediaError> {
            if let Some(out) = args.last() {
                std::fs::write(out, b"mp4").unwrap();
            }
            self.calls.lock().unwrap().push(args);
            Ok(())
        }
    }

    fn canonical_info(audio: bool) -> MediaInfo {
        MediaInfo {
            duration_secs: 5.0,
            video: Some(VideoStreamInfo {
                width: 1280,
                height: 720,
                fps: 24.0,
            }),
            audio: audio.then(|| AudioStreamInfo {
                duration_secs: 5.0,
                sample_rate: 44_100,
                channels: 2,
            }),
        }
    }

    fn composed(index: usize, path: &Path, has_audio: bool) -> ComposedClip {
        ComposedClip {
            index,
            path: path.to_path_buf(),
            has_audio,
            degraded: None,
        }
    }

    #[tokio::test]
    async fn unreadable_inputs_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.mp4");
        let bad = dir.path().join("bad.mp4");
        let media = Arc::new(FakeMedia {
            known: HashMap::from([(good.clone(), canonical_info(true))]),
            calls: Mutex::new(vec![]),
        });
        let stitcher = Stitcher::new(media.clone(), canonical());
        let out = dir.path().join("out/video.mp4");

        let outcome = stitcher
            .stitch(
                &[composed(0, &good, true), composed(1, &bad, false)],
                None,
                &dir.path().join("scratch"),
                &out,
            )
            .await
            .unwrap();

        assert_eq!(outcome.segments, 1);
        assert_eq!(outcome.clip_errors.len(), 1);
        assert!(out.exists());
        assert!(!out.with_extension("stitching.mp4").exists());
    }

    #[tokio::test]
    async fn nothing_valid_is_a_stitch_error() {
        let dir = tempfile::tempdir().unwrap();
        let media = Arc::new(FakeMedia {
            known: HashMap::new(),
            calls: Mutex::new(vec![]),
        });
        let stitcher = Stitcher::new(media, canonical());
        let err = stitcher
            .stitch(
                &[composed(0, &dir.path().join("x.mp4"), false)],
                None,
                dir.path(),
                &dir.path().join("out.mp4"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Stitch { .. }));
    }

    #[tokio::test]
    async fn closing_clip_alone_is_a_stitch_error() {
        let dir = tempfile::tempdir().unwrap();
        let closing = dir.path().join("closing.mp4");
        let media = Arc::new(FakeMedia {
            known: HashMap::from([(closing.clone(), canonical_info(false))]),
            calls: Mutex::new(vec![]),
        });
        let stitcher = Stitcher::new(media.clone(), canonical());
        let out = dir.path().join("out.mp4");

        let err = stitcher
            .stitch(
                &[composed(0, &dir.path().join("broken.mp4"), true)],
                Some(&ClosingClip {
                    path: closing,
                    source: "veo".into(),
                }),
                dir.path(),
                &out,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Stitch { .. }));
        assert!(!out.exists());
        assert!(media.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closing_clip_is_appended_last() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mp4");
        let closing = dir.path().join("closing.mp4");
        let media = Arc::new(FakeMedia {
            known: HashMap::from([
                (a.clone(), canonical_info(true)),
                (closing.clone(), canonical_info(false)),
            ]),
            calls: Mutex::new(vec![]),
        });
        let stitcher = Stitcher::new(media.clone(), canonical());
        let outcome = stitcher
            .stitch(
                &[composed(0, &a, true)],
                Some(&ClosingClip {
                    path: closing.clone(),
                    source: "rendered".into(),
                }),
                dir.path(),
                &dir.path().join("final.mp4"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.segments, 2);

        let calls = media.calls.lock().unwrap();
        let args = calls.last().unwrap();
        let inputs: Vec<&String> = args
            .iter()
            .enumerate()
            .filter(|(i, _)| *i > 0 && args[i - 1] == "-i")
            .map(|(_, a)| a)
            .collect();
        assert_eq!(inputs.len(), 2);
        assert!(inputs[1].ends_with("closing.mp4"));
        assert!(args.join(" ").contains("anullsrc"));
    }
}
