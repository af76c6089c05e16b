//! Narrator: speech synthesis with a primary network TTS and an offline
//! fallback.
//!
//! Providers are tried in order through a [`ChainLog`]. A provider that
//! returns a file only counts as successful once the file has been probed
//! and holds an audio stream with a positive duration; anything else is
//! deleted and the next provider is tried.

use crate::config::PipelineConfig;
use crate::error::ClipError;
use crate::media::{remove_quietly, MediaEngine, ToolCommand};
use crate::output::NarrationClip;
use crate::pipeline::fallback::{Attempt, ChainLog, Step};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const LMNT_BASE_URL: &str = "https://api.lmnt.com";

/// One synthesis job.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    /// Voice id in the primary provider's namespace (e.g. `juniper`).
    pub voice: String,
    pub sample_rate: u32,
    /// Output path without extension; providers add their own.
    pub output_stem: PathBuf,
}

impl SpeechRequest {
    fn output_with_extension(&self, ext: &str) -> PathBuf {
        self.output_stem.with_extension(ext)
    }
}

/// A text-to-speech backend.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Write speech for `request`, returning the audio file path.
    async fn synthesize(&self, request: &SpeechRequest) -> Attempt<PathBuf>;
}

/// Edge voice used in place of a primary-provider voice id.
pub fn fallback_voice(voice_id: &str) -> &'static str {
    match voice_id {
        "brandon" => "en-US-AriaNeural",
        "amy" => "en-US-JennyNeural",
        "ansel" => "en-US-GuyNeural",
        "juniper" => "en-US-JennyNeural",
        _ => "en-US-AriaNeural",
    }
}

// ── LMNT ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct LmntSpeechBody<'a> {
    text: &'a str,
    voice: &'a str,
    format: &'a str,
    sample_rate: u32,
}

/// LMNT HTTP synthesis (`POST /v1/ai/speech/bytes`).
pub struct LmntSpeech {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl LmntSpeech {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            base_url: LMNT_BASE_URL.to_string(),
            client,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl SpeechProvider for LmntSpeech {
    fn name(&self) -> &str {
        "lmnt"
    }

    async fn synthesize(&self, request: &SpeechRequest) -> Attempt<PathBuf> {
        let Some(ref key) = self.api_key else {
            return Attempt::Retryable("LMNT_API_KEY not set".to_string());
        };
        if request.text.trim().is_empty() {
            return Attempt::Fatal("empty narration text".to_string());
        }

        let body = LmntSpeechBody {
            text: &request.text,
            voice: &request.voice,
            format: "wav",
            sample_rate: request.sample_rate,
        };
        let url = format!("{}/v1/ai/speech/bytes", self.base_url.trim_end_matches('/'));

        let response = match self
            .client
            .post(&url)
            .header("X-API-Key", key)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Attempt::Retryable(format!("request failed: {e}")),
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Attempt::Retryable(format!("HTTP {status}: {}", detail.trim()));
        }

        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => return Attempt::Retryable(format!("reading body: {e}")),
        };

        let path = request.output_with_extension("wav");
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            return Attempt::Retryable(format!("write {}: {e}", path.display()));
        }
        debug!("lmnt: {} bytes → {}", bytes.len(), path.display());
        Attempt::Success(path)
    }
}

// ── edge-tts ──────────────────────────────────────────────────────────────

/// Offline-capable fallback through the `edge-tts` CLI.
pub struct EdgeTtsSpeech {
    program: PathBuf,
    timeout: Duration,
}

impl EdgeTtsSpeech {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    fn command(&self, request: &SpeechRequest, output: &Path) -> ToolCommand {
        let mut cmd = ToolCommand::new(self.program.clone());
        cmd.args(["--voice", fallback_voice(&request.voice)])
            .args(["--text".to_string(), request.text.clone()])
            .args([
                "--write-media".to_string(),
                output.to_string_lossy().to_string(),
            ])
            .timeout(self.timeout);
        cmd
    }
}

#[async_trait]
impl SpeechProvider for EdgeTtsSpeech {
    fn name(&self) -> &str {
        "edge-tts"
    }

    async fn synthesize(&self, request: &SpeechRequest) -> Attempt<PathBuf> {
        if request.text.trim().is_empty() {
            return Attempt::Fatal("empty narration text".to_string());
        }
        let path = request.output_with_extension("mp3");
        match self.command(request, &path).execute().await {
            Ok(_) => Attempt::Success(path),
            Err(e) => Attempt::Retryable(e.to_string()),
        }
    }
}

// ── Narrator ──────────────────────────────────────────────────────────────

/// Runs the provider chain and validates the result.
pub struct Narrator {
    providers: Vec<Arc<dyn SpeechProvider>>,
    media: Arc<dyn MediaEngine>,
    voice: String,
    sample_rate: u32,
}

impl Narrator {
    pub fn new(
        providers: Vec<Arc<dyn SpeechProvider>>,
        media: Arc<dyn MediaEngine>,
        voice: impl Into<String>,
        sample_rate: u32,
    ) -> Self {
        Self {
            providers,
            media,
            voice: voice.into(),
            sample_rate,
        }
    }

    /// LMNT first, then edge-tts.
    pub fn from_config(config: &PipelineConfig, media: Arc<dyn MediaEngine>) -> Self {
        let timeout = Duration::from_secs(config.media_timeout_secs);
        let providers: Vec<Arc<dyn SpeechProvider>> = vec![
            Arc::new(LmntSpeech::new(config.resolved_lmnt_key(), timeout)),
            Arc::new(EdgeTtsSpeech::new(config.tools.edge_tts.clone(), timeout)),
        ];
        Self::new(providers, media, config.voice_id.clone(), config.tts_sample_rate)
    }

    /// Synthesize `text` for clip `clip` into `out_dir`.
    pub async fn narrate(
        &self,
        clip: usize,
        text: &str,
        out_dir: &Path,
    ) -> Result<NarrationClip, ClipError> {
        if let Err(e) = tokio::fs::create_dir_all(out_dir).await {
            return Err(ClipError::VoiceGenFailed {
                clip,
                detail: format!("create {}: {e}", out_dir.display()),
            });
        }

        let mut log = ChainLog::new();
        for provider in &self.providers {
            let request = SpeechRequest {
                text: text.to_string(),
                voice: self.voice.clone(),
                sample_rate: self.sample_rate,
                output_stem: out_dir.join(format!("narration_{clip}_{}", provider.name())),
            };

            let attempt = match provider.synthesize(&request).await {
                Attempt::Success(path) => self.validate(provider.name(), path).await,
                Attempt::Retryable(r) => Attempt::Retryable(r),
                Attempt::Fatal(r) => Attempt::Fatal(r),
            };

            match log.record(provider.name(), attempt) {
                Step::Done(narration) => {
                    info!(
                        "Clip {}: narration by {} ({:.2}s)",
                        clip,
                        narration.provider,
                        narration.duration_secs
                    );
                    return Ok(narration);
                }
                Step::Next => continue,
                Step::Stop => break,
            }
        }

        let failure = log.into_failure();
        warn!("Clip {}: narration failed: {}", clip, failure);
        Err(ClipError::VoiceGenFailed {
            clip,
            detail: failure.to_string(),
        })
    }

    /// Probe a provider's file; delete it unless it carries real audio.
    async fn validate(&self, provider: &str, path: PathBuf) -> Attempt<NarrationClip> {
        let reason = match self.media.probe(&path).await {
            Ok(info) => match info.audio {
                Some(audio) => {
                    let duration = if audio.duration_secs > 0.0 {
                        audio.duration_secs
                    } else {
                        info.duration_secs
                    };
                    if duration > 0.0 {
                        return Attempt::Success(NarrationClip {
                            path,
                            duration_secs: duration,
                            sample_rate: audio.sample_rate,
                            channels: audio.channels,
                            provider: provider.to_string(),
                        });
                    }
                    "audio has zero duration".to_string()
                }
                None => "file has no audio stream".to_string(),
            },
            Err(e) => e.to_string(),
        };
        remove_quietly(&path).await;
        Attempt::Retryable(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use crate::media::{AudioStreamInfo, MediaInfo};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Scripted {
        name: &'static str,
        outcome: Attempt<()>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(name: &'static str, outcome: Attempt<()>) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome,
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl SpeechProvider for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        async fn synthesize(&self, request: &SpeechRequest) -> Attempt<PathBuf> {
            *self.calls.lock().unwrap() += 1;
            match &self.outcome {
                Attempt::Success(()) => {
                    let path = request.output_with_extension("wav");
                    std::fs::write(&path, b"RIFF").unwrap();
                    Attempt::Success(path)
                }
                Attempt::Retryable(r) => Attempt::Retryable(r.clone()),
                Attempt::Fatal(r) => Attempt::Fatal(r.clone()),
            }
        }
    }

    /// Reports audio durations by file name; unknown files have no audio.
    struct Probe(HashMap<String, f64>);

    #[async_trait]
    impl MediaEngine for Probe {
        async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaError> {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            let audio = self.0.get(&name).map(|d| AudioStreamInfo {
                duration_secs: *d,
                sample_rate: 24_000,
                channels: 1,
            });
            Ok(MediaInfo {
                duration_secs: self.0.get(&name).copied().unwrap_or(0.0),
                video: None,
                audio,
            })
        }
        async fn ffmpeg(&self, _args: Vec<String>) -> Result<(), MediaError> {
            Ok(())
        }
    }

    fn probe(entries: &[(&str, f64)]) -> Arc<Probe> {
        Arc::new(Probe(
            entries.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        ))
    }

    #[test]
    fn voice_map() {
        assert_eq!(fallback_voice("juniper"), "en-US-JennyNeural");
        assert_eq!(fallback_voice("ansel"), "en-US-GuyNeural");
        assert_eq!(fallback_voice("brandon"), "en-US-AriaNeural");
        assert_eq!(fallback_voice("someone-else"), "en-US-AriaNeural");
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let primary = Scripted::new("primary", Attempt::Success(()));
        let fallback = Scripted::new("fallback", Attempt::Success(()));
        let providers: Vec<Arc<dyn SpeechProvider>> = vec![primary.clone(), fallback.clone()];
        let narrator = Narrator::new(
            providers,
            probe(&[("narration_0_primary.wav", 4.2)]),
            "juniper",
            24_000,
        );

        let clip = narrator.narrate(0, "Hello", dir.path()).await.unwrap();
        assert_eq!(clip.provider, "primary");
        assert!((clip.duration_secs - 4.2).abs() < 1e-9);
        assert_eq!(*fallback.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_key_falls_through_to_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let lmnt = Arc::new(LmntSpeech::new(None, Duration::from_secs(1)));
        let fallback = Scripted::new("fallback", Attempt::Success(()));
        let providers: Vec<Arc<dyn SpeechProvider>> = vec![lmnt, fallback];
        let narrator = Narrator::new(
            providers,
            probe(&[("narration_3_fallback.wav", 2.0)]),
            "juniper",
            24_000,
        );
        let clip = narrator.narrate(3, "Hello", dir.path()).await.unwrap();
        assert_eq!(clip.provider, "fallback");
    }

    #[tokio::test]
    async fn empty_audio_is_rejected_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let primary = Scripted::new("primary", Attempt::Success(()));
        let providers: Vec<Arc<dyn SpeechProvider>> = vec![primary];
        let narrator = Narrator::new(
            providers,
            probe(&[("narration_1_primary.wav", 0.0)]),
            "juniper",
            24_000,
        );
        let err = narrator.narrate(1, "Hello", dir.path()).await.unwrap_err();
        assert!(matches!(err, ClipError::VoiceGenFailed { clip: 1, .. }));
        assert!(err.to_string().contains("zero duration"));
        assert!(!dir.path().join("narration_1_primary.wav").exists());
    }

    #[tokio::test]
    async fn both_failing_reports_every_reason() {
        let dir = tempfile::tempdir().unwrap();
        let providers: Vec<Arc<dyn SpeechProvider>> = vec![
            Scripted::new("primary", Attempt::Retryable("HTTP 503".into())),
            Scripted::new("fallback", Attempt::Retryable("not installed".into())),
        ];
        let narrator = Narrator::new(
            providers,
            probe(&[]),
            "juniper",
            24_000,
        );
        let err = narrator.narrate(2, "Hello", dir.path()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("primary: HTTP 503"));
        assert!(msg.contains("fallback: not installed"));
    }

    #[tokio::test]
    async fn fatal_stops_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = Scripted::new("fallback", Attempt::Success(()));
        let providers: Vec<Arc<dyn SpeechProvider>> = vec![
            Scripted::new("primary", Attempt::Fatal("text rejected".into())),
            fallback.clone(),
        ];
        let narrator = Narrator::new(
            providers,
            probe(&[("narration_0_fallback.wav", 1.0)]),
            "juniper",
            24_000,
        );
        assert!(narrator.narrate(0, "Hello", dir.path()).await.is_err());
        assert_eq!(*fallback.calls.lock().unwrap(), 0);
    }

    #[test]
    fn edge_command_uses_mapped_voice() {
        let edge = EdgeTtsSpeech::new("edge-tts", Duration::from_secs(5));
        let req = SpeechRequest {
            text: "Hi there".into(),
            voice: "ansel".into(),
            sample_rate: 24_000,
            output_stem: PathBuf::from("/tmp/n_0"),
        };
        let dbg = format!("{:?}", edge.command(&req, Path::new("/tmp/n_0.mp3")));
        assert!(dbg.contains("en-US-GuyNeural"));
        assert!(dbg.contains("\"Hi there\""));
        assert!(dbg.contains("/tmp/n_0.mp3"));
    }
}
