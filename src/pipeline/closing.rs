//! Closing clip: the short "thank you" ending appended after the content.
//!
//! Sources are tried in order until one yields a file:
//!
//! 1. a cached clip on disk, when configured;
//! 2. a generated clip from the Veo long-running video API, polled at a fixed
//!    interval within an overall deadline;
//! 3. a locally rendered fallback scene.
//!
//! When every source fails the video simply ends without a closing clip.

use crate::config::PipelineConfig;
use crate::error::ClipError;
use crate::pipeline::fallback::{Attempt, ChainLog, Step};
use crate::pipeline::renderer::ClipRenderer;
use crate::prompts::{closing_clip_prompt, CLOSING_SCENE};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const VEO_MODEL: &str = "veo-2.0-generate-001";

/// A closing clip ready to be stitched.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosingClip {
    pub path: PathBuf,
    /// Name of the source that produced it.
    pub source: String,
}

/// One way of obtaining a closing clip.
#[async_trait]
pub trait ClosingClipSource: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a clip, writing any new file under `dest_dir`.
    async fn produce(&self, dest_dir: &Path) -> Attempt<PathBuf>;
}

// ── Cached ────────────────────────────────────────────────────────────────

/// A pre-made clip reused across jobs.
pub struct CachedClosingClip {
    path: PathBuf,
}

impl CachedClosingClip {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ClosingClipSource for CachedClosingClip {
    fn name(&self) -> &str {
        "cached"
    }

    async fn produce(&self, _dest_dir: &Path) -> Attempt<PathBuf> {
        match tokio::fs::metadata(&self.path).await {
            Ok(m) if m.is_file() && m.len() > 0 => Attempt::Success(self.path.clone()),
            Ok(_) => Attempt::Retryable(format!("{} is empty", self.path.display())),
            Err(e) => Attempt::Retryable(format!("{}: {e}", self.path.display())),
        }
    }
}

// ── Veo ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<OperationError>,
    #[serde(default)]
    response: Option<OperationResponse>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResponse {
    #[serde(default)]
    generate_video_response: Option<GenerateVideoResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateVideoResponse {
    #[serde(default)]
    generated_samples: Vec<GeneratedSample>,
}

#[derive(Debug, Deserialize)]
struct GeneratedSample {
    video: Option<VideoRef>,
}

#[derive(Debug, Deserialize)]
struct VideoRef {
    uri: Option<String>,
}

impl Operation {
    /// URI of the first generated sample of a finished operation.
    fn video_uri(&self) -> Result<&str, String> {
        if let Some(ref err) = self.error {
            return Err(format!("operation failed: {}", err.message));
        }
        self.response
            .as_ref()
            .and_then(|r| r.generate_video_response.as_ref())
            .and_then(|r| r.generated_samples.first())
            .and_then(|s| s.video.as_ref())
            .and_then(|v| v.uri.as_deref())
            .ok_or_else(|| "operation finished without a video".to_string())
    }
}

/// Time left before `deadline`, zero once it has passed.
fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Generated clip from the Gemini API's Veo model.
///
/// One attempt (start, polls and download together) never outlives
/// `timeout`; every request is also cut off at the time left.
pub struct VeoClosingClip {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
    poll_interval: Duration,
    prompt_turn: AtomicUsize,
}

impl VeoClosingClip {
    pub fn new(api_key: Option<String>, timeout: Duration, poll_interval: Duration) -> Self {
        let first_turn = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as usize)
            .unwrap_or(0);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
            client,
            timeout,
            poll_interval,
            prompt_turn: AtomicUsize::new(first_turn),
        }
    }

    /// A different prompt on each call, starting from a time-based offset.
    fn next_prompt(&self) -> String {
        closing_clip_prompt(self.prompt_turn.fetch_add(1, Ordering::Relaxed))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn start(&self, key: &str, deadline: Instant) -> Result<Operation, String> {
        let url = format!(
            "{}/models/{}:predictLongRunning",
            self.base_url.trim_end_matches('/'),
            VEO_MODEL
        );
        let body = json!({
            "instances": [{ "prompt": self.next_prompt() }],
            "parameters": { "aspectRatio": "16:9", "personGeneration": "dont_allow" },
        });
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .timeout(remaining(deadline))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("start request failed: {e}"))?;
        read_operation(resp).await
    }

    async fn poll(&self, key: &str, name: &str, deadline: Instant) -> Result<Operation, String> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), name);
        let resp = self
            .client
            .get(&url)
            .header("x-goog-api-key", key)
            .timeout(remaining(deadline))
            .send()
            .await
            .map_err(|e| format!("poll request failed: {e}"))?;
        read_operation(resp).await
    }

    async fn download(
        &self,
        key: &str,
        uri: &str,
        dest: &Path,
        deadline: Instant,
    ) -> Result<(), String> {
        let resp = self
            .client
            .get(uri)
            .header("x-goog-api-key", key)
            .timeout(remaining(deadline))
            .send()
            .await
            .map_err(|e| format!("download failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("download returned HTTP {}", resp.status()));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| format!("download failed: {e}"))?;
        if bytes.is_empty() {
            return Err("downloaded video is empty".to_string());
        }
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| format!("write {}: {e}", dest.display()))
    }

    async fn generate(
        &self,
        key: &str,
        dest_dir: &Path,
        deadline: Instant,
    ) -> Result<PathBuf, String> {
        let mut op = self.start(key, deadline).await?;
        info!("Veo operation started: {}", op.name);

        while !op.done {
            if Instant::now() + self.poll_interval > deadline {
                return Err(format!(
                    "generation did not finish within {}s",
                    self.timeout.as_secs_f64()
                ));
            }
            sleep(self.poll_interval).await;
            op = self.poll(key, &op.name, deadline).await?;
            debug!("Veo operation {} done={}", op.name, op.done);
        }

        let uri = op.video_uri()?.to_string();
        let dest = dest_dir.join("closing_veo.mp4");
        self.download(key, &uri, &dest, deadline).await?;
        Ok(dest)
    }
}

async fn read_operation(resp: reqwest::Response) -> Result<Operation, String> {
    let status = resp.status();
    if !status.is_success() {
        let detail = resp.text().await.unwrap_or_default();
        return Err(format!("HTTP {status}: {}", detail.trim()));
    }
    resp.json::<Operation>()
        .await
        .map_err(|e| format!("unexpected operation payload: {e}"))
}

#[async_trait]
impl ClosingClipSource for VeoClosingClip {
    fn name(&self) -> &str {
        "veo"
    }

    async fn produce(&self, dest_dir: &Path) -> Attempt<PathBuf> {
        let Some(ref key) = self.api_key else {
            return Attempt::Retryable("GOOGLE_API_KEY not set".to_string());
        };

        let deadline = Instant::now() + self.timeout;
        match timeout(self.timeout, self.generate(key, dest_dir, deadline)).await {
            Ok(Ok(path)) => Attempt::Success(path),
            Ok(Err(e)) => Attempt::Retryable(e),
            Err(_) => Attempt::Retryable(format!(
                "generation did not finish within {}s",
                self.timeout.as_secs_f64()
            )),
        }
    }
}

// ── Rendered fallback ─────────────────────────────────────────────────────

/// Renders the built-in "Thank You" scene.
pub struct RenderedClosingClip {
    renderer: Arc<dyn ClipRenderer>,
    index: usize,
}

impl RenderedClosingClip {
    /// `index` only names the render; it should not collide with content clips.
    pub fn new(renderer: Arc<dyn ClipRenderer>, index: usize) -> Self {
        Self { renderer, index }
    }
}

#[async_trait]
impl ClosingClipSource for RenderedClosingClip {
    fn name(&self) -> &str {
        "rendered"
    }

    async fn produce(&self, dest_dir: &Path) -> Attempt<PathBuf> {
        let media_dir = dest_dir.join("closing_render");
        match self.renderer.render(self.index, CLOSING_SCENE, &media_dir).await {
            Ok(clip) => Attempt::Success(clip.path),
            Err(e) => Attempt::Retryable(e.to_string()),
        }
    }
}

// ── Chain ─────────────────────────────────────────────────────────────────

/// Ordered closing clip sources.
pub struct ClosingClipChain {
    sources: Vec<Arc<dyn ClosingClipSource>>,
}

impl ClosingClipChain {
    pub fn new(sources: Vec<Arc<dyn ClosingClipSource>>) -> Self {
        Self { sources }
    }

    /// Cached (if configured) → Veo → rendered scene.
    pub fn from_config(config: &PipelineConfig, renderer: Arc<dyn ClipRenderer>) -> Self {
        let mut sources: Vec<Arc<dyn ClosingClipSource>> = Vec::new();
        if let Some(ref cached) = config.closing_clip_cache {
            sources.push(Arc::new(CachedClosingClip::new(cached.clone())));
        }
        sources.push(Arc::new(VeoClosingClip::new(
            config.resolved_google_key(),
            Duration::from_secs(config.closing_clip_timeout_secs),
            Duration::from_secs(config.closing_clip_poll_secs),
        )));
        sources.push(Arc::new(RenderedClosingClip::new(renderer, config.max_clips)));
        Self::new(sources)
    }

    pub async fn produce(&self, dest_dir: &Path) -> Result<ClosingClip, ClipError> {
        if let Err(e) = tokio::fs::create_dir_all(dest_dir).await {
            return Err(ClipError::ClosingClipUnavailable {
                detail: format!("create {}: {e}", dest_dir.display()),
            });
        }

        let mut log = ChainLog::new();
        for source in &self.sources {
            match log.record(source.name(), source.produce(dest_dir).await) {
                Step::Done(path) => {
                    info!("Closing clip from {}: {}", source.name(), path.display());
                    return Ok(ClosingClip {
                        path,
                        source: source.name().to_string(),
                    });
                }
                Step::Next => continue,
                Step::Stop => break,
            }
        }

        let failure = log.into_failure();
        warn!("No closing clip: {}", failure);
        Err(ClipError::ClosingClipUnavailable {
            detail: failure.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::RenderedClip;

    struct Fixed(&'static str, Attempt<PathBuf>);

    #[async_trait]
    impl ClosingClipSource for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        async fn produce(&self, _dest_dir: &Path) -> Attempt<PathBuf> {
            self.1.clone()
        }
    }

    #[tokio::test]
    async fn first_working_source_wins() {
        let dir = tempfile::tempdir().unwrap();
        let sources: Vec<Arc<dyn ClosingClipSource>> = vec![
            Arc::new(Fixed("cached", Attempt::Retryable("missing".into()))),
            Arc::new(Fixed("veo", Attempt::Success(PathBuf::from("/c/veo.mp4")))),
            Arc::new(Fixed("rendered", Attempt::Success(PathBuf::from("/c/r.mp4")))),
        ];
        let clip = ClosingClipChain::new(sources).produce(dir.path()).await.unwrap();
        assert_eq!(clip.source, "veo");
        assert_eq!(clip.path, PathBuf::from("/c/veo.mp4"));
    }

    #[tokio::test]
    async fn all_failing_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let sources: Vec<Arc<dyn ClosingClipSource>> = vec![
            Arc::new(Fixed("veo", Attempt::Retryable("timed out".into()))),
            Arc::new(Fixed("rendered", Attempt::Retryable("manim missing".into()))),
        ];
        let err = ClosingClipChain::new(sources).produce(dir.path()).await.unwrap_err();
        assert!(matches!(err, ClipError::ClosingClipUnavailable { .. }));
        assert!(err.to_string().contains("veo: timed out"));
    }

    #[tokio::test]
    async fn cached_clip_requires_non_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thanks.mp4");

        let missing = CachedClosingClip::new(&path).produce(dir.path()).await;
        assert!(matches!(missing, Attempt::Retryable(_)));

        std::fs::write(&path, b"").unwrap();
        assert!(!CachedClosingClip::new(&path).produce(dir.path()).await.is_success());

        std::fs::write(&path, b"mp4 bytes").unwrap();
        assert_eq!(
            CachedClosingClip::new(&path).produce(dir.path()).await,
            Attempt::Success(path)
        );
    }

    #[tokio::test]
    async fn veo_without_key_falls_through() {
        let veo = VeoClosingClip::new(None, Duration::from_secs(300), Duration::from_secs(15));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(veo.produce(dir.path()).await, Attempt::Retryable(_)));
    }

    #[test]
    fn consecutive_calls_rotate_the_prompt() {
        let veo = VeoClosingClip::new(None, Duration::from_secs(1), Duration::from_secs(1));
        let first = veo.next_prompt();
        let second = veo.next_prompt();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn stalled_server_is_cut_off_at_the_deadline() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "name": "operations/slow" }))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let veo = VeoClosingClip::new(
            Some("k".into()),
            Duration::from_millis(300),
            Duration::from_millis(50),
        )
        .with_base_url(server.uri());
        let dir = tempfile::tempdir().unwrap();

        let started = std::time::Instant::now();
        let attempt = veo.produce(dir.path()).await;
        assert!(matches!(attempt, Attempt::Retryable(_)), "{attempt:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn finished_operation_is_polled_and_downloaded() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/models/{VEO_MODEL}:predictLongRunning")))
            .and(header("x-goog-api-key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "operations/abc",
                "done": false
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/operations/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "operations/abc",
                "done": true,
                "response": { "generateVideoResponse": { "generatedSamples": [
                    { "video": { "uri": format!("{}/files/thanks.mp4", server.uri()) } }
                ]}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/thanks.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"mp4 bytes".to_vec()))
            .mount(&server)
            .await;

        let veo = VeoClosingClip::new(
            Some("k".into()),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .with_base_url(server.uri());
        let dir = tempfile::tempdir().unwrap();

        match veo.produce(dir.path()).await {
            Attempt::Success(p) => {
                assert_eq!(p, dir.path().join("closing_veo.mp4"));
                assert_eq!(std::fs::read(&p).unwrap(), b"mp4 bytes");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn operation_error_falls_through() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "operations/bad",
                "done": true,
                "error": { "code": 3, "message": "prompt blocked" }
            })))
            .mount(&server)
            .await;

        let veo = VeoClosingClip::new(
            Some("k".into()),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .with_base_url(server.uri());
        let dir = tempfile::tempdir().unwrap();

        match veo.produce(dir.path()).await {
            Attempt::Retryable(reason) => assert!(reason.contains("prompt blocked")),
            other => panic!("expected a retryable failure, got {other:?}"),
        }
    }

    #[test]
    fn operation_uri_is_extracted() {
        let op: Operation = serde_json::from_str(
            r#"{"name":"models/veo/operations/abc","done":true,
                "response":{"@type":"x","generateVideoResponse":{"generatedSamples":[
                  {"video":{"uri":"https://files/v1.mp4"}}]}}}"#,
        )
        .unwrap();
        assert_eq!(op.video_uri().unwrap(), "https://files/v1.mp4");
    }

    #[test]
    fn operation_error_is_reported() {
        let op: Operation = serde_json::from_str(
            r#"{"name":"op","done":true,"error":{"code":3,"message":"prompt blocked"}}"#,
        )
        .unwrap();
        assert!(op.video_uri().unwrap_err().contains("prompt blocked"));
    }

    #[test]
    fn pending_operation_parses() {
        let op: Operation = serde_json::from_str(r#"{"name":"op"}"#).unwrap();
        assert!(!op.done);
        assert!(op.video_uri().is_err());
    }

    struct StubRenderer;

    #[async_trait]
    impl ClipRenderer for StubRenderer {
        async fn render(
            &self,
            index: usize,
            descriptor: &str,
            media_dir: &Path,
        ) -> Result<RenderedClip, ClipError> {
            assert!(descriptor.contains("Thank You"));
            Ok(RenderedClip {
                index,
                path: media_dir.join("closing.mp4"),
                width: 1280,
                height: 720,
                fps: 24.0,
                duration_secs: 3.0,
            })
        }
    }

    #[tokio::test]
    async fn rendered_source_uses_thank_you_scene() {
        let dir = tempfile::tempdir().unwrap();
        let src = RenderedClosingClip::new(Arc::new(StubRenderer), 4);
        match src.produce(dir.path()).await {
            Attempt::Success(p) => assert!(p.ends_with("closing_render/closing.mp4")),
            other => panic!("expected success, got {other:?}"),
        }
    }
}
