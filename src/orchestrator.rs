//! Job orchestration: one pipeline run per job, whatever the source.
//!
//! [`Orchestrator::submit`] records a `pending` job, spawns the worker and
//! returns the id at once; [`Orchestrator::run`] does the same work inline.
//! URLs and uploaded files go through the same path: an upload is stored
//! under the upload directory and submitted as a [`SourceRef::File`].
//!
//! Inside a job the steps run in order. Only narration overlaps, bounded by
//! `narration_concurrency`. Per-clip problems never fail the job; they are
//! recorded in the metrics. The job fails only when fetching, planning or
//! stitching fails, or when no clip renders.

use crate::config::PipelineConfig;
use crate::error::{ClipError, PipelineError};
use crate::job::{Job, JobId, JobMetrics, JobStatus, SourceRef};
use crate::media::{remove_quietly, FfmpegEngine, MediaEngine};
use crate::output::{ClipPlan, ComposedClip, NarrationClip, PipelineOutput, RenderedClip};
use crate::pipeline::closing::{ClosingClip, ClosingClipChain};
use crate::pipeline::composer::Composer;
use crate::pipeline::fetch::{PdfSourceFetcher, SourceFetcher};
use crate::pipeline::narrator::Narrator;
use crate::pipeline::planner::{LlmPlanner, ScriptPlanner};
use crate::pipeline::renderer::{ClipRenderer, ManimRenderer};
use crate::pipeline::stitch::Stitcher;
use crate::progress::{ObserverHandle, Stage, TracingObserver};
use crate::store::{InMemoryJobStore, JobRepository, JobUpdate, JsonFileJobStore};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Runs jobs against a set of pipeline components.
///
/// Cheap to clone; clones share components and the job store.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    fetcher: Arc<dyn SourceFetcher>,
    planner: Arc<dyn ScriptPlanner>,
    renderer: Arc<dyn ClipRenderer>,
    narrator: Arc<Narrator>,
    composer: Arc<Composer>,
    stitcher: Arc<Stitcher>,
    closing: Arc<ClosingClipChain>,
    store: Arc<dyn JobRepository>,
    observer: ObserverHandle,
}

/// Builder for [`Orchestrator`]; unset components get their production
/// implementation.
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    media: Option<Arc<dyn MediaEngine>>,
    fetcher: Option<Arc<dyn SourceFetcher>>,
    planner: Option<Arc<dyn ScriptPlanner>>,
    renderer: Option<Arc<dyn ClipRenderer>>,
    narrator: Option<Narrator>,
    closing: Option<ClosingClipChain>,
    store: Option<Arc<dyn JobRepository>>,
}

impl OrchestratorBuilder {
    pub fn media(mut self, media: Arc<dyn MediaEngine>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn ScriptPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn ClipRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn narrator(mut self, narrator: Narrator) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn closing(mut self, closing: ClosingClipChain) -> Self {
        self.closing = Some(closing);
        self
    }

    pub fn store(mut self, store: Arc<dyn JobRepository>) -> Self {
        self.store = Some(store);
        self
    }

    /// Fill in missing components. Resolving the LLM provider can fail.
    pub fn build(self) -> Result<Orchestrator, PipelineError> {
        let config = self.config;
        let media: Arc<dyn MediaEngine> = self
            .media
            .unwrap_or_else(|| Arc::new(FfmpegEngine::from_config(&config)));

        let planner: Arc<dyn ScriptPlanner> = match self.planner {
            Some(p) => p,
            None => Arc::new(LlmPlanner::from_config(&config)?),
        };
        let renderer: Arc<dyn ClipRenderer> = self
            .renderer
            .unwrap_or_else(|| Arc::new(ManimRenderer::new(&config, Arc::clone(&media))));
        let fetcher: Arc<dyn SourceFetcher> = self
            .fetcher
            .unwrap_or_else(|| Arc::new(PdfSourceFetcher::from_config(&config)));
        let narrator = self
            .narrator
            .unwrap_or_else(|| Narrator::from_config(&config, Arc::clone(&media)));
        let closing = self
            .closing
            .unwrap_or_else(|| ClosingClipChain::from_config(&config, Arc::clone(&renderer)));
        let store: Arc<dyn JobRepository> = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));
        let observer = config
            .observer
            .clone()
            .unwrap_or_else(|| Arc::new(TracingObserver));

        Ok(Orchestrator {
            composer: Arc::new(Composer::new(Arc::clone(&media), &config)),
            stitcher: Arc::new(Stitcher::new(Arc::clone(&media), config.canonical())),
            config: Arc::new(config),
            fetcher,
            planner,
            renderer,
            narrator: Arc::new(narrator),
            closing: Arc::new(closing),
            store,
            observer,
        })
    }
}

/// A clip that made it through rendering, with its planned narration.
struct Rendered {
    clip: RenderedClip,
    narration: Option<String>,
}

impl Orchestrator {
    pub fn builder(config: PipelineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            media: None,
            fetcher: None,
            planner: None,
            renderer: None,
            narrator: None,
            closing: None,
            store: None,
        }
    }

    /// Production components with the JSON job table at `config.jobs_file`.
    pub async fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let store = JsonFileJobStore::open(config.jobs_file.clone()).await?;
        Self::builder(config).store(Arc::new(store)).build()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobRepository> {
        &self.store
    }

    // ── Job surface ──────────────────────────────────────────────────────

    /// Record a job and start it in the background.
    ///
    /// The worker runs under a supervisor: if it errors or panics before the
    /// job reaches a terminal state, the job is marked failed.
    pub async fn submit(
        &self,
        source: SourceRef,
        prompt: Option<String>,
    ) -> Result<JobId, PipelineError> {
        let job = Job::new(source, prompt);
        let id = job.id;
        self.store.put(job).await?;
        info!("Job {} submitted", id);

        let this = self.clone();
        tokio::spawn(async move {
            let worker = tokio::spawn({
                let this = this.clone();
                async move { this.run_job(id).await }
            });
            let reason = match worker.await {
                Ok(Ok(_)) => return,
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("worker stopped unexpectedly: {e}"),
            };
            error!("Job {}: {}", id, reason);
            this.fail_unfinished(id, &reason).await;
        });
        Ok(id)
    }

    /// Store an uploaded PDF and submit it.
    pub async fn submit_bytes(
        &self,
        bytes: &[u8],
        filename: &str,
        prompt: Option<String>,
    ) -> Result<JobId, PipelineError> {
        let path = self.store_upload(bytes, filename).await?;
        self.submit(SourceRef::File(path), prompt).await
    }

    /// Record a job and run it to completion on the current task.
    pub async fn run(&self, source: SourceRef, prompt: Option<String>) -> Result<Job, PipelineError> {
        let job = Job::new(source, prompt);
        let id = job.id;
        self.store.put(job).await?;
        match self.run_job(id).await {
            Ok(job) => Ok(job),
            Err(e) => {
                self.fail_unfinished(id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Poll the store until job `id` is terminal.
    pub async fn wait(&self, id: JobId, poll: Duration) -> Result<Job, PipelineError> {
        loop {
            let job = self.get_job(id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job, PipelineError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound { id: id.to_string() })
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError> {
        self.store.list().await
    }

    /// Set the job's display name.
    pub async fn rename_job(&self, id: JobId, name: &str) -> Result<Job, PipelineError> {
        rename_job(self.store.as_ref(), id, name).await
    }

    /// Remove the job record, its video and its stored upload.
    pub async fn delete_job(&self, id: JobId) -> Result<Job, PipelineError> {
        delete_job(self.store.as_ref(), &self.config.upload_dir, id).await
    }

    async fn store_upload(&self, bytes: &[u8], filename: &str) -> Result<PathBuf, PipelineError> {
        let dir = &self.config.upload_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PipelineError::OutputWriteFailed {
                path: dir.clone(),
                source: e,
            })?;
        let path = dir.join(upload_file_name(filename));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::OutputWriteFailed {
                path: path.clone(),
                source: e,
            })?;
        debug!("Stored upload ({} bytes) at {}", bytes.len(), path.display());
        Ok(path)
    }

    // ── Worker ───────────────────────────────────────────────────────────

    async fn run_job(&self, id: JobId) -> Result<Job, PipelineError> {
        let job = self.store.update(id, Box::new(|j| j.start())).await?;
        self.observer.on_job_started(id, &job.source);

        let work_dir = self.config.work_dir.join(id.to_string());
        let result = self
            .run_pipeline(id, &job.source, job.prompt.as_deref(), &work_dir)
            .await;

        let outcome = match result {
            Ok(output) => {
                info!("Job {} completed: {}", id, output.video_path.display());
                Ok(output)
            }
            Err(e) => {
                warn!("Job {} failed: {}", id, e);
                Err(e.to_string())
            }
        };
        let recorded = self.record_outcome(id, &outcome).await;

        if !self.config.keep_work_dir {
            if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
                debug!("Could not remove {}: {}", work_dir.display(), e);
            }
        }

        let finished = recorded?;
        self.observer
            .on_job_finished(id, finished.status, finished.metrics.as_ref());
        Ok(finished)
    }

    /// Write the terminal state, retrying once.
    async fn record_outcome(
        &self,
        id: JobId,
        outcome: &Result<PipelineOutput, String>,
    ) -> Result<Job, PipelineError> {
        match self.store.update(id, terminal_update(outcome)).await {
            Ok(job) => Ok(job),
            Err(e) => {
                warn!("Job {}: recording the outcome failed ({}), retrying", id, e);
                self.store.update(id, terminal_update(outcome)).await
            }
        }
    }

    /// Mark a job failed unless it already reached a terminal state.
    async fn fail_unfinished(&self, id: JobId, reason: &str) {
        let msg = reason.to_string();
        let update: JobUpdate = Box::new(move |j| {
            if !j.status.is_terminal() {
                j.fail(&msg);
            }
        });
        if let Err(e) = self.store.update(id, update).await {
            error!("Job {}: could not record the failure: {}", id, e);
        }
    }

    async fn run_pipeline(
        &self,
        id: JobId,
        source: &SourceRef,
        prompt: Option<&str>,
        work_dir: &Path,
    ) -> Result<PipelineOutput, PipelineError> {
        let start = Instant::now();
        let config = &self.config;
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| PipelineError::OutputWriteFailed {
                path: work_dir.to_path_buf(),
                source: e,
            })?;

        // ── Step 1: Fetch ────────────────────────────────────────────────
        let doc = self.fetcher.fetch(source, work_dir).await?;

        // ── Step 2: Plan ─────────────────────────────────────────────────
        let plan = self.planner.plan(&doc, prompt).await?;
        let clips: Vec<ClipPlan> = plan.clips.into_iter().take(config.max_clips).collect();
        self.observer.on_plan_ready(id, plan.planned, clips.len());
        let total = clips.len();
        let mut errors: Vec<ClipError> = Vec::new();

        // ── Step 3: Render (sequential) ──────────────────────────────────
        let mut rendered: Vec<Rendered> = Vec::with_capacity(total);
        for (i, plan) in clips.iter().enumerate() {
            self.observer.on_clip_started(id, i, total, Stage::Render);
            let media_dir = clip_dir(work_dir, i).join("render");
            match self.renderer.render(i, &plan.code, &media_dir).await {
                Ok(clip) => {
                    self.observer.on_clip_succeeded(id, i, Stage::Render);
                    rendered.push(Rendered {
                        clip,
                        narration: plan.narration().map(str::to_string),
                    });
                }
                Err(e) => {
                    warn!("{}", e);
                    self.observer
                        .on_clip_failed(id, i, Stage::Render, &e.to_string());
                    errors.push(e);
                }
            }
        }

        if rendered.is_empty() {
            return Err(PipelineError::NoRenderedClips {
                total,
                first_error: errors
                    .first()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no clips planned".to_string()),
            });
        }

        // ── Step 4: Narrate (bounded concurrency, order kept) ───────────
        let requests: Vec<(usize, Option<String>)> = rendered
            .iter()
            .map(|r| (r.clip.index, r.narration.clone()))
            .collect();
        let narrations: Vec<Result<Option<NarrationClip>, ClipError>> = stream::iter(requests)
            .map(move |(i, text)| self.narrate(id, total, i, text, clip_dir(work_dir, i)))
            .buffered(config.narration_concurrency.max(1))
            .collect()
            .await;

        // ── Step 5: Compose ──────────────────────────────────────────────
        let mut composed: Vec<ComposedClip> = Vec::with_capacity(rendered.len());
        let mut degraded = 0usize;
        for (r, narration) in rendered.iter().zip(narrations) {
            let i = r.clip.index;
            let narration = narration.unwrap_or_else(|e| {
                errors.push(e);
                None
            });

            self.observer.on_clip_started(id, i, total, Stage::Compose);
            let target = clip_dir(work_dir, i).join("composed.mp4");
            let clip = self.composer.compose(&r.clip, narration.as_ref(), &target).await;

            match clip.degraded {
                Some(ref reason) => {
                    degraded += 1;
                    self.observer.on_clip_degraded(id, i, Stage::Compose, reason);
                    errors.push(ClipError::ComposeDegraded {
                        clip: i,
                        detail: reason.clone(),
                    });
                }
                None => {
                    self.observer.on_clip_succeeded(id, i, Stage::Compose);
                    if clip.path != r.clip.path {
                        remove_quietly(&r.clip.path).await;
                    }
                }
            }
            if let Some(n) = narration {
                remove_quietly(&n.path).await;
            }
            composed.push(clip);
        }
        let narrated = composed.iter().filter(|c| c.has_audio).count();

        // ── Step 6: Closing clip ─────────────────────────────────────────
        let closing: Option<ClosingClip> = if config.closing_clip {
            match self.closing.produce(&work_dir.join("closing")).await {
                Ok(c) => Some(c),
                Err(e) => {
                    errors.push(e);
                    None
                }
            }
        } else {
            None
        };
        self.observer
            .on_closing_clip(id, closing.as_ref().map(|c| c.source.as_str()));

        // ── Step 7: Normalize + stitch ───────────────────────────────────
        let output = config.output_dir.join(format!("video_{id}.mp4"));
        let outcome = self
            .stitcher
            .stitch(&composed, closing.as_ref(), &work_dir.join("normalized"), &output)
            .await?;
        for e in outcome.clip_errors {
            if let Some(i) = e.clip() {
                self.observer
                    .on_clip_degraded(id, i, Stage::Normalize, &e.to_string());
            }
            errors.push(e);
        }

        // ── Step 8: Metrics ──────────────────────────────────────────────
        let mut metrics = JobMetrics::tally(total, rendered.len(), narrated, degraded);
        metrics.closing_clip = closing.map(|c| c.source);
        metrics.clip_errors = errors;
        metrics.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Job {}: {}/{} clips, narration {:.0}%, {} segments, {:.1}s",
            id,
            metrics.successful_clips,
            metrics.total_clips,
            metrics.narration_coverage * 100.0,
            outcome.segments,
            outcome.duration_secs
        );

        Ok(PipelineOutput {
            video_path: outcome.path,
            metrics,
        })
    }

    async fn narrate(
        &self,
        id: JobId,
        total: usize,
        i: usize,
        text: Option<String>,
        dir: PathBuf,
    ) -> Result<Option<NarrationClip>, ClipError> {
        let Some(text) = text else {
            debug!("Clip {}: no narration planned", i);
            return Ok(None);
        };

        self.observer.on_clip_started(id, i, total, Stage::Narrate);
        match self.narrator.narrate(i, &text, &dir).await {
            Ok(n) => {
                self.observer.on_clip_succeeded(id, i, Stage::Narrate);
                Ok(Some(n))
            }
            Err(e) => {
                self.observer
                    .on_clip_failed(id, i, Stage::Narrate, &e.to_string());
                Err(e)
            }
        }
    }
}

fn clip_dir(work_dir: &Path, index: usize) -> PathBuf {
    work_dir.join(format!("clip_{index}"))
}

fn terminal_update(outcome: &Result<PipelineOutput, String>) -> JobUpdate {
    match outcome.clone() {
        Ok(output) => Box::new(move |j| j.complete(output.video_path, output.metrics)),
        Err(msg) => Box::new(move |j| j.fail(&msg)),
    }
}

/// `<uuid>_<safe name>.pdf`.
fn upload_file_name(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let safe: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    let safe = safe.trim_start_matches('.');
    let safe = if safe.is_empty() { "paper.pdf" } else { safe };
    let suffix = if safe.to_ascii_lowercase().ends_with(".pdf") {
        ""
    } else {
        ".pdf"
    };
    format!("{}_{safe}{suffix}", Uuid::new_v4().simple())
}

/// Set a job's display name.
pub async fn rename_job(
    store: &dyn JobRepository,
    id: JobId,
    name: &str,
) -> Result<Job, PipelineError> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(PipelineError::InvalidInput { input: name });
    }
    store
        .update(id, Box::new(move |j| j.video_name = Some(name)))
        .await
}

/// Remove a job record, its output video and, when it lives under
/// `upload_dir`, its uploaded source. Running jobs cannot be deleted.
pub async fn delete_job(
    store: &dyn JobRepository,
    upload_dir: &Path,
    id: JobId,
) -> Result<Job, PipelineError> {
    let job = store
        .get(id)
        .await?
        .ok_or_else(|| PipelineError::JobNotFound { id: id.to_string() })?;
    if job.status == JobStatus::Processing {
        return Err(PipelineError::InvalidInput {
            input: format!("job {id} is still processing"),
        });
    }

    if let Some(ref video) = job.video_path {
        remove_quietly(video).await;
    }
    if let SourceRef::File(ref path) = job.source {
        if path.starts_with(upload_dir) {
            remove_quietly(path).await;
        }
    }
    store.delete(id).await?;
    info!("Job {} deleted", id);
    Ok(job)
}
