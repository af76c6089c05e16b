//! Observer trait for pipeline state transitions.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] via
//! [`crate::config::PipelineConfigBuilder::observer`] to receive one call per
//! job or clip state change. The pipeline itself never formats or prints;
//! observers decide whether a transition becomes a log line, a progress-bar
//! tick, or a row in a database.
//!
//! When no observer is configured the pipeline uses [`TracingObserver`],
//! which emits structured `tracing` events.
//!
//! # Example
//!
//! ```rust
//! use paper2video::{PipelineObserver, PipelineConfig, Stage, JobId};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct FailureCounter(AtomicUsize);
//!
//! impl PipelineObserver for FailureCounter {
//!     fn on_clip_failed(&self, _job: JobId, _clip: usize, _stage: Stage, _reason: &str) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .observer(Arc::new(FailureCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::job::{JobId, JobMetrics, JobStatus, SourceRef};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-clip pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Render,
    Narrate,
    Compose,
    Normalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Render => "render",
            Stage::Narrate => "narrate",
            Stage::Compose => "compose",
            Stage::Normalize => "normalize",
        };
        f.write_str(s)
    }
}

/// Receives pipeline state transitions.
///
/// Implementations must be `Send + Sync`: several jobs run concurrently and
/// narration for one job may run on several tasks. All methods have default
/// no-op implementations so callers only override what they care about.
///
/// Clip indices are 0-based positions in the (truncated) plan.
pub trait PipelineObserver: Send + Sync {
    /// The job left `pending`.
    fn on_job_started(&self, job: JobId, source: &SourceRef) {
        let _ = (job, source);
    }

    /// The planner answered. `planned` is what the model returned, `kept`
    /// what survives truncation and filtering.
    fn on_plan_ready(&self, job: JobId, planned: usize, kept: usize) {
        let _ = (job, planned, kept);
    }

    fn on_clip_started(&self, job: JobId, clip: usize, total: usize, stage: Stage) {
        let _ = (job, clip, total, stage);
    }

    fn on_clip_succeeded(&self, job: JobId, clip: usize, stage: Stage) {
        let _ = (job, clip, stage);
    }

    /// The stage fell back to a weaker artifact (silent, unnormalized).
    fn on_clip_degraded(&self, job: JobId, clip: usize, stage: Stage, reason: &str) {
        let _ = (job, clip, stage, reason);
    }

    /// The stage produced nothing for this clip.
    fn on_clip_failed(&self, job: JobId, clip: usize, stage: Stage, reason: &str) {
        let _ = (job, clip, stage, reason);
    }

    /// `source` names the closing clip provider, `None` when omitted.
    fn on_closing_clip(&self, job: JobId, source: Option<&str>) {
        let _ = (job, source);
    }

    /// The job reached a terminal state.
    fn on_job_finished(&self, job: JobId, status: JobStatus, metrics: Option<&JobMetrics>) {
        let _ = (job, status, metrics);
    }
}

/// Discards every event.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Emits each transition as a structured `tracing` event.
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_job_started(&self, job: JobId, source: &SourceRef) {
        info!(job_id = %job, source = %source, "job started");
    }

    fn on_plan_ready(&self, job: JobId, planned: usize, kept: usize) {
        info!(job_id = %job, planned, kept, "plan ready");
    }

    fn on_clip_started(&self, job: JobId, clip: usize, total: usize, stage: Stage) {
        info!(job_id = %job, clip, total, stage = %stage, "clip started");
    }

    fn on_clip_succeeded(&self, job: JobId, clip: usize, stage: Stage) {
        info!(job_id = %job, clip, stage = %stage, "clip succeeded");
    }

    fn on_clip_degraded(&self, job: JobId, clip: usize, stage: Stage, reason: &str) {
        warn!(job_id = %job, clip, stage = %stage, reason, "clip degraded");
    }

    fn on_clip_failed(&self, job: JobId, clip: usize, stage: Stage, reason: &str) {
        warn!(job_id = %job, clip, stage = %stage, reason, "clip failed");
    }

    fn on_closing_clip(&self, job: JobId, source: Option<&str>) {
        match source {
            Some(source) => info!(job_id = %job, source, "closing clip attached"),
            None => warn!(job_id = %job, "closing clip omitted"),
        }
    }

    fn on_job_finished(&self, job: JobId, status: JobStatus, metrics: Option<&JobMetrics>) {
        match metrics {
            Some(m) => info!(
                job_id = %job,
                status = %status,
                successful = m.successful_clips,
                failed = m.failed_clips,
                narration_coverage = m.narration_coverage,
                "job finished"
            ),
            None => info!(job_id = %job, status = %status, "job finished"),
        }
    }
}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ObserverHandle = Arc<dyn PipelineObserver>;
