//! Job records: one end-to-end paper-to-video request and its status.

use crate::error::ClipError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque job identifier.
pub type JobId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Set only when the job reaches `completed` or `failed`.
    pub completed_at: Option<DateTime<Utc>>,
    pub source: SourceRef,
    /// Free-text steering prompt passed to the planner.
    pub prompt: Option<String>,
    pub error: Option<String>,
    pub video_path: Option<PathBuf>,
    /// User-chosen display name for the output video.
    pub video_name: Option<String>,
    pub metrics: Option<JobMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where the paper comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum SourceRef {
    Url(String),
    File(PathBuf),
}

impl SourceRef {
    /// Classify a user-supplied string as URL or path.
    pub fn parse(input: &str) -> Self {
        if crate::pipeline::input::is_url(input) {
            SourceRef::Url(input.to_string())
        } else {
            SourceRef::File(PathBuf::from(input))
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Url(u) => f.write_str(u),
            SourceRef::File(p) => write!(f, "{}", p.display()),
        }
    }
}

impl Job {
    pub fn new(source: SourceRef, prompt: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            source,
            prompt,
            error: None,
            video_path: None,
            video_name: None,
            metrics: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Processing;
    }

    pub fn complete(&mut self, video_path: PathBuf, metrics: JobMetrics) {
        self.status = JobStatus::Completed;
        self.video_path = Some(video_path);
        self.metrics = Some(metrics);
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = JobStatus::Failed;
        self.error = Some(error.to_string());
        self.video_path = None;
        self.completed_at = Some(Utc::now());
    }

    /// Display name: the user's rename if any, else `video_<id>`.
    pub fn display_name(&self) -> String {
        self.video_name
            .clone()
            .unwrap_or_else(|| format!("video_{}", self.id))
    }
}

/// Completion metrics: how much of the plan survived.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    /// Clips taken from the plan (after truncation).
    pub total_clips: usize,
    /// Clips that rendered.
    pub successful_clips: usize,
    pub failed_clips: usize,
    /// `successful_clips / total_clips`.
    pub success_rate: f64,
    /// Rendered clips that carry narration in the output.
    pub narrated_clips: usize,
    pub silent_clips: usize,
    /// `narrated_clips / successful_clips`.
    pub narration_coverage: f64,
    pub degraded_compositions: usize,
    /// Which source produced the closing clip, if one was appended.
    pub closing_clip: Option<String>,
    pub clip_errors: Vec<ClipError>,
    pub duration_ms: u64,
}

impl JobMetrics {
    /// Derive the ratios from the raw counts.
    pub fn tally(
        total_clips: usize,
        successful_clips: usize,
        narrated_clips: usize,
        degraded_compositions: usize,
    ) -> Self {
        let ratio = |n: usize, d: usize| if d == 0 { 0.0 } else { n as f64 / d as f64 };
        Self {
            total_clips,
            successful_clips,
            failed_clips: total_clips.saturating_sub(successful_clips),
            success_rate: ratio(successful_clips, total_clips),
            narrated_clips,
            silent_clips: successful_clips.saturating_sub(narrated_clips),
            narration_coverage: ratio(narrated_clips, successful_clips),
            degraded_compositions,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_sets_completed_at_only_on_terminal() {
        let mut job = Job::new(SourceRef::Url("https://arxiv.org/pdf/1".into()), None);
        assert_eq!(job.status, JobStatus::Pending);
        job.start();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.completed_at.is_none());
        job.complete(PathBuf::from("outputs/v.mp4"), JobMetrics::default());
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn fail_clears_video_path() {
        let mut job = Job::new(SourceRef::File("paper.pdf".into()), None);
        job.start();
        job.fail("nothing rendered");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.video_path.is_none());
        assert_eq!(job.error.as_deref(), Some("nothing rendered"));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }

    #[test]
    fn source_ref_parse() {
        assert!(matches!(SourceRef::parse("https://x.org/a.pdf"), SourceRef::Url(_)));
        assert!(matches!(SourceRef::parse("./a.pdf"), SourceRef::File(_)));
    }

    #[test]
    fn tally_ratios() {
        let m = JobMetrics::tally(3, 3, 2, 0);
        assert_eq!(m.success_rate, 1.0);
        assert_eq!(m.silent_clips, 1);
        assert!((m.narration_coverage - 2.0 / 3.0).abs() < 1e-9);

        let empty = JobMetrics::tally(0, 0, 0, 0);
        assert_eq!(empty.success_rate, 0.0);
        assert_eq!(empty.narration_coverage, 0.0);
    }

    #[test]
    fn display_name_defaults_to_id() {
        let mut job = Job::new(SourceRef::File("p.pdf".into()), None);
        assert!(job.display_name().starts_with("video_"));
        job.video_name = Some("Attention explained".into());
        assert_eq!(job.display_name(), "Attention explained");
    }
}
