//! Job persistence.
//!
//! [`JobRepository`] is the only way the orchestrator and the CLI touch job
//! records. Every write replaces a whole record, and [`JobRepository::update`]
//! performs its read-modify-write under the store's lock, so two tasks
//! updating the same job never interleave.
//!
//! [`JsonFileJobStore`] re-reads the file on every call and rewrites it
//! whole on each change (temp file + rename) while holding a lock file, so
//! several handles on one table (a running `generate` and a `jobs rename`,
//! say) see each other's records and a crash never leaves a half-written
//! table behind.

use crate::error::PipelineError;
use crate::job::{Job, JobId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Mutation applied by [`JobRepository::update`].
pub type JobUpdate = Box<dyn FnOnce(&mut Job) + Send>;

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get(&self, id: JobId) -> Result<Option<Job>, PipelineError>;

    /// Insert or fully replace a record.
    async fn put(&self, job: Job) -> Result<(), PipelineError>;

    /// All jobs, newest first.
    async fn list(&self) -> Result<Vec<Job>, PipelineError>;

    /// Remove a record, returning it if it existed.
    async fn delete(&self, id: JobId) -> Result<Option<Job>, PipelineError>;

    /// Atomically apply `f` to a record and return the updated copy.
    async fn update(&self, id: JobId, f: JobUpdate) -> Result<Job, PipelineError>;
}

fn newest_first(jobs: impl Iterator<Item = Job>) -> Vec<Job> {
    let mut jobs: Vec<Job> = jobs.collect();
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    jobs
}

// ── In memory ─────────────────────────────────────────────────────────────

/// Non-persistent store, for tests and one-shot CLI runs.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<BTreeMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobStore {
    async fn get(&self, id: JobId) -> Result<Option<Job>, PipelineError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn put(&self, job: Job) -> Result<(), PipelineError> {
        self.jobs.lock().await.insert(job.id, job);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>, PipelineError> {
        Ok(newest_first(self.jobs.lock().await.values().cloned()))
    }

    async fn delete(&self, id: JobId) -> Result<Option<Job>, PipelineError> {
        Ok(self.jobs.lock().await.remove(&id))
    }

    async fn update(&self, id: JobId, f: JobUpdate) -> Result<Job, PipelineError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| PipelineError::JobNotFound { id: id.to_string() })?;
        f(job);
        Ok(job.clone())
    }
}

// ── JSON file ─────────────────────────────────────────────────────────────

/// A lock file older than this is left over from a crashed writer.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_RETRY: Duration = Duration::from_millis(20);

/// Exclusive hold on `<table>.lock`, released on drop.
struct TableLock {
    path: PathBuf,
}

impl TableLock {
    async fn acquire(path: PathBuf) -> std::io::Result<Self> {
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await {
                        warn!("Breaking stale lock {}", path.display());
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn lock_is_stale(path: &Path) -> bool {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => SystemTime::now()
            .duration_since(modified)
            .is_ok_and(|age| age > LOCK_STALE_AFTER),
        Err(_) => false,
    }
}

/// Store backed by one JSON object keyed by job id.
///
/// The file is the only copy of the table: every call reads it, and every
/// change is applied to a fresh read while holding `<file>.lock`. Handles
/// in other tasks or processes therefore never overwrite each other.
pub struct JsonFileJobStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl JsonFileJobStore {
    /// Open `path`, checking that existing records load. A missing file is
    /// an empty table.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let store = Self {
            path: path.into(),
            writer: Mutex::new(()),
        };
        let jobs = store.load().await?;
        debug!("Loaded {} jobs from {}", jobs.len(), store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_err(&self, detail: String) -> PipelineError {
        PipelineError::Store {
            path: self.path.clone(),
            detail,
        }
    }

    async fn load(&self) -> Result<BTreeMap<JobId, Job>, PipelineError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| self.store_err(format!("corrupt job table: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(self.store_err(e.to_string())),
        }
    }

    /// Write the whole table next to the target, then rename over it.
    async fn persist(&self, jobs: &BTreeMap<JobId, Job>) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(jobs).map_err(|e| self.store_err(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| self.store_err(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.store_err(format!("rename {}: {e}", tmp.display())))
    }

    /// Apply `f` to the current on-disk table under the lock and save it.
    async fn modify<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&mut BTreeMap<JobId, Job>) -> Result<T, PipelineError> + Send,
    {
        let _local = self.writer.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.store_err(e.to_string()))?;
        }
        let lock_path = self.path.with_extension("json.lock");
        let _lock = TableLock::acquire(lock_path.clone())
            .await
            .map_err(|e| self.store_err(format!("lock {}: {e}", lock_path.display())))?;

        let mut jobs = self.load().await?;
        let out = f(&mut jobs)?;
        self.persist(&jobs).await?;
        Ok(out)
    }
}

#[async_trait]
impl JobRepository for JsonFileJobStore {
    async fn get(&self, id: JobId) -> Result<Option<Job>, PipelineError> {
        Ok(self.load().await?.remove(&id))
    }

    async fn put(&self, job: Job) -> Result<(), PipelineError> {
        self.modify(move |jobs| {
            jobs.insert(job.id, job);
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Job>, PipelineError> {
        Ok(newest_first(self.load().await?.into_values()))
    }

    async fn delete(&self, id: JobId) -> Result<Option<Job>, PipelineError> {
        self.modify(move |jobs| Ok(jobs.remove(&id))).await
    }

    async fn update(&self, id: JobId, f: JobUpdate) -> Result<Job, PipelineError> {
        self.modify(move |jobs| {
            let job = jobs
                .get_mut(&id)
                .ok_or_else(|| PipelineError::JobNotFound { id: id.to_string() })?;
            f(job);
            Ok(job.clone())
        })
        .await
    }
}
