//! Batch orchestration: bounded-parallel pipeline runs with progress,
//! caching and cooperative cancellation.
//!
//! A [`BatchOrchestrator`] turns a list of identifiers into one [`Job`] each,
//! runs their pipelines on a per-batch pool of workers and reports every
//! observable change to a [`BatchObserver`].
//!
//! # Example
//!
//! ```no_run
//! use samle::batch::{BatchOrchestrator, BatchRequest};
//! use samle::config::Settings;
//!
//! # async fn run() -> samle::Result<()> {
//! let settings = Settings::load()?;
//! let orchestrator = BatchOrchestrator::from_settings(&settings)?;
//!
//! let started = orchestrator.process_batch(
//!     BatchRequest::new(vec!["https://youtu.be/dQw4w9WgXcQ".to_string()], "whisper-1"),
//! )?;
//! println!("Started {} jobs", started.total);
//!
//! if let Some(summary) = orchestrator.wait().await {
//!     println!("{}: {} completed, {} failed", summary.status, summary.completed, summary.failed);
//! }
//! # Ok(())
//! # }
//! ```

mod cancel;
mod job;
mod orchestrator;
mod runner;

pub use cancel::CancelSignal;
pub use job::{Job, JobStage, StageProgress};
pub use orchestrator::{BatchOrchestrator, OrchestratorOptions};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Smallest and largest number of jobs a batch runs at once.
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;

/// Batch-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Idle,
    Running,
    /// Status flag only. In-flight and queued jobs keep running.
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Cancelled | BatchStatus::Failed)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BatchStatus::Idle => "idle",
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything a caller supplies to start a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub identifiers: Vec<String>,
    pub model: String,
    #[serde(default)]
    pub target_language: Option<String>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Export formats. Empty means the configured defaults when `output_dir` is set.
    #[serde(default)]
    pub formats: Vec<String>,
    /// Worker count, clamped to 1..=10. None uses the configured default.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl BatchRequest {
    pub fn new(identifiers: Vec<String>, model: impl Into<String>) -> Self {
        Self {
            identifiers,
            model: model.into(),
            target_language: None,
            output_dir: None,
            formats: Vec::new(),
            concurrency: None,
        }
    }

    pub fn with_translation(mut self, language: impl Into<String>) -> Self {
        self.target_language = Some(language.into());
        self
    }

    pub fn with_export(mut self, output_dir: impl Into<PathBuf>, formats: Vec<String>) -> Self {
        self.output_dir = Some(output_dir.into());
        self.formats = formats;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

/// Returned by `process_batch` as soon as the jobs are dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStarted {
    pub batch_id: Uuid,
    /// Identifiers that passed validation, one job each.
    pub jobs: Vec<String>,
    pub total: usize,
}

/// Point-in-time copy of a batch. Never aliases live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_id: Option<Uuid>,
    pub status: BatchStatus,
    /// Average of every job's overall progress.
    pub progress: f64,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    pub jobs: BTreeMap<String, Job>,
}

impl BatchSnapshot {
    /// The snapshot reported when no batch has been started.
    pub fn idle() -> Self {
        Self {
            batch_id: None,
            status: BatchStatus::Idle,
            progress: 0.0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            total: 0,
            jobs: BTreeMap::new(),
        }
    }

    pub(crate) fn capture(batch_id: Uuid, status: BatchStatus, jobs: &BTreeMap<String, Job>) -> Self {
        let count = |stage: JobStage| jobs.values().filter(|j| j.stage == stage).count();
        let progress = if jobs.is_empty() {
            0.0
        } else {
            jobs.values().map(|j| j.overall_progress).sum::<f64>() / jobs.len() as f64
        };

        Self {
            batch_id: Some(batch_id),
            status,
            progress,
            completed: count(JobStage::Completed),
            failed: count(JobStage::Failed),
            cancelled: count(JobStage::Cancelled),
            total: jobs.len(),
            jobs: jobs.clone(),
        }
    }
}

/// A progress notification: the job that changed, if any, plus the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job: Option<Job>,
    pub batch: BatchSnapshot,
}

/// Receives batch events.
///
/// Calls are made while the batch's bookkeeping lock is held, so
/// implementations must return quickly and must not call back into the
/// orchestrator.
pub trait BatchObserver: Send + Sync {
    fn on_progress(&self, _event: &ProgressEvent) {}

    /// Fires exactly once per batch, after every job is terminal.
    fn on_complete(&self, _summary: &BatchSnapshot) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl BatchObserver for NoopObserver {}

/// Events forwarded by [`ChannelObserver`].
#[derive(Debug, Clone)]
pub enum BatchEvent {
    Progress(ProgressEvent),
    Completed(BatchSnapshot),
}

/// Forwards events to an unbounded channel so consumers can handle them
/// outside the batch lock.
pub struct ChannelObserver {
    sender: UnboundedSender<BatchEvent>,
}

impl ChannelObserver {
    pub fn new(sender: UnboundedSender<BatchEvent>) -> Self {
        Self { sender }
    }
}

impl BatchObserver for ChannelObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        let _ = self.sender.send(BatchEvent::Progress(event.clone()));
    }

    fn on_complete(&self, summary: &BatchSnapshot) {
        let _ = self.sender.send(BatchEvent::Completed(summary.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_snapshot_counts() {
        let mut jobs = BTreeMap::new();
        let mut done = Job::new("a");
        done.complete(crate::pipeline::AnalysisResult::new("x".into(), Vec::new()), Utc::now());
        let mut failed = Job::new("b");
        failed.fail("boom", Utc::now());
        let pending = Job::new("c");
        jobs.insert("a".to_string(), done);
        jobs.insert("b".to_string(), failed);
        jobs.insert("c".to_string(), pending);

        let snapshot = BatchSnapshot::capture(Uuid::new_v4(), BatchStatus::Running, &jobs);
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert!((snapshot.progress - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_idle_snapshot_is_empty() {
        let snapshot = BatchSnapshot::idle();
        assert_eq!(snapshot.status, BatchStatus::Idle);
        assert!(snapshot.batch_id.is_none());
        assert_eq!(snapshot.total, 0);
    }

    #[test]
    fn test_channel_observer_forwards() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let observer = ChannelObserver::new(tx);
        observer.on_complete(&BatchSnapshot::idle());
        assert!(matches!(rx.try_recv(), Ok(BatchEvent::Completed(_))));
    }
}
