//! Batch lifecycle: dispatch, monitoring and the control surface.

use super::runner::{JobRunner, PipelinePlan};
use super::{
    BatchObserver, BatchRequest, BatchSnapshot, BatchStarted, BatchStatus, CancelSignal, Job,
    JobStage, NoopObserver, ProgressEvent, MAX_CONCURRENCY, MIN_CONCURRENCY,
};
use crate::cache::{CacheConfig, CacheStore};
use crate::config::Settings;
use crate::error::{Result, SamleError};
use crate::pipeline::Collaborators;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Tunables that apply to every batch an orchestrator runs.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Worker count when a request does not specify one.
    pub concurrency: usize,
    /// Sample rate handed to the transform stage.
    pub sample_rate: u32,
    /// Upper bound for any single stage. None waits forever.
    pub stage_timeout: Option<Duration>,
    /// Export formats used when a request has an output dir but no formats.
    pub default_formats: Vec<String>,
    /// Parent of each job's scratch directory.
    pub scratch_root: PathBuf,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            sample_rate: 16_000,
            stage_timeout: None,
            default_formats: vec!["srt".to_string()],
            scratch_root: std::env::temp_dir().join("samle"),
        }
    }
}

impl From<&Settings> for OrchestratorOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            concurrency: settings.batch.concurrency,
            sample_rate: settings.batch.sample_rate,
            stage_timeout: settings.batch.stage_timeout_seconds.map(Duration::from_secs),
            default_formats: settings.batch.formats.clone(),
            scratch_root: settings.temp_dir(),
        }
    }
}

struct BatchState {
    status: BatchStatus,
    jobs: BTreeMap<String, Job>,
    completion_reported: bool,
}

/// One batch's shared state. Every mutation happens under `state`, and every
/// observable change is reported before the lock is released.
pub(crate) struct Batch {
    id: Uuid,
    state: Mutex<BatchState>,
    cancel: CancelSignal,
    observer: Arc<dyn BatchObserver>,
}

impl Batch {
    fn new(identifiers: &[String], observer: Arc<dyn BatchObserver>) -> Self {
        let jobs = identifiers
            .iter()
            .map(|id| (id.clone(), Job::new(id.clone())))
            .collect();

        Self {
            id: Uuid::new_v4(),
            state: Mutex::new(BatchState {
                status: BatchStatus::Running,
                jobs,
                completion_reported: false,
            }),
            cancel: CancelSignal::new(),
            observer,
        }
    }

    // A panicking observer must not wedge the rest of the batch.
    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report(&self, state: &BatchState, job: Option<&Job>) {
        let event = ProgressEvent {
            job: job.cloned(),
            batch: BatchSnapshot::capture(self.id, state.status, &state.jobs),
        };
        self.observer.on_progress(&event);
    }

    pub(crate) fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Apply `change` to one job. When it returns true the change is reported.
    pub(crate) fn update_job<F>(&self, identifier: &str, change: F) -> bool
    where
        F: FnOnce(&mut Job) -> bool,
    {
        let mut state = self.state();
        let changed = match state.jobs.get_mut(identifier) {
            Some(job) => change(job),
            None => false,
        };
        if changed {
            if let Some(job) = state.jobs.get(identifier) {
                self.report(&state, Some(job));
            }
        }
        changed
    }

    /// Stage-entry checkpoint. The cancel flag is read under the same lock
    /// `cancel()` takes, so no stage starts once cancellation is recorded.
    pub(crate) fn enter_stage(&self, identifier: &str, stage: JobStage) -> Result<()> {
        let cancel = self.cancel.clone();
        let mut outcome = Err(SamleError::Cancelled);
        self.update_job(identifier, |job| {
            if cancel.is_cancelled() {
                return false;
            }
            outcome = Ok(());
            job.enter(stage)
        });
        outcome
    }

    fn snapshot(&self) -> BatchSnapshot {
        let state = self.state();
        BatchSnapshot::capture(self.id, state.status, &state.jobs)
    }

    fn cancel(&self) -> bool {
        let mut state = self.state();
        if state.status != BatchStatus::Running {
            return false;
        }
        self.cancel.cancel();
        state.status = BatchStatus::Cancelled;
        self.report(&state, None);
        true
    }

    fn set_paused(&self, paused: bool) -> bool {
        let mut state = self.state();
        let (from, to) = if paused {
            (BatchStatus::Running, BatchStatus::Paused)
        } else {
            (BatchStatus::Paused, BatchStatus::Running)
        };
        if state.status != from {
            return false;
        }
        state.status = to;
        self.report(&state, None);
        true
    }

    /// Mark jobs that never settled (their task panicked or was aborted).
    fn fail_unsettled(&self, reason: &str) {
        let mut state = self.state();
        let now = Utc::now();
        let mut touched = Vec::new();
        for (id, job) in state.jobs.iter_mut() {
            if job.fail(reason, now) {
                touched.push(id.clone());
            }
        }
        for id in touched {
            if let Some(job) = state.jobs.get(&id) {
                self.report(&state, Some(job));
            }
        }
    }

    /// Derive the terminal status and fire the completion event once.
    fn finish(&self) -> BatchSnapshot {
        let mut state = self.state();
        if !state.completion_reported {
            let any_failed = state.jobs.values().any(|j| j.stage == JobStage::Failed);
            state.status = if self.cancel.is_cancelled() {
                BatchStatus::Cancelled
            } else if any_failed {
                BatchStatus::Failed
            } else {
                BatchStatus::Completed
            };
            state.completion_reported = true;

            self.report(&state, None);
            let summary = BatchSnapshot::capture(self.id, state.status, &state.jobs);
            self.observer.on_complete(&summary);
            return summary;
        }
        BatchSnapshot::capture(self.id, state.status, &state.jobs)
    }
}

/// Runs batches of identifiers through the pipeline.
///
/// Each call to [`process_batch`](Self::process_batch) creates a fresh batch
/// with its own worker pool and cancel switch; the previous batch is dropped
/// from the control surface.
pub struct BatchOrchestrator {
    collaborators: Collaborators,
    cache: Option<Arc<CacheStore>>,
    options: OrchestratorOptions,
    observer: Arc<dyn BatchObserver>,
    current: Mutex<Option<Arc<Batch>>>,
    monitor: Mutex<Option<JoinHandle<BatchSnapshot>>>,
}

impl BatchOrchestrator {
    pub fn new(collaborators: Collaborators, options: OrchestratorOptions) -> Self {
        Self {
            collaborators,
            cache: None,
            options,
            observer: Arc::new(NoopObserver),
            current: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Wire up the real collaborators and, if enabled, the on-disk cache.
    ///
    /// A cache that fails to open is logged and skipped: batches still run,
    /// just without result reuse.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        std::fs::create_dir_all(settings.temp_dir())?;

        let orchestrator = Self::new(
            Collaborators::from_settings(settings),
            OrchestratorOptions::from(settings),
        );

        if !settings.cache.enabled {
            return Ok(orchestrator);
        }

        match CacheStore::open(&settings.cache_dir(), CacheConfig::from(&settings.cache)) {
            Ok(cache) => Ok(orchestrator.with_cache(Arc::new(cache))),
            Err(e) => {
                warn!("Cache unavailable, continuing without it: {}", e);
                Ok(orchestrator)
            }
        }
    }

    pub fn cache(&self) -> Option<&Arc<CacheStore>> {
        self.cache.as_ref()
    }

    fn current(&self) -> Option<Arc<Batch>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Validate, create one job per identifier and start the batch.
    ///
    /// Returns as soon as the jobs are dispatched. Invalid identifiers are
    /// dropped; if none remain nothing is started. Must be called from
    /// within a Tokio runtime.
    #[instrument(skip(self, request), fields(requested = request.identifiers.len()))]
    pub fn process_batch(&self, request: BatchRequest) -> Result<BatchStarted> {
        let mut identifiers: Vec<String> = Vec::new();
        for raw in &request.identifiers {
            let id = raw.trim();
            if !self.collaborators.validator.validate(id) {
                debug!("Dropping invalid identifier: {}", id);
                continue;
            }
            if !identifiers.iter().any(|existing| existing == id) {
                identifiers.push(id.to_string());
            }
        }

        if identifiers.is_empty() {
            return Err(SamleError::Validation("No valid identifiers provided".to_string()));
        }

        let concurrency = request
            .concurrency
            .unwrap_or(self.options.concurrency)
            .clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);

        let export = request.output_dir.clone().map(|dir| {
            let formats = if request.formats.is_empty() {
                self.options.default_formats.clone()
            } else {
                request.formats.clone()
            };
            (dir, formats)
        });

        let plan = Arc::new(PipelinePlan {
            model: request.model.clone(),
            target_language: request.target_language.clone().filter(|l| !l.trim().is_empty()),
            export: export.filter(|(_, formats)| !formats.is_empty()),
            sample_rate: self.options.sample_rate,
            stage_timeout: self.options.stage_timeout,
        });

        let batch = Arc::new(Batch::new(&identifiers, self.observer.clone()));

        if let Some(previous) = self.current() {
            if !previous.snapshot().status.is_terminal() {
                warn!("Starting a new batch while batch {} is still running", previous.id);
            }
        }
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(batch.clone());

        info!(
            "Starting batch {} with {} jobs, concurrency {}",
            batch.id,
            identifiers.len(),
            concurrency
        );
        {
            let state = batch.state();
            batch.report(&state, None);
        }

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::with_capacity(identifiers.len());

        for identifier in &identifiers {
            let runner = JobRunner {
                batch: batch.clone(),
                identifier: identifier.clone(),
                plan: plan.clone(),
                collaborators: self.collaborators.clone(),
                cache: self.cache.clone(),
                scratch_root: self.options.scratch_root.clone(),
            };
            let semaphore = semaphore.clone();

            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                runner.run().await;
            });
            handles.push((identifier.clone(), handle));
        }

        let monitored = batch.clone();
        let monitor = tokio::spawn(async move {
            for (identifier, handle) in handles {
                if let Err(e) = handle.await {
                    error!("Job task for {} ended abnormally: {}", identifier, e);
                    monitored.update_job(&identifier, |job| {
                        job.fail(format!("Job aborted: {}", e), Utc::now())
                    });
                }
            }
            monitored.fail_unsettled("Job did not run to completion");

            let summary = monitored.finish();
            info!(
                "Batch {} {}: {} completed, {} failed, {} cancelled",
                summary.batch_id.unwrap_or_default(),
                summary.status,
                summary.completed,
                summary.failed,
                summary.cancelled
            );
            summary
        });
        *self.monitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(monitor);

        Ok(BatchStarted {
            batch_id: batch.id,
            total: identifiers.len(),
            jobs: identifiers,
        })
    }

    /// Request cooperative cancellation. Only a running batch can be cancelled.
    pub fn cancel(&self) -> bool {
        let cancelled = self.current().is_some_and(|b| b.cancel());
        if cancelled {
            info!("Batch cancellation requested");
        }
        cancelled
    }

    /// Flip the batch status to Paused. Jobs keep running.
    pub fn pause(&self) -> bool {
        self.current().is_some_and(|b| b.set_paused(true))
    }

    /// Flip a paused batch back to Running.
    pub fn resume(&self) -> bool {
        self.current().is_some_and(|b| b.set_paused(false))
    }

    /// Snapshot of the current batch, or an idle snapshot if none was started.
    pub fn get_status(&self) -> BatchSnapshot {
        self.current()
            .map(|b| b.snapshot())
            .unwrap_or_else(BatchSnapshot::idle)
    }

    /// Wait for the current batch to finish and return its final summary.
    ///
    /// Returns None if no batch was ever started.
    pub async fn wait(&self) -> Option<BatchSnapshot> {
        let monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        match monitor {
            Some(handle) => match handle.await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    error!("Batch monitor failed: {}", e);
                    self.current().map(|b| b.snapshot())
                }
            },
            None => self.current().map(|b| b.snapshot()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{
        AnalysisResult, Analyzer, Exporter, Fetcher, IdentifierValidator, StageContext,
        Transformer, Translator, UrlValidator,
    };
    use async_trait::async_trait;
    use std::path::Path;

    struct Instant;

    #[async_trait]
    impl Fetcher for Instant {
        async fn fetch(&self, _identifier: &str, ctx: &StageContext) -> Result<PathBuf> {
            ctx.report(1.0);
            Ok(ctx.scratch_dir().join("media.webm"))
        }
    }

    #[async_trait]
    impl Transformer for Instant {
        async fn transform(&self, input: &Path, _rate: u32, _ctx: &StageContext) -> Result<PathBuf> {
            Ok(input.with_extension("wav"))
        }
    }

    #[async_trait]
    impl Analyzer for Instant {
        async fn analyze(&self, _input: &Path, model: &str) -> Result<AnalysisResult> {
            Ok(AnalysisResult::new(format!("transcribed with {}", model), Vec::new()))
        }
    }

    #[async_trait]
    impl Translator for Instant {
        async fn translate(&self, text: &str, target_language: &str) -> Result<String> {
            Ok(format!("[{}] {}", target_language, text))
        }
    }

    #[async_trait]
    impl Exporter for Instant {
        async fn export(
            &self,
            _identifier: &str,
            _result: &AnalysisResult,
            destination: &Path,
            formats: &[String],
        ) -> Result<BTreeMap<String, PathBuf>> {
            Ok(formats
                .iter()
                .map(|f| (f.clone(), destination.join(format!("out.{}", f))))
                .collect())
        }
    }

    fn orchestrator(scratch: &Path) -> BatchOrchestrator {
        let instant = Arc::new(Instant);
        let validator: Arc<dyn IdentifierValidator> = Arc::new(UrlValidator::default());
        let collaborators = Collaborators {
            fetcher: instant.clone(),
            transformer: instant.clone(),
            analyzer: instant.clone(),
            translator: instant.clone(),
            exporter: instant,
            validator,
        };
        let options = OrchestratorOptions {
            scratch_root: scratch.to_path_buf(),
            ..Default::default()
        };
        BatchOrchestrator::new(collaborators, options)
    }

    #[tokio::test]
    async fn test_idle_control_surface() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        assert_eq!(orchestrator.get_status().status, BatchStatus::Idle);
        assert!(!orchestrator.cancel());
        assert!(!orchestrator.pause());
        assert!(!orchestrator.resume());
        assert!(orchestrator.wait().await.is_none());
    }

    #[tokio::test]
    async fn test_rejects_all_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        let err = orchestrator
            .process_batch(BatchRequest::new(vec!["nope".into(), "ftp://x".into()], "whisper-1"))
            .unwrap_err();
        assert!(matches!(err, SamleError::Validation(_)));
        assert_eq!(orchestrator.get_status().status, BatchStatus::Idle);
    }

    #[tokio::test]
    async fn test_duplicates_collapse_to_one_job() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());
        let url = "https://youtu.be/abc".to_string();

        let started = orchestrator
            .process_batch(BatchRequest::new(vec![url.clone(), url], "whisper-1"))
            .unwrap();
        assert_eq!(started.total, 1);

        let summary = orchestrator.wait().await.unwrap();
        assert_eq!(summary.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_translation_and_export_run_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        orchestrator
            .process_batch(
                BatchRequest::new(vec!["https://youtu.be/abc".into()], "whisper-1")
                    .with_translation("de")
                    .with_export(dir.path().join("out"), Vec::new()),
            )
            .unwrap();

        let summary = orchestrator.wait().await.unwrap();
        let job = &summary.jobs["https://youtu.be/abc"];
        assert_eq!(job.stage, JobStage::Completed);
        assert_eq!(job.overall_progress, 1.0);

        let result = job.result.as_ref().unwrap();
        assert_eq!(result.translated_text.as_deref(), Some("[de] transcribed with whisper-1"));
        // No formats given: the configured default applies.
        assert!(job.outputs.contains_key("srt"));
    }

    #[tokio::test]
    async fn test_finished_batch_ignores_controls() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path());

        orchestrator
            .process_batch(BatchRequest::new(vec!["https://youtu.be/abc".into()], "whisper-1"))
            .unwrap();
        let summary = orchestrator.wait().await.unwrap();
        assert_eq!(summary.status, BatchStatus::Completed);

        assert!(!orchestrator.pause());
        assert!(!orchestrator.resume());
        assert!(!orchestrator.cancel());
        assert_eq!(orchestrator.get_status().status, BatchStatus::Completed);
    }
}
