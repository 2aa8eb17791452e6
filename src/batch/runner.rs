//! One job's walk through the pipeline.

use super::orchestrator::Batch;
use super::JobStage;
use crate::cache::{CacheParams, CacheStore, Namespace};
use crate::error::{Result, SamleError};
use crate::pipeline::{AnalysisResult, Collaborators, StageContext};
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, error, info, instrument, warn};

type Outcome = Result<(AnalysisResult, BTreeMap<String, PathBuf>)>;

/// Per-batch settings every job runs with.
#[derive(Debug, Clone)]
pub(crate) struct PipelinePlan {
    pub model: String,
    pub target_language: Option<String>,
    /// Destination and formats. None skips the export stage.
    pub export: Option<(PathBuf, Vec<String>)>,
    pub sample_rate: u32,
    pub stage_timeout: Option<Duration>,
}

impl PipelinePlan {
    /// Parameters that distinguish one cached analysis of an identifier
    /// from another.
    pub fn cache_params(&self) -> CacheParams {
        let mut params = CacheParams::new();
        params.insert("model".to_string(), self.model.clone());
        if let Some(lang) = &self.target_language {
            params.insert("target_lang".to_string(), lang.clone());
        }
        params
    }
}

/// Transient files owned by one job. Everything is removed on release,
/// and on drop if release never ran.
struct Scratch {
    dir: Option<TempDir>,
    files: Vec<PathBuf>,
}

impl Scratch {
    fn create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix("job-").tempdir_in(root)?;
        Ok(Self {
            dir: Some(dir),
            files: Vec::new(),
        })
    }

    fn path(&self) -> PathBuf {
        self.dir
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .unwrap_or_default()
    }

    fn track(&mut self, path: &Path) {
        self.files.push(path.to_path_buf());
    }

    fn release(&mut self) {
        for file in self.files.drain(..) {
            match std::fs::remove_file(&file) {
                Ok(()) => debug!("Removed {:?}", file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {:?}: {}", file, e),
            }
        }
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("Failed to remove scratch dir {:?}: {}", path, e);
            }
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.release();
    }
}

/// Everything one job needs, owned so it can move into its task.
pub(crate) struct JobRunner {
    pub batch: Arc<Batch>,
    pub identifier: String,
    pub plan: Arc<PipelinePlan>,
    pub collaborators: Collaborators,
    pub cache: Option<Arc<CacheStore>>,
    pub scratch_root: PathBuf,
}

impl JobRunner {
    /// Drive the job to a terminal state. Never returns an error: every
    /// failure is recorded on the job instead.
    #[instrument(skip(self), fields(id = %self.identifier))]
    pub async fn run(self) {
        let now = Utc::now();

        if self.batch.cancel_signal().is_cancelled() {
            info!("Batch cancelled before dispatch");
            self.batch.update_job(&self.identifier, |job| {
                job.start(now);
                job.cancel(now)
            });
            return;
        }
        self.batch.update_job(&self.identifier, |job| job.start(now));

        if let Some(hit) = self.cached_result().await {
            info!("Cache hit");
            let outcome = self.export(hit).await;
            self.settle(outcome, true);
            return;
        }

        let mut scratch = match Scratch::create(&self.scratch_root) {
            Ok(s) => s,
            Err(e) => {
                self.settle(Err(e), false);
                return;
            }
        };

        let outcome = self.execute(&mut scratch).await;
        scratch.release();
        self.settle(outcome, false);
    }

    async fn execute(&self, scratch: &mut Scratch) -> Outcome {
        let c = &self.collaborators;

        self.enter(JobStage::Fetching)?;
        let ctx = self.context(JobStage::Fetching, scratch);
        let media = self
            .guard(JobStage::Fetching, c.fetcher.fetch(&self.identifier, &ctx))
            .await?;
        self.track(scratch, &media);
        self.stage_done(JobStage::Fetching);

        self.enter(JobStage::Transforming)?;
        let ctx = self.context(JobStage::Transforming, scratch);
        let audio = self
            .guard(
                JobStage::Transforming,
                c.transformer.transform(&media, self.plan.sample_rate, &ctx),
            )
            .await?;
        self.track(scratch, &audio);
        self.stage_done(JobStage::Transforming);

        self.enter(JobStage::Analyzing)?;
        let mut result = self
            .guard(JobStage::Analyzing, c.analyzer.analyze(&audio, &self.plan.model))
            .await?;
        self.stage_done(JobStage::Analyzing);

        if let Some(lang) = &self.plan.target_language {
            self.enter(JobStage::Translating)?;
            let translated = self
                .guard(JobStage::Translating, c.translator.translate(&result.text, lang))
                .await?;
            result.translated_text = Some(translated);
            self.stage_done(JobStage::Translating);
        }

        self.remember(&result).await;
        self.export(result).await
    }

    /// Run the export stage if requested. Also the whole pipeline for a cache hit.
    async fn export(&self, result: AnalysisResult) -> Outcome {
        let Some((destination, formats)) = &self.plan.export else {
            return Ok((result, BTreeMap::new()));
        };

        self.enter(JobStage::Exporting)?;
        let outputs = self
            .guard(
                JobStage::Exporting,
                self.collaborators
                    .exporter
                    .export(&self.identifier, &result, destination, formats),
            )
            .await?;
        self.stage_done(JobStage::Exporting);

        Ok((result, outputs))
    }

    /// Record the terminal state. Cancellation wins over failure when the
    /// switch is set, since the error is most likely a consequence of it.
    fn settle(&self, outcome: Outcome, cached: bool) {
        let now = Utc::now();
        match outcome {
            Ok((result, outputs)) => {
                self.batch.update_job(&self.identifier, |job| {
                    if job.is_terminal() {
                        return false;
                    }
                    job.cached = cached;
                    job.outputs = outputs;
                    job.complete(result, now)
                });
                info!("Job completed");
            }
            Err(e) if e.is_cancellation() || self.batch.cancel_signal().is_cancelled() => {
                info!("Job cancelled: {}", e);
                self.batch.update_job(&self.identifier, |job| job.cancel(now));
            }
            Err(e) => {
                error!("Job failed: {}", e);
                let message = e.to_string();
                self.batch.update_job(&self.identifier, |job| job.fail(message, now));
            }
        }
    }

    fn enter(&self, stage: JobStage) -> Result<()> {
        self.batch.enter_stage(&self.identifier, stage)?;
        debug!("Entered {}", stage);
        Ok(())
    }

    fn stage_done(&self, stage: JobStage) {
        self.batch
            .update_job(&self.identifier, |job| job.set_stage_progress(stage, 1.0));
    }

    fn track(&self, scratch: &mut Scratch, path: &Path) {
        scratch.track(path);
        self.batch
            .update_job(&self.identifier, |job| job.track_scratch(path));
    }

    /// Progress reports from the collaborator land on this job's `stage` only.
    fn context(&self, stage: JobStage, scratch: &Scratch) -> StageContext {
        let batch = self.batch.clone();
        let identifier = self.identifier.clone();
        StageContext::new(
            Arc::new(move |fraction| {
                batch.update_job(&identifier, |job| job.set_stage_progress(stage, fraction));
            }),
            self.batch.cancel_signal().clone(),
            scratch.path(),
        )
    }

    async fn guard<T, F>(&self, stage: JobStage, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.plan.stage_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                SamleError::Timeout {
                    stage: stage.to_string(),
                    seconds: limit.as_secs(),
                }
            })?,
            None => call.await,
        }
    }

    async fn cached_result(&self) -> Option<AnalysisResult> {
        let cache = self.cache.clone()?;
        let key = self.identifier.clone();
        let params = self.plan.cache_params();

        tokio::task::spawn_blocking(move || {
            cache.get::<AnalysisResult>(Namespace::Transcription, &key, &params)
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Cache lookup task failed: {}", e);
            None
        })
    }

    async fn remember(&self, result: &AnalysisResult) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let key = self.identifier.clone();
        let params = self.plan.cache_params();
        let value = result.clone();

        let stored = tokio::task::spawn_blocking(move || {
            cache.store(Namespace::Transcription, &key, &params, &value, None)
        })
        .await
        .unwrap_or(false);

        if !stored {
            warn!("Result was not cached");
        }
    }
}
