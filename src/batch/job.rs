//! Per-identifier job state.

use crate::pipeline::AnalysisResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where a job is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Pending,
    Fetching,
    Transforming,
    Analyzing,
    Translating,
    Exporting,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl JobStage {
    /// Terminal stages never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStage::Completed | JobStage::Failed | JobStage::Cancelled | JobStage::Skipped
        )
    }

    /// The slice of overall progress this stage covers, as (start, weight).
    ///
    /// fetch 20%, transform 10%, analyze 40%, translate 20%, export 10%.
    /// A skipped optional stage is passed through: the next stage's band
    /// simply starts where it always does.
    pub fn band(&self) -> Option<(f64, f64)> {
        match self {
            JobStage::Fetching => Some((0.0, 0.2)),
            JobStage::Transforming => Some((0.2, 0.1)),
            JobStage::Analyzing => Some((0.3, 0.4)),
            JobStage::Translating => Some((0.7, 0.2)),
            JobStage::Exporting => Some((0.9, 0.1)),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobStage::Pending => "pending",
            JobStage::Fetching => "fetching",
            JobStage::Transforming => "transforming",
            JobStage::Analyzing => "analyzing",
            JobStage::Translating => "translating",
            JobStage::Exporting => "exporting",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
            JobStage::Cancelled => "cancelled",
            JobStage::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// Progress within each stage that reports it, each in [0, 1].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub fetch: f64,
    pub transform: f64,
    pub analyze: f64,
    pub translate: f64,
    pub export: f64,
}

impl StageProgress {
    fn slot(&mut self, stage: JobStage) -> Option<&mut f64> {
        match stage {
            JobStage::Fetching => Some(&mut self.fetch),
            JobStage::Transforming => Some(&mut self.transform),
            JobStage::Analyzing => Some(&mut self.analyze),
            JobStage::Translating => Some(&mut self.translate),
            JobStage::Exporting => Some(&mut self.export),
            _ => None,
        }
    }

    fn get(&self, stage: JobStage) -> f64 {
        match stage {
            JobStage::Fetching => self.fetch,
            JobStage::Transforming => self.transform,
            JobStage::Analyzing => self.analyze,
            JobStage::Translating => self.translate,
            JobStage::Exporting => self.export,
            _ => 0.0,
        }
    }
}

/// One identifier's run through the pipeline.
///
/// Snapshots handed to observers are clones of this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub identifier: String,
    pub stage: JobStage,
    pub overall_progress: f64,
    pub stage_progress: StageProgress,
    /// Present only once the job is completed.
    pub result: Option<AnalysisResult>,
    /// Present only when the job failed.
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Whether the result came from the cache.
    pub cached: bool,
    /// Files written by the export stage, by format.
    pub outputs: BTreeMap<String, PathBuf>,
    /// Transient files owned by this job. Empty once the job is terminal.
    pub scratch_resources: Vec<PathBuf>,
}

impl Job {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            stage: JobStage::Pending,
            overall_progress: 0.0,
            stage_progress: StageProgress::default(),
            result: None,
            error: None,
            started_at: None,
            ended_at: None,
            cached: false,
            outputs: BTreeMap::new(),
            scratch_resources: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Elapsed time: until now while running, until `ended_at` once terminal.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }

    /// Record the dispatch time. Returns false since nothing observable changed.
    pub fn start(&mut self, at: DateTime<Utc>) -> bool {
        if self.started_at.is_none() {
            self.started_at = Some(at);
        }
        false
    }

    /// Move to a new active stage.
    pub fn enter(&mut self, stage: JobStage) -> bool {
        if self.is_terminal() || stage.band().is_none() {
            return false;
        }
        self.stage = stage;
        if let Some(slot) = self.stage_progress.slot(stage) {
            *slot = 0.0;
        }
        self.recompute();
        true
    }

    /// Record progress for `stage`. Ignored unless that stage is active.
    pub fn set_stage_progress(&mut self, stage: JobStage, fraction: f64) -> bool {
        if self.stage != stage {
            return false;
        }
        let fraction = if fraction.is_finite() { fraction.clamp(0.0, 1.0) } else { 0.0 };
        match self.stage_progress.slot(stage) {
            Some(slot) => *slot = fraction,
            None => return false,
        }
        self.recompute();
        true
    }

    pub fn track_scratch(&mut self, path: &Path) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.scratch_resources.push(path.to_path_buf());
        true
    }

    pub fn complete(&mut self, result: AnalysisResult, at: DateTime<Utc>) -> bool {
        if !self.finish(JobStage::Completed, at) {
            return false;
        }
        self.result = Some(result);
        self.overall_progress = 1.0;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> bool {
        if !self.finish(JobStage::Failed, at) {
            return false;
        }
        self.error = Some(error.into());
        true
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> bool {
        self.finish(JobStage::Cancelled, at)
    }

    fn finish(&mut self, stage: JobStage, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.stage = stage;
        self.started_at.get_or_insert(at);
        self.ended_at = Some(at);
        self.scratch_resources.clear();
        true
    }

    /// Overall progress never goes backwards and only reaches 1.0 on completion.
    fn recompute(&mut self) {
        if let Some((start, weight)) = self.stage.band() {
            let value = (start + self.stage_progress.get(self.stage) * weight).min(1.0 - f64::EPSILON);
            self.overall_progress = self.overall_progress.max(value);
        }
    }
}
