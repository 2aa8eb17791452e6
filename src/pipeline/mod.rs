//! Pipeline stage contracts for Samle.
//!
//! The batch orchestrator sequences these collaborators but never depends on
//! how they work. Each stage is a trait so the orchestrator can run against
//! real tools (yt-dlp, ffmpeg, OpenAI) or in-process fakes.
//!
//! # Stages
//!
//! - `Fetcher` - download the media behind an identifier
//! - `Transformer` - transcode to a fixed sample rate
//! - `Analyzer` - speech-to-text
//! - `Translator` - translate the transcript text
//! - `Exporter` - write subtitle / text / JSON files
//! - `IdentifierValidator` - cheap, pure pre-flight check on identifiers

mod analyze;
mod export;
mod fetch;
mod models;
mod retry;
mod transform;
mod translate;
mod validate;

pub use analyze::WhisperAnalyzer;
pub use export::{format_result, video_id_from_url, ExportFormat, FileExporter};
pub use fetch::YtDlpFetcher;
pub use models::{AnalysisResult, Segment};
pub use retry::{Backoff, RetryPolicy};
pub use transform::FfmpegTransformer;
pub use translate::OpenAiTranslator;
pub use validate::UrlValidator;

use crate::batch::CancelSignal;
use crate::config::Settings;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Callback receiving a stage's completion fraction in [0, 1].
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// What a running stage may see of its job: progress reporting, the batch's
/// cancel flag and the job's private scratch directory.
#[derive(Clone)]
pub struct StageContext {
    progress: ProgressFn,
    cancel: CancelSignal,
    scratch_dir: PathBuf,
}

impl StageContext {
    pub fn new(progress: ProgressFn, cancel: CancelSignal, scratch_dir: PathBuf) -> Self {
        Self {
            progress,
            cancel,
            scratch_dir,
        }
    }

    /// A context that drops progress and is never cancelled.
    pub fn detached(scratch_dir: PathBuf) -> Self {
        Self::new(Arc::new(|_| {}), CancelSignal::new(), scratch_dir)
    }

    pub fn report(&self, fraction: f64) {
        (self.progress)(fraction);
    }

    /// Collaborators may poll this to stop early. Not required.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Directory owned by the job. Removed when the job ends.
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }
}

/// Downloads the media behind an identifier to a local file.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, identifier: &str, ctx: &StageContext) -> Result<PathBuf>;
}

/// Transcodes a local file to audio at `target_rate` Hz.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, input: &Path, target_rate: u32, ctx: &StageContext) -> Result<PathBuf>;
}

/// Turns audio into text. No progress contract.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, input: &Path, model: &str) -> Result<AnalysisResult>;
}

/// Translates text into `target_language`.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String>;
}

/// Writes a result to `destination` in each requested format.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(
        &self,
        identifier: &str,
        result: &AnalysisResult,
        destination: &Path,
        formats: &[String],
    ) -> Result<BTreeMap<String, PathBuf>>;
}

/// Pure check run before a job is created.
pub trait IdentifierValidator: Send + Sync {
    fn validate(&self, identifier: &str) -> bool;
}

/// The full set of stage implementations a batch runs with.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub transformer: Arc<dyn Transformer>,
    pub analyzer: Arc<dyn Analyzer>,
    pub translator: Arc<dyn Translator>,
    pub exporter: Arc<dyn Exporter>,
    pub validator: Arc<dyn IdentifierValidator>,
}

impl Collaborators {
    /// Build the tool- and API-backed implementations from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let fetch_policy = RetryPolicy::new(
            settings.fetch.attempts,
            Backoff::Fixed(Duration::from_secs(settings.fetch.backoff_seconds)),
        );
        let translate_policy = RetryPolicy::new(
            settings.translation.attempts,
            Backoff::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(settings.translation.max_backoff_seconds),
            },
        );

        Self {
            fetcher: Arc::new(YtDlpFetcher::new(fetch_policy)),
            transformer: Arc::new(FfmpegTransformer::new()),
            analyzer: Arc::new(WhisperAnalyzer::new()),
            translator: Arc::new(OpenAiTranslator::new(&settings.translation.model, translate_policy)),
            exporter: Arc::new(FileExporter::new()),
            validator: Arc::new(UrlValidator::from_settings(&settings.validation)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_context_forwards_progress() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cancel = CancelSignal::new();
        let ctx = StageContext::new(
            Arc::new(move |f| sink.lock().unwrap().push(f)),
            cancel.clone(),
            PathBuf::from("/tmp"),
        );

        ctx.report(0.25);
        ctx.report(0.5);
        assert_eq!(*seen.lock().unwrap(), vec![0.25, 0.5]);

        assert!(!ctx.is_cancelled());
        cancel.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_detached_context() {
        let ctx = StageContext::detached(PathBuf::from("/tmp/job"));
        ctx.report(1.0);
        assert!(!ctx.is_cancelled());
        assert_eq!(ctx.scratch_dir(), Path::new("/tmp/job"));
    }
}
