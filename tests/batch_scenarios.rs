//! End-to-end batch scenarios against in-process fake collaborators.

use async_trait::async_trait;
use samle::batch::{
    BatchObserver, BatchOrchestrator, BatchRequest, BatchSnapshot, BatchStatus, JobStage,
    OrchestratorOptions, ProgressEvent,
};
use samle::cache::{params, CacheConfig, CacheStore, Namespace};
use samle::pipeline::{
    video_id_from_url, AnalysisResult, Analyzer, Collaborators, Fetcher, FileExporter, Segment,
    StageContext, Transformer, Translator, UrlValidator,
};
use samle::{Result, SamleError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const ALPHA: &str = "https://youtu.be/alpha";
const BETA: &str = "https://www.youtube.com/watch?v=beta";
const GAMMA: &str = "https://youtu.be/gamma";

/// Holds a stage until the test opens it.
#[derive(Default)]
struct Gate {
    entered: Notify,
    released: AtomicBool,
    release: Notify,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        loop {
            let released = self.release.notified();
            if self.released.load(Ordering::SeqCst) {
                return;
            }
            released.await;
        }
    }

    async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    fn open(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release.notify_waiters();
    }
}

/// Fake fetch / transform / analyze / translate that record every call.
///
/// Jobs are told apart by the media id derived from their URL.
#[derive(Default)]
struct FakeMedia {
    calls: Mutex<Vec<String>>,
    fail_analyze: Option<&'static str>,
    panic_analyze: Option<&'static str>,
    fetch_gate: Option<Arc<Gate>>,
    transform_gate: Option<(&'static str, Arc<Gate>)>,
}

impl FakeMedia {
    fn record(&self, stage: &str, id: &str) {
        self.calls.lock().unwrap().push(format!("{}:{}", stage, id));
    }

    fn count(&self, stage: &str, id: &str) -> usize {
        let call = format!("{}:{}", stage, id);
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    fn stage_calls(&self, stage: &str) -> usize {
        let prefix = format!("{}:", stage);
        self.calls.lock().unwrap().iter().filter(|c| c.starts_with(&prefix)).count()
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl Fetcher for FakeMedia {
    async fn fetch(&self, identifier: &str, ctx: &StageContext) -> Result<PathBuf> {
        let id = video_id_from_url(identifier);
        self.record("fetch", &id);
        if let Some(gate) = &self.fetch_gate {
            gate.pass().await;
        }
        ctx.report(0.5);
        let path = ctx.scratch_dir().join(format!("{}.webm", id));
        tokio::fs::write(&path, b"media").await?;
        ctx.report(1.0);
        Ok(path)
    }
}

#[async_trait]
impl Transformer for FakeMedia {
    async fn transform(&self, input: &Path, _rate: u32, ctx: &StageContext) -> Result<PathBuf> {
        let id = stem(input);
        self.record("transform", &id);
        if let Some((gated, gate)) = &self.transform_gate {
            if *gated == id {
                gate.pass().await;
            }
        }
        let output = input.with_extension("wav");
        tokio::fs::write(&output, b"audio").await?;
        ctx.report(1.0);
        Ok(output)
    }
}

#[async_trait]
impl Analyzer for FakeMedia {
    async fn analyze(&self, input: &Path, model: &str) -> Result<AnalysisResult> {
        let id = stem(input);
        self.record("analyze", &id);
        if self.panic_analyze == Some(id.as_str()) {
            panic!("analyzer crashed on {}", id);
        }
        if self.fail_analyze == Some(id.as_str()) {
            return Err(SamleError::Analysis(format!("no speech found in {}", id)));
        }
        Ok(AnalysisResult::from_segments(vec![Segment::new(
            0.0,
            1.5,
            format!("{} via {}", id, model),
        )]))
    }
}

#[async_trait]
impl Translator for FakeMedia {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String> {
        self.record("translate", text);
        Ok(format!("[{}] {}", target_language, text))
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<ProgressEvent>>,
    completions: Mutex<Vec<BatchSnapshot>>,
}

impl Recorder {
    /// Every stage a job was observed in, in order, without repeats.
    fn stages(&self, identifier: &str) -> Vec<JobStage> {
        let mut stages: Vec<JobStage> = Vec::new();
        for event in self.events.lock().unwrap().iter() {
            if let Some(job) = event.job.as_ref().filter(|j| j.identifier == identifier) {
                if stages.last() != Some(&job.stage) {
                    stages.push(job.stage);
                }
            }
        }
        stages
    }
}

impl BatchObserver for Recorder {
    fn on_progress(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn on_complete(&self, summary: &BatchSnapshot) {
        self.completions.lock().unwrap().push(summary.clone());
    }
}

struct Harness {
    orchestrator: BatchOrchestrator,
    media: Arc<FakeMedia>,
    recorder: Arc<Recorder>,
    scratch: tempfile::TempDir,
}

fn harness(media: FakeMedia) -> Harness {
    harness_with(media, None, OrchestratorOptions::default())
}

fn harness_with(
    media: FakeMedia,
    cache: Option<Arc<CacheStore>>,
    options: OrchestratorOptions,
) -> Harness {
    let scratch = tempfile::tempdir().unwrap();
    let media = Arc::new(media);
    let recorder = Arc::new(Recorder::default());

    let collaborators = Collaborators {
        fetcher: media.clone(),
        transformer: media.clone(),
        analyzer: media.clone(),
        translator: media.clone(),
        exporter: Arc::new(FileExporter::new()),
        validator: Arc::new(UrlValidator::default()),
    };
    let options = OrchestratorOptions {
        scratch_root: scratch.path().join("jobs"),
        ..options
    };

    let mut orchestrator =
        BatchOrchestrator::new(collaborators, options).with_observer(recorder.clone());
    if let Some(cache) = cache {
        orchestrator = orchestrator.with_cache(cache);
    }

    Harness {
        orchestrator,
        media,
        recorder,
        scratch,
    }
}

fn urls(list: &[&str]) -> Vec<String> {
    list.iter().map(|u| u.to_string()).collect()
}

fn scratch_is_empty(root: &Path) -> bool {
    match std::fs::read_dir(root) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

#[tokio::test]
async fn test_process_batch_returns_before_jobs_finish() {
    let gate = Arc::new(Gate::default());
    let h = harness(FakeMedia {
        fetch_gate: Some(gate.clone()),
        ..Default::default()
    });

    let started = h
        .orchestrator
        .process_batch(BatchRequest::new(urls(&[ALPHA, BETA, GAMMA]), "base").with_concurrency(2))
        .unwrap();

    assert_eq!(started.total, 3);
    assert_eq!(started.jobs.len(), 3);

    let status = h.orchestrator.get_status();
    assert_eq!(status.status, BatchStatus::Running);
    assert_eq!(status.total, 3);
    assert_eq!(status.completed, 0);

    gate.open();
    let summary = h.orchestrator.wait().await.unwrap();
    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.completed, 3);
}

#[tokio::test]
async fn test_invalid_identifiers_are_dropped() {
    let h = harness(FakeMedia::default());

    let started = h
        .orchestrator
        .process_batch(BatchRequest::new(
            urls(&[ALPHA, "https://vimeo.com/12345", GAMMA]),
            "base",
        ))
        .unwrap();

    assert_eq!(started.total, 2);
    assert!(!started.jobs.iter().any(|j| j.contains("vimeo")));

    let summary = h.orchestrator.wait().await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.completed, 2);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_reaches_one_only_on_completion() {
    let h = harness(FakeMedia::default());

    h.orchestrator
        .process_batch(
            BatchRequest::new(urls(&[ALPHA, BETA]), "base")
                .with_translation("de")
                .with_export(h.scratch.path().join("out"), vec!["srt".into(), "json".into()]),
        )
        .unwrap();
    let summary = h.orchestrator.wait().await.unwrap();
    assert_eq!(summary.status, BatchStatus::Completed);

    for id in [ALPHA, BETA] {
        let mut last = 0.0;
        for event in h.recorder.events.lock().unwrap().iter() {
            let Some(job) = event.job.as_ref().filter(|j| j.identifier == id) else {
                continue;
            };
            assert!(job.overall_progress >= last, "progress went backwards for {}", id);
            assert_eq!(job.overall_progress == 1.0, job.stage == JobStage::Completed);
            assert_eq!(job.result.is_some(), job.stage == JobStage::Completed);
            last = job.overall_progress;
        }
        assert_eq!(last, 1.0);

        assert_eq!(
            h.recorder.stages(id),
            vec![
                JobStage::Fetching,
                JobStage::Transforming,
                JobStage::Analyzing,
                JobStage::Translating,
                JobStage::Exporting,
                JobStage::Completed,
            ]
        );
    }

    let alpha = &summary.jobs[ALPHA];
    assert_eq!(
        alpha.result.as_ref().unwrap().translated_text.as_deref(),
        Some("[de] alpha via base")
    );
    assert!(alpha.outputs["srt"].ends_with("yt_alpha.srt"));
    assert!(alpha.outputs["json"].exists());

    // Batch-wide progress in the final report is the average.
    assert_eq!(summary.progress, 1.0);
    assert_eq!(h.recorder.completions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cache_hit_skips_expensive_stages() {
    let cache = Arc::new(CacheStore::in_memory(CacheConfig::default()).unwrap());
    let h = harness_with(FakeMedia::default(), Some(cache.clone()), OrchestratorOptions::default());

    h.orchestrator
        .process_batch(BatchRequest::new(urls(&[ALPHA]), "base").with_translation("fr"))
        .unwrap();
    let first = h.orchestrator.wait().await.unwrap();
    let first_result = first.jobs[ALPHA].result.clone().unwrap();
    assert!(!first.jobs[ALPHA].cached);
    assert_eq!(cache.stats(Some(Namespace::Transcription)).stores, 1);

    h.recorder.events.lock().unwrap().clear();
    let out = h.scratch.path().join("exports");
    h.orchestrator
        .process_batch(
            BatchRequest::new(urls(&[ALPHA]), "base")
                .with_translation("fr")
                .with_export(&out, vec!["txt".into()]),
        )
        .unwrap();
    let second = h.orchestrator.wait().await.unwrap();

    let job = &second.jobs[ALPHA];
    assert_eq!(job.stage, JobStage::Completed);
    assert!(job.cached);
    assert_eq!(job.result.as_ref(), Some(&first_result));
    // Export still runs on a hit.
    assert!(out.join("yt_alpha.txt").exists());

    let stages = h.recorder.stages(ALPHA);
    assert!(!stages.contains(&JobStage::Fetching));
    assert!(!stages.contains(&JobStage::Transforming));
    assert!(!stages.contains(&JobStage::Analyzing));
    assert_eq!(stages, vec![JobStage::Exporting, JobStage::Completed]);

    assert_eq!(h.media.count("fetch", "alpha"), 1);
    assert_eq!(h.media.count("analyze", "alpha"), 1);
    assert_eq!(cache.stats(Some(Namespace::Transcription)).hits, 1);
}

#[tokio::test]
async fn test_corrupt_cache_entry_runs_the_full_pipeline() {
    let cache = Arc::new(CacheStore::in_memory(CacheConfig::default()).unwrap());
    let model = params([("model", "base")]);
    assert!(cache.store(Namespace::Transcription, ALPHA, &model, &"not an analysis result", None));

    let h = harness_with(FakeMedia::default(), Some(cache.clone()), OrchestratorOptions::default());
    h.orchestrator
        .process_batch(BatchRequest::new(urls(&[ALPHA]), "base"))
        .unwrap();
    let summary = h.orchestrator.wait().await.unwrap();

    let job = &summary.jobs[ALPHA];
    assert_eq!(job.stage, JobStage::Completed);
    assert!(!job.cached);
    assert!(job.error.is_none());
    assert_eq!(
        h.recorder.stages(ALPHA),
        vec![
            JobStage::Fetching,
            JobStage::Transforming,
            JobStage::Analyzing,
            JobStage::Completed,
        ]
    );

    // The bad entry counted as an error and was replaced by the fresh result.
    let stats = cache.stats(Some(Namespace::Transcription));
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.stores, 2);
    assert_eq!(
        cache.get::<AnalysisResult>(Namespace::Transcription, ALPHA, &model).as_ref(),
        job.result.as_ref()
    );
}

#[tokio::test]
async fn test_different_target_language_misses_the_cache() {
    let cache = Arc::new(CacheStore::in_memory(CacheConfig::default()).unwrap());
    let h = harness_with(FakeMedia::default(), Some(cache), OrchestratorOptions::default());

    h.orchestrator
        .process_batch(BatchRequest::new(urls(&[ALPHA]), "base").with_translation("de"))
        .unwrap();
    h.orchestrator.wait().await.unwrap();

    h.orchestrator
        .process_batch(BatchRequest::new(urls(&[ALPHA]), "base").with_translation("es"))
        .unwrap();
    let second = h.orchestrator.wait().await.unwrap();

    assert!(!second.jobs[ALPHA].cached);
    assert_eq!(h.media.count("analyze", "alpha"), 2);
    assert_eq!(
        second.jobs[ALPHA].result.as_ref().unwrap().translated_text.as_deref(),
        Some("[es] alpha via base")
    );
}

#[tokio::test]
async fn test_failed_job_does_not_sink_siblings() {
    let h = harness(FakeMedia {
        fail_analyze: Some("beta"),
        ..Default::default()
    });

    h.orchestrator
        .process_batch(BatchRequest::new(urls(&[ALPHA, BETA, GAMMA]), "base").with_concurrency(3))
        .unwrap();
    let summary = h.orchestrator.wait().await.unwrap();

    let beta = &summary.jobs[BETA];
    assert_eq!(beta.stage, JobStage::Failed);
    assert!(beta.error.as_deref().is_some_and(|e| e.contains("no speech found")));
    assert!(beta.result.is_none());

    assert_eq!(summary.jobs[ALPHA].stage, JobStage::Completed);
    assert_eq!(summary.jobs[GAMMA].stage, JobStage::Completed);
    assert_eq!(summary.status, BatchStatus::Failed);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);

    // Scratch files are gone for every job, failed or not.
    assert!(scratch_is_empty(&h.scratch.path().join("jobs")));
    assert_eq!(h.recorder.completions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancel_stops_before_the_next_stage() {
    let gate = Arc::new(Gate::default());
    let h = harness(FakeMedia {
        transform_gate: Some(("alpha", gate.clone())),
        ..Default::default()
    });

    h.orchestrator
        .process_batch(BatchRequest::new(urls(&[ALPHA, GAMMA]), "base").with_concurrency(1))
        .unwrap();

    gate.wait_entered().await;
    assert_eq!(h.orchestrator.get_status().jobs[ALPHA].stage, JobStage::Transforming);

    assert!(h.orchestrator.cancel());
    assert!(!h.orchestrator.cancel());
    assert!(!h.orchestrator.pause());

    // The in-flight transform is allowed to finish.
    gate.open();
    let summary = h.orchestrator.wait().await.unwrap();

    assert_eq!(summary.status, BatchStatus::Cancelled);
    let alpha = &summary.jobs[ALPHA];
    assert_eq!(alpha.stage, JobStage::Cancelled);
    assert!(alpha.error.is_none());
    assert!(!h.recorder.stages(ALPHA).contains(&JobStage::Analyzing));
    assert_eq!(h.media.stage_calls("analyze"), 0);

    // The queued job never started any stage.
    assert_eq!(summary.jobs[GAMMA].stage, JobStage::Cancelled);
    assert_eq!(h.media.count("fetch", "gamma"), 0);
    assert_eq!(summary.cancelled, 2);

    assert!(scratch_is_empty(&h.scratch.path().join("jobs")));
    assert!(!h.orchestrator.cancel());
}

#[tokio::test]
async fn test_pause_and_resume_only_toggle_status() {
    let gate = Arc::new(Gate::default());
    let h = harness(FakeMedia {
        fetch_gate: Some(gate.clone()),
        ..Default::default()
    });

    assert!(!h.orchestrator.pause());

    h.orchestrator
        .process_batch(BatchRequest::new(urls(&[ALPHA]), "base"))
        .unwrap();
    gate.wait_entered().await;

    assert!(h.orchestrator.pause());
    assert!(!h.orchestrator.pause());
    assert_eq!(h.orchestrator.get_status().status, BatchStatus::Paused);
    // A paused batch cannot be cancelled.
    assert!(!h.orchestrator.cancel());
    assert!(h.orchestrator.resume());
    assert!(!h.orchestrator.resume());
    assert_eq!(h.orchestrator.get_status().status, BatchStatus::Running);

    gate.open();
    let summary = h.orchestrator.wait().await.unwrap();
    assert_eq!(summary.status, BatchStatus::Completed);
}

#[tokio::test]
async fn test_stage_timeout_fails_the_job() {
    let gate = Arc::new(Gate::default());
    let options = OrchestratorOptions {
        stage_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let h = harness_with(
        FakeMedia {
            transform_gate: Some(("alpha", gate)),
            ..Default::default()
        },
        None,
        options,
    );

    h.orchestrator
        .process_batch(BatchRequest::new(urls(&[ALPHA, GAMMA]), "base"))
        .unwrap();
    let summary = h.orchestrator.wait().await.unwrap();

    let alpha = &summary.jobs[ALPHA];
    assert_eq!(alpha.stage, JobStage::Failed);
    assert!(alpha.error.as_deref().is_some_and(|e| e.contains("timed out")));
    assert_eq!(summary.jobs[GAMMA].stage, JobStage::Completed);
    assert_eq!(summary.status, BatchStatus::Failed);
}

#[tokio::test]
async fn test_panicking_collaborator_is_contained() {
    let h = harness(FakeMedia {
        panic_analyze: Some("gamma"),
        ..Default::default()
    });

    h.orchestrator
        .process_batch(BatchRequest::new(urls(&[ALPHA, GAMMA]), "base"))
        .unwrap();
    let summary = h.orchestrator.wait().await.unwrap();

    assert_eq!(summary.jobs[GAMMA].stage, JobStage::Failed);
    assert!(summary.jobs[GAMMA].error.is_some());
    assert_eq!(summary.jobs[ALPHA].stage, JobStage::Completed);
    assert_eq!(summary.status, BatchStatus::Failed);
    assert!(scratch_is_empty(&h.scratch.path().join("jobs")));
}

#[tokio::test]
async fn test_new_batch_replaces_the_previous_one() {
    let h = harness(FakeMedia::default());

    let first = h
        .orchestrator
        .process_batch(BatchRequest::new(urls(&[ALPHA, BETA]), "base"))
        .unwrap();
    h.orchestrator.wait().await.unwrap();

    let second = h
        .orchestrator
        .process_batch(BatchRequest::new(urls(&[GAMMA]), "base"))
        .unwrap();
    let summary = h.orchestrator.wait().await.unwrap();

    assert_ne!(first.batch_id, second.batch_id);
    assert_eq!(summary.batch_id, Some(second.batch_id));
    assert_eq!(summary.total, 1);
    assert!(summary.jobs.contains_key(GAMMA));
    tokio_test::assert_ok!(serde_json::to_string(&summary));
}

#[tokio::test]
async fn test_unknown_export_formats_are_skipped() {
    let h = harness(FakeMedia::default());
    let out = h.scratch.path().join("out");

    h.orchestrator
        .process_batch(
            BatchRequest::new(urls(&[BETA]), "base")
                .with_export(&out, vec!["vtt".into(), "docx".into()]),
        )
        .unwrap();
    let summary = h.orchestrator.wait().await.unwrap();

    let outputs: &BTreeMap<String, PathBuf> = &summary.jobs[BETA].outputs;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs["vtt"], out.join("yt_beta.vtt"));
}
