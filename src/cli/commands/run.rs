//! Run command implementation.

use crate::batch::{
    BatchEvent, BatchOrchestrator, BatchRequest, BatchSnapshot, BatchStatus, ChannelObserver, Job,
    JobStage,
};
use crate::cli::preflight::{self, Operation};
use crate::cli::{format_duration, Output};
use crate::config::Settings;
use anyhow::Result;
use indicatif::{MultiProgress, ProgressBar};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Options collected from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub urls: Vec<String>,
    pub model: Option<String>,
    pub translate: Option<String>,
    pub output_dir: Option<String>,
    pub formats: Vec<String>,
    pub concurrency: Option<usize>,
    pub no_cache: bool,
}

/// Run the run command.
pub async fn run_batch(options: RunOptions, mut settings: Settings) -> Result<()> {
    if let Err(e) = preflight::check(Operation::Batch) {
        Output::error(&format!("{}", e));
        Output::info("Install the missing dependency and try again.");
        return Err(e.into());
    }

    if options.no_cache {
        settings.cache.enabled = false;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator =
        BatchOrchestrator::from_settings(&settings)?.with_observer(Arc::new(ChannelObserver::new(tx)));

    let request = BatchRequest {
        identifiers: options.urls.clone(),
        model: options.model.unwrap_or_else(|| settings.batch.model.clone()),
        target_language: options.translate,
        output_dir: options.output_dir.map(|d| Settings::expand_path(&d)),
        formats: options.formats,
        concurrency: options.concurrency,
    };
    let export_dir: Option<PathBuf> = request.output_dir.clone();

    let started = match orchestrator.process_batch(request) {
        Ok(started) => started,
        Err(e) => {
            Output::error(&format!("{}", e));
            return Err(e.into());
        }
    };

    let skipped = options.urls.len().saturating_sub(started.total);
    if skipped > 0 {
        Output::warning(&format!("Skipped {} invalid or duplicate URL(s)", skipped));
    }
    Output::info(&format!("Processing {} URL(s)", started.total));

    let multi = MultiProgress::new();
    let bars: HashMap<String, ProgressBar> = started
        .jobs
        .iter()
        .map(|id| (id.clone(), Output::job_bar(&multi, id)))
        .collect();

    let mut cancel_requested = false;
    let summary = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(BatchEvent::Progress(event)) => {
                    if let Some(job) = &event.job {
                        if let Some(bar) = bars.get(&job.identifier) {
                            render_job(bar, job);
                        }
                    }
                }
                Some(BatchEvent::Completed(summary)) => break Some(summary),
                None => break None,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                if orchestrator.cancel() {
                    let _ = multi.println("Cancelling: running stages will finish, no new stages start.");
                }
            }
        }
    };

    let summary = match summary {
        Some(s) => s,
        None => orchestrator
            .wait()
            .await
            .unwrap_or_else(BatchSnapshot::idle),
    };
    for bar in bars.values() {
        if !bar.is_finished() {
            bar.abandon();
        }
    }

    print_summary(&summary, export_dir.as_ref());

    match summary.status {
        BatchStatus::Failed => Err(anyhow::anyhow!(
            "{} of {} job(s) failed",
            summary.failed,
            summary.total
        )),
        _ => Ok(()),
    }
}

fn render_job(bar: &ProgressBar, job: &Job) {
    bar.set_position((job.overall_progress * 100.0).round() as u64);
    match job.stage {
        JobStage::Completed if job.cached => bar.finish_with_message("completed (cached)"),
        JobStage::Completed => bar.finish_with_message("completed"),
        JobStage::Failed => bar.abandon_with_message("failed"),
        JobStage::Cancelled => bar.abandon_with_message("cancelled"),
        stage => bar.set_message(stage.to_string()),
    }
}

fn print_summary(summary: &BatchSnapshot, export_dir: Option<&PathBuf>) {
    Output::header("Results");
    for job in summary.jobs.values() {
        let elapsed = job
            .elapsed()
            .map(|d| format_duration(d.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_default();
        let detail = match job.stage {
            JobStage::Failed => job.error.clone().unwrap_or_default(),
            JobStage::Completed if job.cached => format!("cached, {}", elapsed),
            _ => elapsed,
        };
        Output::job_result(&job.identifier, &job.stage.to_string(), &detail);
        for path in job.outputs.values() {
            Output::list_item(&path.display().to_string());
        }
    }

    println!();
    Output::kv("Status", &summary.status.to_string());
    Output::kv("Completed", &format!("{}/{}", summary.completed, summary.total));
    if summary.failed > 0 {
        Output::kv("Failed", &summary.failed.to_string());
    }
    if summary.cancelled > 0 {
        Output::kv("Cancelled", &summary.cancelled.to_string());
    }
    if let Some(dir) = export_dir {
        Output::kv("Output", &dir.display().to_string());
    }

    match summary.status {
        BatchStatus::Completed => Output::success("Batch completed."),
        BatchStatus::Cancelled => Output::warning("Batch cancelled."),
        _ => Output::error("Batch finished with failures."),
    }
}
