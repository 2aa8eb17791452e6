//! Media download via yt-dlp.

use super::{Fetcher, RetryPolicy, StageContext};
use crate::error::{Result, SamleError};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument};

const OUTPUT_STEM: &str = "source";

/// Downloads the best available audio stream with yt-dlp.
///
/// Progress is read from yt-dlp's `[download]  42.0%` lines. Failed downloads
/// are retried according to the configured policy.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: String,
    policy: RetryPolicy,
    progress_pattern: Regex,
}

impl YtDlpFetcher {
    pub fn new(policy: RetryPolicy) -> Self {
        // Matches "[download]  42.5% of 3.21MiB at ..." lines
        let progress_pattern =
            Regex::new(r"^\[download\]\s+(\d+(?:\.\d+)?)%").expect("Invalid regex");

        Self {
            binary: "yt-dlp".to_string(),
            policy,
            progress_pattern,
        }
    }

    /// Use a different yt-dlp executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn download_once(&self, url: &str, ctx: &StageContext) -> Result<PathBuf> {
        std::fs::create_dir_all(ctx.scratch_dir())?;

        let template = ctx.scratch_dir().join(format!("{}.%(ext)s", OUTPUT_STEM));

        let spawned = Command::new(&self.binary)
            .arg("--format").arg("bestaudio/best")
            .arg("--output").arg(&template)
            .arg("--no-playlist")
            .arg("--newline")
            .arg("--no-warnings")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SamleError::ToolNotFound(self.binary.clone()));
            }
            Err(e) => {
                return Err(SamleError::Download(format!("yt-dlp execution failed: {e}")));
            }
        };

        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(err) = stderr.as_mut() {
                let _ = err.read_to_string(&mut buf).await;
            }
            buf
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(percent) = self.parse_download_percent(&line) {
                    ctx.report(percent / 100.0);
                }
                if ctx.is_cancelled() {
                    let _ = child.start_kill();
                    return Err(SamleError::Cancelled);
                }
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(SamleError::Download(format!("yt-dlp failed: {}", stderr.trim())));
        }

        find_download(ctx.scratch_dir())
    }

    /// Extract the percentage from a yt-dlp progress line.
    fn parse_download_percent(&self, line: &str) -> Option<f64> {
        self.progress_pattern
            .captures(line.trim_start())
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|p| p.clamp(0.0, 100.0))
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    #[instrument(skip(self, ctx), fields(url = %identifier))]
    async fn fetch(&self, identifier: &str, ctx: &StageContext) -> Result<PathBuf> {
        info!("Downloading media");

        let path = self
            .policy
            .run("download", |attempt| async move {
                if ctx.is_cancelled() {
                    return Err(SamleError::Cancelled);
                }
                debug!("Download attempt {}", attempt);
                ctx.report(0.0);
                self.download_once(identifier, ctx).await
            })
            .await?;

        ctx.report(1.0);
        info!("Downloaded to {:?}", path);
        Ok(path)
    }
}

/// Locates the file yt-dlp wrote, ignoring its partial-download leftovers.
fn find_download(dir: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SamleError::Download(format!("Cannot read directory: {e}")))?;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(OUTPUT_STEM) && !name.ends_with(".part") && !name.ends_with(".ytdl") {
            return Ok(entry.path());
        }
    }

    Err(SamleError::Download("Media file not found after download".into()))
}
