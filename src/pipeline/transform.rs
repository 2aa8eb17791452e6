//! Audio normalization via ffmpeg.

use super::{StageContext, Transformer};
use crate::error::{Result, SamleError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Converts any media file to mono 16-bit PCM WAV at a fixed sample rate.
#[derive(Debug, Clone)]
pub struct FfmpegTransformer {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegTransformer {
    pub fn new() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }

    /// Use different ffmpeg / ffprobe executables.
    pub fn with_binaries(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Queries the duration of a media file using ffprobe with JSON output.
    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let result = Command::new(&self.ffprobe)
            .arg("-v").arg("quiet")
            .arg("-print_format").arg("json")
            .arg("-show_format")
            .arg(path)
            .output()
            .await;

        let output = match result {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SamleError::ToolNotFound(self.ffprobe.clone()));
            }
            Err(e) => {
                return Err(SamleError::Conversion(format!("ffprobe failed: {e}")));
            }
        };

        if !output.status.success() {
            return Err(SamleError::Conversion("ffprobe returned error".into()));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|_| SamleError::Conversion("Invalid ffprobe output".into()))?;

        parsed["format"]["duration"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| SamleError::Conversion("Could not determine media duration".into()))
    }
}

impl Default for FfmpegTransformer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transformer for FfmpegTransformer {
    #[instrument(skip(self, ctx), fields(rate = target_rate))]
    async fn transform(&self, input: &Path, target_rate: u32, ctx: &StageContext) -> Result<PathBuf> {
        std::fs::create_dir_all(ctx.scratch_dir())?;
        let output = ctx.scratch_dir().join(format!("audio_{}hz.wav", target_rate));

        // Progress is best-effort: without a duration we only report completion.
        let duration = match self.probe_duration(input).await {
            Ok(d) if d > 0.0 => Some(d),
            Ok(_) => None,
            Err(e @ SamleError::ToolNotFound(_)) => return Err(e),
            Err(e) => {
                warn!("Could not probe duration: {}", e);
                None
            }
        };

        info!("Converting {:?} to {} Hz mono WAV", input, target_rate);

        let spawned = Command::new(&self.ffmpeg)
            .arg("-i").arg(input)
            .arg("-vn")
            .arg("-ar").arg(target_rate.to_string())
            .arg("-ac").arg("1")
            .arg("-c:a").arg("pcm_s16le")
            .arg("-progress").arg("pipe:1")
            .arg("-nostats")
            .arg("-y")
            .arg("-loglevel").arg("error")
            .arg(&output)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SamleError::ToolNotFound(self.ffmpeg.clone()));
            }
            Err(e) => return Err(SamleError::Conversion(format!("ffmpeg error: {e}"))),
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
                if let (Some(total), Some(done)) = (duration, parse_out_time(&line)) {
                    ctx.report((done / total).clamp(0.0, 1.0));
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
            return Err(SamleError::Conversion(format!("ffmpeg conversion failed: {}", stderr.trim())));
        }
        if !output.exists() {
            return Err(SamleError::Conversion("ffmpeg produced no output".into()));
        }

        debug!("Wrote {:?}", output);
        ctx.report(1.0);
        Ok(output)
    }
}

/// Seconds processed so far, from an ffmpeg `-progress` line.
///
/// `out_time_ms` is in microseconds despite its name; `out_time_us` is the
/// same value under its correct name in newer builds.
fn parse_out_time(line: &str) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.parse::<i64>().ok().map(|us| us.max(0) as f64 / 1_000_000.0),
        _ => None,
    }
}
