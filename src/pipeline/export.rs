//! Result export (SRT, VTT, plain text, JSON).

use super::{AnalysisResult, Exporter};
use crate::error::{Result, SamleError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};
use url::Url;

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExportFormat {
    Srt,
    Vtt,
    Txt,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Srt => "srt",
            ExportFormat::Vtt => "vtt",
            ExportFormat::Txt => "txt",
            ExportFormat::Json => "json",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "srt" => Ok(ExportFormat::Srt),
            "vtt" | "webvtt" => Ok(ExportFormat::Vtt),
            "txt" | "text" => Ok(ExportFormat::Txt),
            "json" => Ok(ExportFormat::Json),
            _ => Err(format!("Unknown format: {}. Use srt, vtt, txt, or json.", s)),
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Render a result in the given format.
pub fn format_result(result: &AnalysisResult, format: ExportFormat) -> String {
    match format {
        ExportFormat::Srt => format_srt(result),
        ExportFormat::Vtt => format_vtt(result),
        ExportFormat::Txt => result.text.clone(),
        ExportFormat::Json => {
            serde_json::to_string_pretty(result).unwrap_or_else(|_| "{}".to_string())
        }
    }
}

/// Derive a file-name-safe media id from a URL.
///
/// Uses the `v` query parameter when present, otherwise the last path
/// segment, otherwise the host.
pub fn video_id_from_url(url: &str) -> String {
    let raw = match Url::parse(url) {
        Ok(parsed) => parsed
            .query_pairs()
            .find(|(key, value)| key == "v" && !value.is_empty())
            .map(|(_, value)| value.into_owned())
            .or_else(|| {
                parsed
                    .path_segments()
                    .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
                    .map(str::to_string)
            })
            .or_else(|| parsed.host_str().map(str::to_string))
            .unwrap_or_default(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let id: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    if id.is_empty() {
        "media".to_string()
    } else {
        id
    }
}

/// Format as SRT (SubRip).
fn format_srt(result: &AnalysisResult) -> String {
    let mut output = String::new();

    for (i, segment) in result.segments.iter().enumerate() {
        output.push_str(&format!("{}\n", i + 1));
        output.push_str(&format!(
            "{} --> {}\n",
            format_timestamp(segment.start_seconds, ','),
            format_timestamp(segment.end_seconds, ',')
        ));
        output.push_str(segment.text.trim());
        output.push_str("\n\n");
    }

    output
}

/// Format as WebVTT.
fn format_vtt(result: &AnalysisResult) -> String {
    let mut output = String::from("WEBVTT\n\n");

    for (i, segment) in result.segments.iter().enumerate() {
        output.push_str(&format!("{}\n", i + 1));
        output.push_str(&format!(
            "{} --> {}\n",
            format_timestamp(segment.start_seconds, '.'),
            format_timestamp(segment.end_seconds, '.')
        ));
        output.push_str(segment.text.trim());
        output.push_str("\n\n");
    }

    output
}

/// `HH:MM:SS<sep>mmm`. SRT uses a comma, VTT a dot.
fn format_timestamp(seconds: f64, separator: char) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0) as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let ms = total_ms % 1000;

    format!("{:02}:{:02}:{:02}{}{:03}", hours, minutes, secs, separator, ms)
}

/// Writes `yt_<id>.<ext>` files into the destination directory.
///
/// Unknown format names are skipped with a warning.
#[derive(Debug, Clone, Default)]
pub struct FileExporter;

impl FileExporter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Exporter for FileExporter {
    #[instrument(skip(self, result), fields(destination = %destination.display()))]
    async fn export(
        &self,
        identifier: &str,
        result: &AnalysisResult,
        destination: &Path,
        formats: &[String],
    ) -> Result<BTreeMap<String, PathBuf>> {
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| SamleError::Export(format!("Cannot create {}: {}", destination.display(), e)))?;

        let base = format!("yt_{}", video_id_from_url(identifier));
        let mut written = BTreeMap::new();

        for name in formats {
            let format = match name.parse::<ExportFormat>() {
                Ok(f) => f,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };

            let path = destination.join(format!("{}.{}", base, format.extension()));
            tokio::fs::write(&path, format_result(result, format))
                .await
                .map_err(|e| SamleError::Export(format!("Cannot write {}: {}", path.display(), e)))?;

            debug!("Wrote {:?}", path);
            written.insert(format.extension().to_string(), path);
        }

        Ok(written)
    }
}
