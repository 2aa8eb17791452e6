//! Pre-flight checks before expensive operations.
//!
//! Validates that required tools and configuration are available
//! before starting a batch that would otherwise fail job by job.

use crate::error::{Result, SamleError};
use crate::openai::api_key_present;
use std::process::Command;

/// Requirements for different operations.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    /// Running a batch requires the media tools and an API key.
    Batch,
}

/// Run pre-flight checks for the given operation.
///
/// Returns Ok(()) if all checks pass, or an error describing what's missing.
pub fn check(operation: Operation) -> Result<()> {
    match operation {
        Operation::Batch => {
            check_api_key()?;
            check_tool("yt-dlp")?;
            check_tool("ffmpeg")?;
            check_tool("ffprobe")?;
        }
    }
    Ok(())
}

/// Check if OpenAI API key is configured.
fn check_api_key() -> Result<()> {
    if api_key_present() {
        Ok(())
    } else {
        Err(SamleError::Config(
            "OPENAI_API_KEY not set. Set it with: export OPENAI_API_KEY='sk-...'".to_string(),
        ))
    }
}

/// Check if an external tool is available.
fn check_tool(name: &str) -> Result<()> {
    // ffmpeg/ffprobe use -version (single dash), others use --version
    let version_arg = match name {
        "ffmpeg" | "ffprobe" => "-version",
        _ => "--version",
    };
    match Command::new(name).arg(version_arg).output() {
        Ok(output) if output.status.success() => Ok(()),
        Ok(_) => Err(SamleError::ToolNotFound(format!(
            "{} is installed but not working correctly",
            name
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(SamleError::ToolNotFound(name.to_string()))
        }
        Err(e) => Err(SamleError::ToolNotFound(format!("{}: {}", name, e))),
    }
}
