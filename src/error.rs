//! Error types for Samle.

use thiserror::Error;

/// Library-level error type for Samle operations.
#[derive(Error, Debug)]
pub enum SamleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Audio conversion failed: {0}")]
    Conversion(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Translation failed: {0}")]
    Translation(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: String, seconds: u64 },

    #[error("External tool not found: {0}. Please install it and ensure it's in your PATH.")]
    ToolNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("OpenAI API error: {0}")]
    OpenAI(String),
}

impl SamleError {
    /// Whether this error signals cooperative cancellation rather than a real failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SamleError::Cancelled)
    }
}

/// Result type alias for Samle operations.
pub type Result<T> = std::result::Result<T, SamleError>;
