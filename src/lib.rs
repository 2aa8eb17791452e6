//! Samle - batch media transcription
//!
//! Runs lists of media URLs through a download, convert, transcribe,
//! translate and export pipeline with bounded parallelism and a persistent
//! result cache.
//!
//! The name "Samle" is Norwegian for "gather."
//!
//! # Architecture
//!
//! - `batch` - Job state machine and the batch orchestrator
//! - `cache` - Namespaced SQLite cache with TTL expiry and LRU eviction
//! - `pipeline` - Stage contracts and their yt-dlp / ffmpeg / OpenAI implementations
//! - `config` - Configuration management
//! - `cli` - Command-line and HTTP surfaces
//!
//! # Example
//!
//! ```rust,no_run
//! use samle::batch::{BatchOrchestrator, BatchRequest};
//! use samle::config::Settings;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     let orchestrator = BatchOrchestrator::from_settings(&settings)?;
//!
//!     let request = BatchRequest::new(
//!         vec!["https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string()],
//!         "whisper-1",
//!     )
//!     .with_export("./subtitles", vec!["srt".to_string(), "vtt".to_string()]);
//!
//!     orchestrator.process_batch(request)?;
//!     if let Some(summary) = orchestrator.wait().await {
//!         println!("{} of {} completed", summary.completed, summary.total);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod openai;
pub mod pipeline;

pub use error::{Result, SamleError};
