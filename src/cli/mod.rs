//! CLI module for Samle.

pub mod commands;
mod output;
pub mod preflight;

pub use output::{format_bytes, format_duration, Output};

use clap::{Parser, Subcommand};

/// Samle - batch media transcription
///
/// Downloads, transcribes, optionally translates and exports lists of media
/// URLs in parallel, reusing earlier results from a local cache.
/// The name "Samle" is Norwegian for "gather."
#[derive(Parser, Debug)]
#[command(name = "samle")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process a batch of media URLs
    Run {
        /// Media URLs to process
        #[arg(required = true)]
        urls: Vec<String>,

        /// Speech-to-text model (defaults to batch.model from config)
        #[arg(short, long)]
        model: Option<String>,

        /// Translate transcripts into this language (e.g. "de", "French")
        #[arg(short, long)]
        translate: Option<String>,

        /// Directory to write exported files into
        #[arg(short, long)]
        output_dir: Option<String>,

        /// Export formats (srt, vtt, txt, json). Repeatable.
        #[arg(short, long = "format")]
        formats: Vec<String>,

        /// Number of URLs processed in parallel (1-10)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Neither read nor write the result cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Inspect and maintain the result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Start HTTP API server for controlling batches remotely
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show hit/miss counters and disk usage per namespace
    Stats,

    /// Remove cached entries
    Clear {
        /// Namespace to clear (transcription, translation, download). All if omitted.
        namespace: Option<String>,
    },

    /// Purge expired entries and entries older than the given age
    Cleanup {
        /// Maximum entry age in days (defaults to the configured TTL)
        #[arg(long)]
        max_age_days: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Write the current configuration to the config file
    Init,

    /// Open configuration file in editor
    Edit,

    /// Show configuration file path
    Path,
}
