//! Samle CLI entry point.

use anyhow::Result;
use clap::Parser;
use samle::cli::{commands, Cli, Commands};
use samle::config::Settings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let settings = match &cli.config {
        Some(path) => Settings::load_from(Some(&Settings::expand_path(path)))?,
        None => Settings::load()?,
    };

    // Initialize logging: -v flags win, then the configured level
    let log_level = match cli.verbose {
        0 => settings.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("samle={}", log_level)),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Ensure data directories exist
    std::fs::create_dir_all(settings.data_dir())?;
    std::fs::create_dir_all(settings.temp_dir())?;

    // Execute command
    match &cli.command {
        Commands::Run {
            urls,
            model,
            translate,
            output_dir,
            formats,
            concurrency,
            no_cache,
        } => {
            let options = commands::RunOptions {
                urls: urls.clone(),
                model: model.clone(),
                translate: translate.clone(),
                output_dir: output_dir.clone(),
                formats: formats.clone(),
                concurrency: *concurrency,
                no_cache: *no_cache,
            };
            commands::run_batch(options, settings).await?;
        }

        Commands::Cache { action } => {
            commands::run_cache(action, &settings)?;
        }

        Commands::Serve { host, port } => {
            commands::run_serve(host, *port, settings).await?;
        }

        Commands::Config { action } => {
            commands::run_config(action, settings, cli.config.as_deref())?;
        }
    }

    Ok(())
}
