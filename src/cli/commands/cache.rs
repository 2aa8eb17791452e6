//! Cache command implementation.

use crate::cache::{CacheConfig, CacheStore, Namespace};
use crate::cli::{format_bytes, CacheAction, Output};
use crate::config::Settings;
use anyhow::Result;
use std::time::Duration;

/// Run the cache command.
pub fn run_cache(action: &CacheAction, settings: &Settings) -> Result<()> {
    let dir = settings.cache_dir();
    let store = CacheStore::open(&dir, CacheConfig::from(&settings.cache))?;

    match action {
        CacheAction::Stats => {
            let overview = store.overview();

            Output::header("Cache");
            Output::kv("Location", &dir.display().to_string());
            if let Some(created) = overview.created_at {
                Output::kv("Created", &created.format("%Y-%m-%d %H:%M").to_string());
            }
            Output::kv(
                "Last cleanup",
                &overview
                    .last_cleanup
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string()),
            );
            Output::kv(
                "Size",
                &format!(
                    "{} in {} entries (limit {} per namespace)",
                    format_bytes(overview.total.size_bytes),
                    overview.total.item_count,
                    format_bytes(settings.cache.size_limit_bytes)
                ),
            );

            for (namespace, stats) in &overview.namespaces {
                if *namespace == Namespace::Metadata {
                    continue;
                }
                Output::list_item(&format!(
                    "{:<14} {:>6} entries  {:>10}",
                    namespace.to_string(),
                    stats.item_count,
                    format_bytes(stats.size_bytes)
                ));
            }
        }

        CacheAction::Clear { namespace } => {
            let target = match namespace {
                Some(name) => Some(name.parse::<Namespace>().map_err(|e| anyhow::anyhow!(e))?),
                None => None,
            };
            let label = target
                .map(|ns| format!("'{}' cache", ns))
                .unwrap_or_else(|| "all caches".to_string());

            if store.clear(target) {
                Output::success(&format!("Cleared {}", label));
            } else {
                Output::error(&format!("Failed to clear {}", label));
                anyhow::bail!("cache clear failed");
            }
        }

        CacheAction::Cleanup { max_age_days } => {
            let max_age = max_age_days.map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60)));
            let spinner = Output::spinner("Removing stale entries...");
            let (before, removed) = store.cleanup(max_age);
            spinner.finish_and_clear();
            Output::success(&format!("Removed {} of {} entries", removed, before));
        }
    }

    Ok(())
}
