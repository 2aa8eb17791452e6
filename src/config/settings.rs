//! Configuration settings for Samle.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub batch: BatchSettings,
    pub cache: CacheSettings,
    pub validation: ValidationSettings,
    pub fetch: FetchSettings,
    pub translation: TranslationSettings,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Directory for storing application data.
    pub data_dir: String,
    /// Directory for per-job scratch files.
    pub temp_dir: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.samle".to_string(),
            temp_dir: "/tmp/samle".to_string(),
            log_level: "warn".to_string(),
        }
    }
}

/// Batch processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Number of jobs processed in parallel (clamped to 1..=10).
    pub concurrency: usize,
    /// Speech-to-text model used by the analyze stage.
    pub model: String,
    /// Sample rate for the transform stage output.
    pub sample_rate: u32,
    /// Export formats used when none are given on the command line.
    pub formats: Vec<String>,
    /// Optional upper bound for a single stage. None disables the timeout.
    pub stage_timeout_seconds: Option<u64>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            model: "whisper-1".to_string(),
            sample_rate: 16_000,
            formats: vec!["srt".to_string()],
            stage_timeout_seconds: None,
        }
    }
}

/// Result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Whether results are cached between runs.
    pub enabled: bool,
    /// Cache directory (one database per namespace).
    pub dir: String,
    /// Default time-to-live for entries.
    pub default_ttl_seconds: u64,
    /// Size budget per namespace.
    pub size_limit_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: "~/.samle/cache".to_string(),
            default_ttl_seconds: 60 * 60 * 24 * 30, // 30 days
            size_limit_bytes: 1024 * 1024 * 1024,   // 1 GiB
        }
    }
}

/// Identifier validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Accepted URL schemes.
    pub allowed_schemes: Vec<String>,
    /// Accepted hosts. Subdomains of these hosts are accepted as well.
    pub allowed_hosts: Vec<String>,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
            allowed_hosts: vec!["youtube.com".to_string(), "youtu.be".to_string()],
        }
    }
}

/// Download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSettings {
    /// Total download attempts before giving up.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub backoff_seconds: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_seconds: 2,
        }
    }
}

/// Translation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationSettings {
    /// Chat model used for translation.
    pub model: String,
    /// Total translation attempts before giving up.
    pub attempts: u32,
    /// Ceiling for the exponential backoff between attempts.
    pub max_backoff_seconds: u64,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            attempts: 5,
            max_backoff_seconds: 10,
        }
    }
}

impl Settings {
    /// Load settings from the default configuration file.
    pub fn load() -> crate::error::Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from a specific path, or default location if None.
    pub fn load_from(path: Option<&PathBuf>) -> crate::error::Result<Self> {
        let config_path = match path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: Settings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            Ok(Settings::default())
        }
    }

    /// Save settings to the default configuration file.
    pub fn save(&self) -> crate::error::Result<()> {
        self.save_to(&Self::default_config_path())
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &PathBuf) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::SamleError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("samle")
            .join("config.toml")
    }

    /// Expand shell variables in paths (e.g., ~).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }

    /// Get the expanded data directory path.
    pub fn data_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.data_dir)
    }

    /// Get the expanded temp directory path.
    pub fn temp_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.temp_dir)
    }

    /// Get the expanded cache directory path.
    pub fn cache_dir(&self) -> PathBuf {
        Self::expand_path(&self.cache.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [batch]
            concurrency = 4

            [cache]
            default_ttl_seconds = 60
            "#,
        )
        .unwrap();

        assert_eq!(settings.batch.concurrency, 4);
        assert_eq!(settings.batch.model, "whisper-1");
        assert_eq!(settings.cache.default_ttl_seconds, 60);
        assert_eq!(settings.cache.size_limit_bytes, 1024 * 1024 * 1024);
        assert_eq!(settings.fetch.attempts, 3);
        assert!(settings.batch.stage_timeout_seconds.is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut settings = Settings::default();
        settings.batch.formats = vec!["vtt".to_string(), "json".to_string()];
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(Some(&path)).unwrap();
        assert_eq!(loaded.batch.formats, vec!["vtt", "json"]);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = PathBuf::from("/nonexistent/samle/config.toml");
        let settings = Settings::load_from(Some(&path)).unwrap();
        assert_eq!(settings.validation.allowed_hosts, vec!["youtube.com", "youtu.be"]);
    }
}
