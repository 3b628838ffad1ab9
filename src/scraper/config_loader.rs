use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::scraper::{DedupStrategy, ValidationMode};

/// Name of the configuration file looked up in the config directory.
pub const CONFIG_NAME: &str = "image_scraper.toml";

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Paths {
    /// Where stored images go. Relative paths resolve next to the executable.
    pub output_directory: String,
    pub log_directory: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Fetch {
    pub timeout_secs: u64,
    pub concurrency: usize,
    pub retry_attempts: usize,
    pub base_retry_delay_ms: u64,
    pub user_agent: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Cleaning {
    pub dedup_strategy: DedupStrategy,
    pub validation: ValidationMode,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub queries: Vec<String>,
    pub paths: Paths,
    pub fetch: Fetch,
    pub cleaning: Cleaning,
    pub logging: Logging,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            output_directory: "data".to_string(),
            log_directory: "logs".to_string(),
        }
    }
}

impl Default for Fetch {
    fn default() -> Self {
        Self {
            timeout_secs: 45,
            concurrency: 1,
            retry_attempts: 0,
            base_retry_delay_ms: 1000,
            user_agent: format!("image_scraper/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for Cleaning {
    fn default() -> Self {
        Self {
            dedup_strategy: DedupStrategy::Exact,
            validation: ValidationMode::Sweep,
        }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "line".to_string(),
            log_to_file: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            queries: default_queries(),
            paths: Paths::default(),
            fetch: Fetch::default(),
            cleaning: Cleaning::default(),
            logging: Logging::default(),
        }
    }
}

/// The query set of the reference bathroom-sign run.
pub fn default_queries() -> Vec<String> {
    [
        "bathroom sign",
        "male bathroom sign",
        "men bathroom sign",
        "female bathroom sign",
        "women bathroom sign",
        "unisex bathroom sign",
        "family bathroom sign",
        "ada bathroom sign",
        "accessible bathroom sign",
        "gender neutral bathroom sign",
        "gender inclusive bathroom sign",
        "all gender bathroom sign",
    ]
    .iter()
    .map(|q| q.to_string())
    .collect()
}

impl AppConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.timeout_secs)
    }

    /// Rejects values that would stall or break the pipeline.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.fetch.concurrency == 0 {
            return Err(ConfigError::Invalid("fetch.concurrency must be at least 1".to_string()));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(ConfigError::Invalid("fetch.timeout_secs must be at least 1".to_string()));
        }
        if self.paths.output_directory.trim().is_empty() {
            return Err(ConfigError::Invalid("paths.output_directory is empty".to_string()));
        }
        Ok(())
    }

    /// Resolves the output directory, anchoring relative paths at the executable's directory.
    pub fn output_directory(&self) -> ConfigResult<PathBuf> {
        resolve_path(&self.paths.output_directory)
    }

    pub fn log_directory(&self) -> ConfigResult<PathBuf> {
        resolve_path(&self.paths.log_directory)
    }
}

fn resolve_path(raw: &str) -> ConfigResult<PathBuf> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return Ok(path);
    }

    let exe_path = std::env::current_exe()?;
    let exe_dir = exe_path
        .parent()
        .ok_or_else(|| ConfigError::NotFound("executable directory".to_string()))?;
    Ok(exe_dir.join(path))
}

/// Loads and persists [`AppConfig`] from a directory.
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_NAME)
    }

    /// Reads the config file. A missing file yields defaults; a file that fails to parse is
    /// backed up and replaced with defaults.
    pub fn load(&self) -> ConfigResult<AppConfig> {
        let config_path = self.config_path();

        if !config_path.exists() {
            info!("Config file not found, using defaults: {}", config_path.display());
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                error!("Failed to parse {}: {}", CONFIG_NAME, e);
                info!("Backing up old config and creating new one with default values");

                if let Err(backup_err) = fs::rename(&config_path, config_path.with_extension("toml.backup")) {
                    warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = AppConfig::default();
                if let Err(write_err) = self.save(&default_config) {
                    error!("Failed to write new config file: {}", write_err);
                }

                Ok(default_config)
            }
        }
    }

    pub fn save(&self, config: &AppConfig) -> ConfigResult<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir)?;
        }
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(self.config_path(), toml_string)?;
        Ok(())
    }

    /// Writes a default config file unless one already exists. Returns whether a file was written.
    pub fn create_default_config(&self) -> ConfigResult<bool> {
        if self.config_path().exists() {
            return Ok(false);
        }
        self.save(&AppConfig::default())?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_reference_run() {
        let config = AppConfig::default();
        assert_eq!(config.queries.len(), 12);
        assert_eq!(config.queries[0], "bathroom sign");
        assert_eq!(config.fetch.timeout_secs, 45);
        assert_eq!(config.fetch.concurrency, 1);
        assert_eq!(config.fetch.retry_attempts, 0);
        assert_eq!(config.paths.output_directory, "data");
        assert_eq!(config.cleaning.validation, ValidationMode::Sweep);
        assert_eq!(config.cleaning.dedup_strategy, DedupStrategy::Exact);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path());
        assert_eq!(manager.load().unwrap(), AppConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_NAME),
            "queries = [\"stop sign\"]\n\n[fetch]\nconcurrency = 8\n\n[cleaning]\ndedup_strategy = \"blake3\"\n",
        )
        .unwrap();

        let config = ConfigManager::new(dir.path()).load().unwrap();
        assert_eq!(config.queries, vec!["stop sign".to_string()]);
        assert_eq!(config.fetch.concurrency, 8);
        assert_eq!(config.fetch.timeout_secs, 45);
        assert_eq!(config.cleaning.dedup_strategy, DedupStrategy::Blake3);
        assert_eq!(config.cleaning.validation, ValidationMode::Sweep);
    }

    #[test]
    fn test_corrupt_file_is_backed_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_NAME);
        fs::write(&path, "queries = [unterminated").unwrap();

        let manager = ConfigManager::new(dir.path());
        assert_eq!(manager.load().unwrap(), AppConfig::default());
        assert!(path.with_extension("toml.backup").exists());
        assert!(path.exists());
    }

    #[test]
    fn test_create_default_config_once() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path());
        assert!(manager.create_default_config().unwrap());
        assert!(!manager.create_default_config().unwrap());
        assert_eq!(manager.load().unwrap(), AppConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.fetch.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.fetch.timeout_secs = 0;
        assert!(config.validate().is_err());

        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_absolute_output_directory_kept() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.paths.output_directory = dir.path().to_string_lossy().to_string();
        assert_eq!(config.output_directory().unwrap(), dir.path());
    }
}
