//! Configuration loading
//!
//! Bootstrap configuration comes from a TOML file with built-in defaults for
//! every field. Resolution priority for the file location and the overridable
//! fields:
//! 1. Command-line argument (highest priority, applied by the binary)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing config file is not an error: a warning is logged and defaults are used.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the TOML config file
pub const ENV_CONFIG_PATH: &str = "AOI_CONFIG";
/// Environment variable overriding `database.path`
pub const ENV_DATABASE_PATH: &str = "AOI_DATABASE_PATH";
/// Environment variable overriding `inference.base_url`
pub const ENV_INFERENCE_URL: &str = "AOI_INFERENCE_URL";
/// Environment variable overriding `storage.upload_dir`
pub const ENV_UPLOAD_DIR: &str = "AOI_UPLOAD_DIR";
/// Environment variable overriding `storage.result_dir`
pub const ENV_RESULT_DIR: &str = "AOI_RESULT_DIR";
/// Environment variable overriding `logging.level`
pub const ENV_LOG_LEVEL: &str = "AOI_LOG_LEVEL";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub database: DatabaseConfig,
    pub inference: InferenceConfig,
    pub storage: StorageConfig,
    pub batch: BatchConfig,
    pub extraction: ExtractionConfig,
    pub logging: LoggingConfig,
}

/// `[database]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
    /// Connection pool size
    pub max_connections: u32,
    /// SQLite busy timeout
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/aoi.db"),
            max_connections: 5,
            busy_timeout_ms: 5000,
        }
    }
}

/// `[inference]` section: external segmentation service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Service base URL; requests go to `{base_url}/upload`
    pub base_url: String,
    /// Per-request timeout (inference is slow, minutes-scale)
    pub timeout_secs: u64,
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Delay before the Nth retry is `retry_delays_ms[N-1]`
    pub retry_delays_ms: Vec<u64>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            timeout_secs: 300,
            max_attempts: 3,
            retry_delays_ms: vec![1000, 2000, 4000],
        }
    }
}

/// `[storage]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub result_dir: PathBuf,
    pub max_file_size_mb: u64,
    /// Lowercase extensions without the leading dot
    pub allowed_extensions: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("data/uploads"),
            result_dir: PathBuf::from("data/results"),
            max_file_size_mb: 50,
            allowed_extensions: ["png", "jpg", "jpeg", "bmp", "tiff", "tif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl StorageConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// `[batch]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Concurrent items per batch
    pub worker_limit: usize,
    /// Deadline for a single item (upload through persistence)
    pub item_timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            worker_limit: 2,
            item_timeout_secs: 900,
        }
    }
}

/// `[extraction]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Regions smaller than this many pixels are discarded
    pub min_region_area: Option<u64>,
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Apply environment variable overrides (priority above the TOML file)
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = non_empty_env(ENV_DATABASE_PATH) {
            self.database.path = PathBuf::from(path);
        }
        if let Some(url) = non_empty_env(ENV_INFERENCE_URL) {
            self.inference.base_url = url;
        }
        if let Some(dir) = non_empty_env(ENV_UPLOAD_DIR) {
            self.storage.upload_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_env(ENV_RESULT_DIR) {
            self.storage.result_dir = PathBuf::from(dir);
        }
        if let Some(level) = non_empty_env(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Default config file location (`<config dir>/aoi/aoi-agent.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("aoi").join("aoi-agent.toml"))
}

/// Resolve which config file to read
///
/// Command-line argument, then environment variable, then the platform default
/// if that file exists. Returns `None` when no file applies.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Some(path) = non_empty_env(env_var_name) {
        return Some(PathBuf::from(path));
    }

    default_config_path().filter(|p| p.exists())
}

/// Load TOML config, degrading to defaults when the file is missing
///
/// A file that exists but cannot be read or parsed is a configuration error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    let config = TomlConfig::from_toml_str(&content)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Full resolution: locate file, load it (or defaults), apply environment overrides
pub fn load_config(cli_path: Option<&Path>) -> Result<TomlConfig> {
    let mut config = match resolve_config_path(cli_path, ENV_CONFIG_PATH) {
        Some(path) => load_toml_config(&path)?,
        None => {
            info!("No config file specified, using built-in defaults");
            TomlConfig::default()
        }
    };
    config.apply_env_overrides();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_service() {
        let config = TomlConfig::default();
        assert_eq!(config.inference.timeout_secs, 300);
        assert_eq!(config.inference.max_attempts, 3);
        assert_eq!(config.inference.retry_delays_ms, vec![1000, 2000, 4000]);
        assert_eq!(config.storage.max_file_size_bytes(), 50 * 1024 * 1024);
        assert!(config.extraction.min_region_area.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TomlConfig::from_toml_str(
            r#"
            [inference]
            base_url = "http://inference.local:9000"

            [batch]
            worker_limit = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.inference.base_url, "http://inference.local:9000");
        assert_eq!(config.inference.timeout_secs, 300);
        assert_eq!(config.batch.worker_limit, 4);
        assert_eq!(config.batch.item_timeout_secs, 900);
        assert_eq!(config.database, DatabaseConfig::default());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = TomlConfig::from_toml_str("[inference\nbase_url = ");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
