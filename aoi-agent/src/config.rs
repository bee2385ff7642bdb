//! Resolved agent configuration
//!
//! `AgentConfig` is built once from the loaded `TomlConfig` (after environment
//! and command-line overrides) and passed by reference to every component.
//! Nothing reads configuration from global state after startup.

use crate::services::mask_decoder::MaskPalette;
use crate::utils::RetryPolicy;
use aoi_common::config::{DatabaseConfig, TomlConfig};
use aoi_common::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Immutable per-process configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub database: DatabaseConfig,
    pub inference: InferenceSettings,
    pub storage: StorageSettings,
    pub batch: BatchSettings,
    pub extraction: ExtractionSettings,
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    /// Base URL without trailing slash
    pub base_url: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl InferenceSettings {
    pub fn upload_endpoint(&self) -> String {
        format!("{}/upload", self.base_url)
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub upload_dir: PathBuf,
    pub result_dir: PathBuf,
    pub max_file_size: u64,
    /// Lowercase, no leading dot
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub worker_limit: usize,
    pub item_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionSettings {
    pub min_region_area: Option<u64>,
    pub palette: MaskPalette,
}

impl AgentConfig {
    /// Validate and convert the loaded TOML configuration
    pub fn from_toml(toml: &TomlConfig) -> Result<Self> {
        let base_url = toml.inference.base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "inference.base_url must be an http(s) URL, got '{}'",
                toml.inference.base_url
            )));
        }
        if toml.inference.timeout_secs == 0 {
            return Err(Error::Config("inference.timeout_secs must be > 0".into()));
        }
        if toml.inference.max_attempts == 0 {
            return Err(Error::Config("inference.max_attempts must be > 0".into()));
        }
        if toml.inference.retry_delays_ms.is_empty() {
            return Err(Error::Config(
                "inference.retry_delays_ms must list at least one delay".into(),
            ));
        }
        if toml.batch.worker_limit == 0 {
            return Err(Error::Config("batch.worker_limit must be > 0".into()));
        }
        if toml.batch.item_timeout_secs == 0 {
            return Err(Error::Config("batch.item_timeout_secs must be > 0".into()));
        }
        if toml.storage.max_file_size_mb == 0 {
            return Err(Error::Config("storage.max_file_size_mb must be > 0".into()));
        }

        let allowed_extensions: Vec<String> = toml
            .storage
            .allowed_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        if allowed_extensions.is_empty() {
            return Err(Error::Config(
                "storage.allowed_extensions must not be empty".into(),
            ));
        }

        if toml.batch.worker_limit >= toml.database.max_connections as usize {
            warn!(
                worker_limit = toml.batch.worker_limit,
                pool_size = toml.database.max_connections,
                "Batch worker limit is not smaller than the database pool; persistence may starve"
            );
        }

        let delays = toml
            .inference
            .retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect();

        Ok(Self {
            database: toml.database.clone(),
            inference: InferenceSettings {
                base_url,
                timeout: Duration::from_secs(toml.inference.timeout_secs),
                retry: RetryPolicy::new(toml.inference.max_attempts, delays),
            },
            storage: StorageSettings {
                upload_dir: toml.storage.upload_dir.clone(),
                result_dir: toml.storage.result_dir.clone(),
                max_file_size: toml.storage.max_file_size_bytes(),
                allowed_extensions,
            },
            batch: BatchSettings {
                worker_limit: toml.batch.worker_limit,
                item_timeout: Duration::from_secs(toml.batch.item_timeout_secs),
            },
            extraction: ExtractionSettings {
                min_region_area: toml.extraction.min_region_area.filter(|a| *a > 0),
                palette: MaskPalette::default(),
            },
        })
    }
}
