//! aoi-agent library interface
//!
//! Exposes the inspection components for the binary and for integration
//! testing.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;
pub mod workflow;

pub use crate::config::AgentConfig;
pub use crate::error::{ExtractionError, InferenceError, PipelineError, Stage};

use crate::services::inference_client::{InferenceBackend, InferenceClient};
use crate::storage::{CleanupStats, StorageManager};
use crate::workflow::{BatchOrchestrator, InspectionPipeline};
use aoi_common::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a retention run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub folders_removed: u64,
    pub files_removed: u64,
    pub images_removed: u64,
}

/// Wired-up components shared by every command
pub struct AgentContext {
    pub config: AgentConfig,
    pub db: SqlitePool,
    pub pipeline: Arc<InspectionPipeline>,
    pub orchestrator: BatchOrchestrator,
}

impl AgentContext {
    /// Open the database, create the storage roots and build the HTTP client
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let client = InferenceClient::new(&config.inference)
            .map_err(|e| Error::Config(format!("inference client: {}", e)))?;
        Self::with_backend(config, Arc::new(client)).await
    }

    /// Same as [`AgentContext::new`] with a caller-supplied inference backend
    pub async fn with_backend(
        config: AgentConfig,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self> {
        let db = aoi_common::db::init_database(&config.database).await?;
        info!(path = %config.database.path.display(), "Database ready");

        let storage = StorageManager::new(&config.storage);
        storage.ensure_directories().await?;

        let pipeline = Arc::new(InspectionPipeline::new(
            db.clone(),
            backend,
            storage,
            &config.extraction,
        ));
        let orchestrator = BatchOrchestrator::new(Arc::clone(&pipeline), &config.batch);

        Ok(Self {
            config,
            db,
            pipeline,
            orchestrator,
        })
    }

    pub fn storage(&self) -> &StorageManager {
        self.pipeline.storage()
    }

    /// Delete an image's rows (cascading to classes and regions) and its artifacts
    pub async fn delete_image(&self, image_id: &str) -> Result<()> {
        let hierarchy = db::get_image(&self.db, image_id).await?;
        let dirs: BTreeSet<PathBuf> = [
            &hierarchy.image.result_image_1_path,
            &hierarchy.image.result_image_2_path,
            &hierarchy.image.result_image_3_path,
        ]
        .into_iter()
        .flatten()
        .filter_map(|p| PathBuf::from(p).parent().map(|d| d.to_path_buf()))
        .collect();

        db::delete_image(&self.db, image_id).await?;

        for dir in dirs {
            if let Err(e) = self.storage().remove_artifacts(&dir).await {
                warn!(image_id, dir = %dir.display(), error = %e, "Failed to remove artifacts");
            }
        }
        Ok(())
    }

    /// Remove date folders and image rows older than `days`
    pub async fn cleanup(&self, days: u32) -> Result<RetentionReport> {
        let CleanupStats {
            folders_removed,
            files_removed,
        } = self.storage().cleanup_older_than(days).await?;
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let images_removed = db::delete_images_older_than(&self.db, cutoff).await?;

        info!(days, folders_removed, files_removed, images_removed, "Retention cleanup finished");
        Ok(RetentionReport {
            folders_removed,
            files_removed,
            images_removed,
        })
    }
}
