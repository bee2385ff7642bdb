//! Single-image inspection pipeline
//!
//! Runs one image through every stage and tags failures with the stage they
//! came from:
//!
//! 1. **validation**: name, extension, size, magic bytes, decodable dimensions;
//!    then the upload is stored
//! 2. **inference**: external service call (retried inside the client)
//! 3. **extraction**: mask decoding and region metrics
//! 4. **storage**: result artifacts written to disk
//! 5. **persistence**: Image/Class/Region rows in one transaction
//!
//! A database connection is only taken for step 5, never while the inference
//! call is in flight. If persistence fails, the artifacts written in step 4
//! are removed again. The stored upload only survives a successful run,
//! including when the caller drops the future on a deadline.

use crate::config::ExtractionSettings;
use crate::db::results::{commit_result, NewImage, ResultGraph};
use crate::error::{ExtractionError, PipelineError};
use crate::models::inference::InferenceResult;
use crate::services::inference_client::InferenceBackend;
use crate::services::mask_decoder::{decode_mask, MaskPalette};
use crate::services::region_extractor::{ClassRegions, ExtractionOutput, RegionExtractor};
use crate::storage::{SavedArtifacts, StorageManager};
use aoi_common::{uuid_utils, Error};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where an item's artifacts go
#[derive(Debug, Clone)]
pub enum ArtifactTarget {
    /// `results/<date>/<imageId>/`
    Single,
    /// `<batch_dir>/<imageId>/`
    Batch { batch_id: String, batch_dir: PathBuf },
}

impl ArtifactTarget {
    fn batch_id(&self) -> Option<String> {
        match self {
            ArtifactTarget::Single => None,
            ArtifactTarget::Batch { batch_id, .. } => Some(batch_id.clone()),
        }
    }
}

/// Successful pipeline outcome
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedImage {
    pub image_id: String,
    pub original_filename: String,
    pub upload_path: PathBuf,
    pub image_width: u32,
    pub image_height: u32,
    /// Seconds; service-reported when available, measured otherwise
    pub processing_time: f64,
    pub timestamp: DateTime<Utc>,
    pub total_defects: u64,
    pub artifacts: SavedArtifacts,
    pub classes: Vec<ClassRegions>,
}

/// Upload → inference → extraction → storage → persistence
pub struct InspectionPipeline {
    db: SqlitePool,
    backend: Arc<dyn InferenceBackend>,
    storage: StorageManager,
    extractor: RegionExtractor,
    palette: MaskPalette,
}

impl InspectionPipeline {
    pub fn new(
        db: SqlitePool,
        backend: Arc<dyn InferenceBackend>,
        storage: StorageManager,
        extraction: &ExtractionSettings,
    ) -> Self {
        Self {
            db,
            backend,
            storage,
            extractor: RegionExtractor::new(extraction.min_region_area),
            palette: extraction.palette.clone(),
        }
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// Process one local file as a standalone (non-batch) item
    pub async fn process_file(&self, path: &Path) -> Result<ProcessedImage, PipelineError> {
        let image_id = uuid_utils::generate_id();
        let name = display_name(path);
        self.process_path(&image_id, path, &name, &ArtifactTarget::Single)
            .await
    }

    /// Read `path` and run it through the pipeline under a pre-assigned id
    pub async fn process_path(
        &self,
        image_id: &str,
        path: &Path,
        original_name: &str,
        target: &ArtifactTarget,
    ) -> Result<ProcessedImage, PipelineError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            PipelineError::Validation(format!("cannot read {}: {}", path.display(), e))
        })?;
        self.process_upload(image_id, &bytes, original_name, target)
            .await
    }

    /// Run uploaded bytes through every stage
    pub async fn process_upload(
        &self,
        image_id: &str,
        bytes: &[u8],
        original_name: &str,
        target: &ArtifactTarget,
    ) -> Result<ProcessedImage, PipelineError> {
        let started = Instant::now();
        let timestamp = Utc::now();

        // Validation
        self.storage
            .validate_upload(bytes, original_name)
            .map_err(stage_error_for_upload)?;
        let (image_width, image_height) = image_dimensions(bytes)?;
        let upload = StoredUpload::new(
            self.storage
                .save_upload(bytes, original_name)
                .await
                .map_err(stage_error_for_upload)?,
        );

        debug!(
            image_id,
            upload = %upload.path().display(),
            image_width,
            image_height,
            "Upload accepted"
        );

        // Inference
        let InferenceResult {
            metadata,
            artifacts,
        } = self.backend.infer(upload.path()).await?;

        // Extraction
        let mask_bytes = artifacts.mask.clone().ok_or(ExtractionError::MissingMask)?;
        let output = self.extract(mask_bytes, image_width, image_height).await?;

        // Storage
        let saved = match target {
            ArtifactTarget::Single => self.storage.save_result_artifacts(image_id, &artifacts).await,
            ArtifactTarget::Batch { batch_dir, .. } => {
                self.storage
                    .save_batch_artifacts(batch_dir, image_id, &artifacts)
                    .await
            }
        }
        .map_err(PipelineError::Storage)?;

        // Persistence
        let processing_time = metadata
            .processing_time
            .unwrap_or_else(|| started.elapsed().as_secs_f64());
        let new_image = NewImage {
            image_height,
            image_width,
            processing_time_seconds: processing_time,
            timestamp,
            input_image_path: upload.path().to_string_lossy().into_owned(),
            combined_path: path_string(saved.combined.as_deref()),
            mask_path: path_string(saved.mask.as_deref()),
            overlay_path: path_string(saved.overlay.as_deref()),
            batch_id: target.batch_id(),
            original_filename: Some(original_name.to_string()),
        };
        let graph = ResultGraph::from_extraction(image_id, new_image, &output);

        if let Err(e) = commit_result(&self.db, &graph).await {
            if let Err(cleanup_err) = self.storage.remove_artifacts(&saved.dir).await {
                warn!(
                    image_id,
                    error = %cleanup_err,
                    "Failed to remove artifacts after persistence failure"
                );
            }
            return Err(PipelineError::Persistence(e));
        }

        let upload_path = upload.keep();
        let total_defects = output.total_regions();
        info!(
            image_id,
            file = original_name,
            total_defects,
            processing_time,
            "Image processed"
        );

        Ok(ProcessedImage {
            image_id: image_id.to_string(),
            original_filename: original_name.to_string(),
            upload_path,
            image_width,
            image_height,
            processing_time,
            timestamp,
            total_defects,
            artifacts: saved,
            classes: output.classes,
        })
    }

    /// Decode and extract off the async executor
    async fn extract(
        &self,
        mask_bytes: Vec<u8>,
        image_width: u32,
        image_height: u32,
    ) -> Result<ExtractionOutput, ExtractionError> {
        let palette = self.palette.clone();
        let extractor = self.extractor.clone();

        tokio::task::spawn_blocking(move || -> Result<ExtractionOutput, ExtractionError> {
            let mask = decode_mask(&mask_bytes, &palette)?;
            if (mask.width(), mask.height()) != (image_width, image_height) {
                warn!(
                    mask_width = mask.width(),
                    mask_height = mask.height(),
                    image_width,
                    image_height,
                    "Mask size differs from input image; metrics use mask coordinates"
                );
            }
            Ok(extractor.extract(&mask))
        })
        .await
        .map_err(|e| ExtractionError::Decode(format!("extraction task failed: {}", e)))?
    }
}

/// Stored upload that is deleted on drop unless the item completes
struct StoredUpload {
    path: Option<PathBuf>,
}

impl StoredUpload {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    fn keep(mut self) -> PathBuf {
        self.path.take().unwrap_or_default()
    }
}

impl Drop for StoredUpload {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(upload = %path.display(), "Removed upload of failed item"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(upload = %path.display(), error = %e, "Failed to remove upload"),
        }
    }
}

/// Upload rejections are validation failures; disk trouble is storage
fn stage_error_for_upload(err: Error) -> PipelineError {
    match err {
        Error::Validation(msg) | Error::InvalidInput(msg) | Error::Security(msg) => {
            PipelineError::Validation(msg)
        }
        other => PipelineError::Storage(other),
    }
}

/// Dimensions from the image header; undecodable uploads are rejected
fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32), PipelineError> {
    let (width, height) = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PipelineError::Validation(format!("unreadable image: {}", e)))?
        .into_dimensions()
        .map_err(|e| PipelineError::Validation(format!("undecodable image: {}", e)))?;

    if width == 0 || height == 0 {
        return Err(PipelineError::Validation("image has zero size".into()));
    }
    Ok((width, height))
}

fn path_string(path: Option<&Path>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

/// File name component used as the original upload name
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
