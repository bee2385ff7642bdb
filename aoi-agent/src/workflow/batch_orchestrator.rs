//! Batch orchestration
//!
//! Runs a list of images through [`InspectionPipeline`] with a bounded number
//! of concurrent workers. A failure of one item (including its own deadline
//! expiring) is recorded in the summary and never touches its siblings.
//! The only state shared between workers is the pair of summary counters.

use crate::config::BatchSettings;
use crate::error::PipelineError;
use crate::models::batch::{BatchItemResult, BatchSummary};
use crate::storage::BATCH_SUMMARY_FILE;
use crate::workflow::pipeline::{display_name, ArtifactTarget, InspectionPipeline};
use aoi_common::{time, uuid_utils, Error, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One submitted image
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Name reported in the summary and used for the stored upload
    pub filename: String,
    pub path: PathBuf,
}

impl BatchItem {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            filename: display_name(&path),
            path,
        }
    }
}

/// `<YYYYMMDD_HHMMSS>_<8 hex>`
pub fn new_batch_id() -> String {
    format!(
        "{}_{}",
        time::file_timestamp(&time::local_now()),
        uuid_utils::short_token()
    )
}

pub struct BatchOrchestrator {
    pipeline: Arc<InspectionPipeline>,
    worker_limit: usize,
    item_timeout: Duration,
}

impl BatchOrchestrator {
    pub fn new(pipeline: Arc<InspectionPipeline>, settings: &BatchSettings) -> Self {
        Self {
            pipeline,
            worker_limit: settings.worker_limit.max(1),
            item_timeout: settings.item_timeout,
        }
    }

    pub fn worker_limit(&self) -> usize {
        self.worker_limit
    }

    /// Process every item and write `batch_summary.json` into the batch folder
    ///
    /// Only an empty item list or a failure to write the summary fails the
    /// whole call; item failures end up in [`BatchSummary::results`].
    pub async fn run(&self, items: Vec<BatchItem>) -> Result<BatchSummary> {
        if items.is_empty() {
            return Err(Error::InvalidInput("batch contains no images".into()));
        }

        let started_local = time::local_now();
        let batch_id = new_batch_id();
        let batch_dir = self.pipeline.storage().batch_dir(&batch_id, &started_local);
        let target = ArtifactTarget::Batch {
            batch_id: batch_id.clone(),
            batch_dir: batch_dir.clone(),
        };
        let total_images = items.len();
        let started = Instant::now();

        info!(
            batch_id = %batch_id,
            total_images,
            worker_limit = self.worker_limit,
            "Batch started"
        );

        let processed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let mut results: Vec<BatchItemResult> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                let pipeline = Arc::clone(&self.pipeline);
                let processed = Arc::clone(&processed);
                let failed = Arc::clone(&failed);
                let target = &target;
                let batch_dir = &batch_dir;
                let batch_id = &batch_id;
                let item_timeout = self.item_timeout;

                async move {
                    let file_index = index + 1;
                    let image_id = uuid_utils::generate_id();

                    debug!(
                        batch_id = %batch_id,
                        file_index,
                        file = %item.filename,
                        "Worker starting item"
                    );

                    let outcome = match tokio::time::timeout(
                        item_timeout,
                        pipeline.process_path(&image_id, &item.path, &item.filename, target),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            discard_item(&pipeline, batch_dir, &image_id).await;
                            Err(PipelineError::Deadline(item_timeout))
                        }
                    };

                    match outcome {
                        Ok(done) => {
                            processed.fetch_add(1, Ordering::Relaxed);
                            BatchItemResult::succeeded(
                                file_index,
                                item.filename,
                                image_id,
                                done.total_defects,
                                done.processing_time,
                                done.artifacts.dir,
                            )
                        }
                        Err(e) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            error!(
                                batch_id = %batch_id,
                                file_index,
                                file = %item.filename,
                                stage = %e.stage(),
                                error = %e,
                                "Batch item failed"
                            );
                            BatchItemResult::failed(file_index, item.filename, image_id, &e)
                        }
                    }
                }
            })
            .buffer_unordered(self.worker_limit)
            .collect()
            .await;

        results.sort_by_key(|r| r.file_index);

        let mut summary = BatchSummary {
            batch_id: batch_id.clone(),
            total_images,
            processed: processed.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
            total_processing_time: started.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
            summary_path: None,
            results,
        };
        summary.summary_path = Some(batch_dir.join(BATCH_SUMMARY_FILE));
        self.pipeline
            .storage()
            .save_batch_summary(&batch_dir, &summary)
            .await?;

        info!(
            batch_id = %batch_id,
            processed = summary.processed,
            failed = summary.failed,
            elapsed_secs = summary.total_processing_time,
            "Batch completed"
        );

        Ok(summary)
    }

    /// Bundle a finished batch into a ZIP archive
    pub async fn export(&self, batch_id: &str) -> Result<PathBuf> {
        self.pipeline.storage().build_archive(batch_id).await
    }
}

/// Drop whatever a timed-out item managed to write
///
/// The pipeline future is cancelled at an await point, so the artifacts may
/// exist and the commit may even have landed just before the deadline.
/// The stored upload goes away with the dropped future.
async fn discard_item(pipeline: &InspectionPipeline, batch_dir: &Path, image_id: &str) {
    let item_dir = batch_dir.join(image_id);
    if let Err(e) = pipeline.storage().remove_artifacts(&item_dir).await {
        warn!(image_id, error = %e, "Failed to remove artifacts of timed-out item");
    }
    match crate::db::results::delete_image(pipeline.db(), image_id).await {
        Ok(()) => warn!(image_id, "Removed result committed by timed-out item"),
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(image_id, error = %e, "Failed to remove result of timed-out item"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_id_format() {
        let id = new_batch_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(crate::storage::validate_id(&id).is_ok());
    }

    #[test]
    fn test_item_from_path_uses_file_name() {
        let item = BatchItem::from_path("/tmp/in/panel_01.png");
        assert_eq!(item.filename, "panel_01.png");
    }
}
