//! Batch results and summary

use crate::error::{PipelineError, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Why a batch item failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemError {
    pub stage: Stage,
    pub message: String,
    pub recoverable: bool,
}

impl From<&PipelineError> for BatchItemError {
    fn from(err: &PipelineError) -> Self {
        Self {
            stage: err.stage(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        }
    }
}

/// Outcome of one batch item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// 1-based position in the submitted list
    pub file_index: usize,
    pub filename: String,
    pub success: bool,
    /// Assigned before processing; only persisted when `success`
    pub image_id: String,
    pub total_defects: Option<u64>,
    /// Seconds
    pub processing_time: Option<f64>,
    pub output_dir: Option<PathBuf>,
    pub error: Option<BatchItemError>,
}

impl BatchItemResult {
    pub fn succeeded(
        file_index: usize,
        filename: String,
        image_id: String,
        total_defects: u64,
        processing_time: f64,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            file_index,
            filename,
            success: true,
            image_id,
            total_defects: Some(total_defects),
            processing_time: Some(processing_time),
            output_dir: Some(output_dir),
            error: None,
        }
    }

    pub fn failed(file_index: usize, filename: String, image_id: String, err: &PipelineError) -> Self {
        Self {
            file_index,
            filename,
            success: false,
            image_id,
            total_defects: None,
            processing_time: None,
            output_dir: None,
            error: Some(BatchItemError::from(err)),
        }
    }
}

/// Batch summary, persisted as `batch_summary.json` next to the batch artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total_images: usize,
    pub processed: usize,
    pub failed: usize,
    /// Wall-clock seconds for the whole batch
    pub total_processing_time: f64,
    pub timestamp: DateTime<Utc>,
    pub summary_path: Option<PathBuf>,
    /// In submission order
    pub results: Vec<BatchItemResult>,
}

impl BatchSummary {
    pub fn successes(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.results.iter().filter(|r| !r.success)
    }
}
