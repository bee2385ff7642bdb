//! Error types for aoi-agent
//!
//! Each layer has its own enum; `PipelineError` tags a single-item failure with
//! the stage it came from so callers can tell recoverable from fatal conditions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the external inference service
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Input image missing before any network call
    #[error("Image not found: {}", .0.display())]
    ImageNotFound(PathBuf),

    /// Connection refused/reset or other transport failure (retryable)
    #[error("Connection to inference service failed: {0}")]
    Connect(String),

    /// Request exceeded the configured timeout (retryable)
    #[error("Inference request timed out after {0:?}")]
    Timeout(Duration),

    /// 4xx and other non-success statuses; surfaced without retry
    #[error("Inference service rejected request (HTTP {status}): {message}")]
    ClientRequest { status: u16, message: String },

    /// 5xx (retryable until attempts are exhausted)
    #[error("Inference service error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// Bad content type, empty body or unparsable metadata
    #[error("Malformed inference response: {0}")]
    MalformedResponse(String),

    #[error("Inference failed after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<InferenceError>,
    },

    /// Request could not be constructed (client setup, invalid MIME)
    #[error("Failed to build inference request: {0}")]
    Request(String),
}

impl InferenceError {
    /// Transient transport failures and server errors are retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::Connect(_) | InferenceError::Timeout(_) | InferenceError::Server { .. }
        )
    }
}

/// Failures turning a returned mask into regions
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Inference response carried no classification mask")]
    MissingMask,

    #[error("Failed to decode mask image: {0}")]
    Decode(String),

    #[error("Mask has no pixels")]
    EmptyMask,

    #[error("Mask buffer length {actual} does not match {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        actual: usize,
    },
}

/// Pipeline stage a single-item failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validation,
    Inference,
    Extraction,
    Storage,
    Persistence,
    Deadline,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::Inference => "inference",
            Stage::Extraction => "extraction",
            Stage::Storage => "storage",
            Stage::Persistence => "persistence",
            Stage::Deadline => "deadline",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-item pipeline failure, tagged with its stage
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("storage failed: {0}")]
    Storage(aoi_common::Error),

    #[error("persistence failed: {0}")]
    Persistence(aoi_common::Error),

    #[error("item exceeded its deadline of {0:?}")]
    Deadline(Duration),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Validation(_) => Stage::Validation,
            PipelineError::Inference(_) => Stage::Inference,
            PipelineError::Extraction(_) => Stage::Extraction,
            PipelineError::Storage(_) => Stage::Storage,
            PipelineError::Persistence(_) => Stage::Persistence,
            PipelineError::Deadline(_) => Stage::Deadline,
        }
    }

    /// Whether resubmitting the same input later could succeed
    ///
    /// Bad input, rejected requests, malformed responses and undecodable
    /// masks will fail again; transport, service, disk and database
    /// conditions may clear up.
    pub fn is_recoverable(&self) -> bool {
        match self {
            PipelineError::Validation(_) | PipelineError::Extraction(_) => false,
            PipelineError::Inference(e) => match e {
                InferenceError::RetryExhausted { .. } => true,
                other => other.is_retryable(),
            },
            PipelineError::Storage(e) => !matches!(
                e,
                aoi_common::Error::Validation(_)
                    | aoi_common::Error::Security(_)
                    | aoi_common::Error::InvalidInput(_)
            ),
            PipelineError::Persistence(e) => matches!(e, aoi_common::Error::Database(_)),
            PipelineError::Deadline(_) => true,
        }
    }
}
