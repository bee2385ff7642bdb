//! Data models for aoi-agent

pub mod batch;
pub mod inference;

pub use batch::{BatchItemError, BatchItemResult, BatchSummary};
pub use inference::{ArtifactKind, Artifacts, InferenceMetadata, InferenceResult};
