//! Image processing workflows
//!
//! - [`pipeline`]: one image through validation, inference, extraction,
//!   storage and persistence
//! - [`batch_orchestrator`]: many images with bounded concurrency and
//!   per-item failure isolation

pub mod batch_orchestrator;
pub mod pipeline;

pub use batch_orchestrator::{new_batch_id, BatchItem, BatchOrchestrator};
pub use pipeline::{display_name, ArtifactTarget, InspectionPipeline, ProcessedImage};
