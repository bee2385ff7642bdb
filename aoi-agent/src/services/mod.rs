//! Service modules for the inspection pipeline
//!
//! - `image_scanner`: batch input discovery
//! - `inference_client`: HTTP client for the external segmentation service
//! - `mask_decoder`: mask image → label grid
//! - `region_extractor`: label grid → per-category defect regions

pub mod image_scanner;
pub mod inference_client;
pub mod mask_decoder;
pub mod region_extractor;

pub use image_scanner::ImageScanner;
pub use inference_client::{InferenceBackend, InferenceClient};
pub use mask_decoder::{decode_mask, LabelMask, MaskPalette};
pub use region_extractor::{ClassRegions, ExtractionOutput, RegionExtractor, RegionMetrics};
