//! Database models
//!
//! Row types for the Image → Class → Region hierarchy plus the fixed
//! defect taxonomy shared by the extractor and the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed defect taxonomy; mask label values map 1:1 onto these ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DefectCategory {
    #[serde(rename = "PI_Particle")]
    PiParticle,
    #[serde(rename = "PR_Peeling")]
    PrPeeling,
    #[serde(rename = "Copper_Nodule")]
    CopperNodule,
    #[serde(rename = "Env_Particle")]
    EnvParticle,
}

impl DefectCategory {
    pub const ALL: [DefectCategory; 4] = [
        DefectCategory::PiParticle,
        DefectCategory::PrPeeling,
        DefectCategory::CopperNodule,
        DefectCategory::EnvParticle,
    ];

    /// Category id as stored in the database and encoded in masks
    pub fn id(self) -> u8 {
        match self {
            DefectCategory::PiParticle => 1,
            DefectCategory::PrPeeling => 2,
            DefectCategory::CopperNodule => 3,
            DefectCategory::EnvParticle => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DefectCategory::PiParticle => "PI_Particle",
            DefectCategory::PrPeeling => "PR_Peeling",
            DefectCategory::CopperNodule => "Copper_Nodule",
            DefectCategory::EnvParticle => "Env_Particle",
        }
    }

    /// Map a label value; 0 (background) and unknown labels yield `None`
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(DefectCategory::PiParticle),
            2 => Some(DefectCategory::PrPeeling),
            3 => Some(DefectCategory::CopperNodule),
            4 => Some(DefectCategory::EnvParticle),
            _ => None,
        }
    }
}

impl fmt::Display for DefectCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One inspected photograph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ImageRecord {
    pub id: String,
    pub image_height: i64,
    pub image_width: i64,
    pub processing_time_seconds: f64,
    pub timestamp: DateTime<Utc>,
    pub input_image_path: String,
    /// Combined visualization
    pub result_image_1_path: Option<String>,
    /// Classification mask
    pub result_image_2_path: Option<String>,
    /// Overlay visualization
    pub result_image_3_path: Option<String>,
    pub batch_id: Option<String>,
    pub original_filename: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate of all regions of one category within one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClassRecord {
    pub id: String,
    pub image_id: String,
    pub category_id: i64,
    pub category_name: String,
    pub total_regions: i64,
    pub total_area_pixels: i64,
}

/// One connected defect blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RegionRecord {
    pub id: String,
    pub class_id: String,
    pub image_id: String,
    /// 1-based, unique within its class
    pub region_index: i64,
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub bbox_x: i64,
    pub bbox_y: i64,
    pub bbox_width: i64,
    pub bbox_height: i64,
    pub area_pixels: i64,
    pub perimeter: f64,
    pub major_axis: f64,
    pub minor_axis: f64,
    pub circularity: f64,
    pub aspect_ratio: f64,
}
