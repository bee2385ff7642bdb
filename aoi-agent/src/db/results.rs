//! Result store: Image → Class → Region hierarchy
//!
//! A hierarchy is written in exactly one transaction. All ids are assigned
//! when the [`ResultGraph`] is built, before the transaction begins, and the
//! graph's structure is checked up front. Constraint failures inside the
//! transaction (foreign keys, CHECKs, uniqueness) roll the whole image back.

use crate::services::region_extractor::ExtractionOutput;
use aoi_common::db::models::{ClassRecord, ImageRecord, RegionRecord};
use aoi_common::{uuid_utils, Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Image attributes known before extraction
#[derive(Debug, Clone)]
pub struct NewImage {
    pub image_height: u32,
    pub image_width: u32,
    pub processing_time_seconds: f64,
    pub timestamp: DateTime<Utc>,
    pub input_image_path: String,
    pub combined_path: Option<String>,
    pub mask_path: Option<String>,
    pub overlay_path: Option<String>,
    pub batch_id: Option<String>,
    pub original_filename: Option<String>,
}

/// Complete hierarchy for one image, ready to commit
#[derive(Debug, Clone, PartialEq)]
pub struct ResultGraph {
    pub image: ImageRecord,
    pub classes: Vec<ClassRecord>,
    pub regions: Vec<RegionRecord>,
}

impl ResultGraph {
    /// Build rows from extraction output, assigning fresh ids
    pub fn from_extraction(image_id: &str, image: NewImage, output: &ExtractionOutput) -> Self {
        let image_record = ImageRecord {
            id: image_id.to_string(),
            image_height: image.image_height as i64,
            image_width: image.image_width as i64,
            processing_time_seconds: image.processing_time_seconds,
            timestamp: image.timestamp,
            input_image_path: image.input_image_path,
            result_image_1_path: image.combined_path,
            result_image_2_path: image.mask_path,
            result_image_3_path: image.overlay_path,
            batch_id: image.batch_id,
            original_filename: image.original_filename,
            created_at: Utc::now(),
        };

        let mut classes = Vec::with_capacity(output.classes.len());
        let mut regions = Vec::new();

        for class in &output.classes {
            let class_id = uuid_utils::generate_id();
            classes.push(ClassRecord {
                id: class_id.clone(),
                image_id: image_id.to_string(),
                category_id: class.category.id() as i64,
                category_name: class.category.name().to_string(),
                total_regions: class.total_regions as i64,
                total_area_pixels: class.total_area_pixels as i64,
            });

            regions.extend(class.regions.iter().map(|r| RegionRecord {
                id: uuid_utils::generate_id(),
                class_id: class_id.clone(),
                image_id: image_id.to_string(),
                region_index: r.region_index as i64,
                centroid_x: r.centroid_x,
                centroid_y: r.centroid_y,
                bbox_x: r.bbox_x as i64,
                bbox_y: r.bbox_y as i64,
                bbox_width: r.bbox_width as i64,
                bbox_height: r.bbox_height as i64,
                area_pixels: r.area_pixels as i64,
                perimeter: r.perimeter,
                major_axis: r.major_axis,
                minor_axis: r.minor_axis,
                circularity: r.circularity,
                aspect_ratio: r.aspect_ratio,
            }));
        }

        Self {
            image: image_record,
            classes,
            regions,
        }
    }

    /// Structural checks: ownership links, unique indices, class totals
    pub fn validate(&self) -> Result<()> {
        let image_id = &self.image.id;
        if image_id.is_empty() {
            return Err(Error::Validation("image id is empty".into()));
        }
        if self.image.image_height <= 0 || self.image.image_width <= 0 {
            return Err(Error::Validation(format!(
                "image dimensions must be positive, got {}x{}",
                self.image.image_width, self.image.image_height
            )));
        }
        if !(self.image.processing_time_seconds >= 0.0) {
            return Err(Error::Validation("processing time must be >= 0".into()));
        }

        let mut per_class: HashMap<&str, (i64, i64)> = HashMap::new();
        let mut categories = HashSet::new();
        for class in &self.classes {
            if &class.image_id != image_id {
                return Err(Error::Validation(format!(
                    "class {} belongs to image {}, not {}",
                    class.id, class.image_id, image_id
                )));
            }
            if !categories.insert(class.category_id) {
                return Err(Error::Validation(format!(
                    "duplicate class for category {}",
                    class.category_id
                )));
            }
            per_class.insert(class.id.as_str(), (0, 0));
        }

        let mut indices = HashSet::new();
        for region in &self.regions {
            if &region.image_id != image_id {
                return Err(Error::Validation(format!(
                    "region {} belongs to image {}, not {}",
                    region.id, region.image_id, image_id
                )));
            }
            let Some(totals) = per_class.get_mut(region.class_id.as_str()) else {
                return Err(Error::Validation(format!(
                    "region {} references unknown class {}",
                    region.id, region.class_id
                )));
            };
            if !indices.insert((region.class_id.as_str(), region.region_index)) {
                return Err(Error::Validation(format!(
                    "duplicate region index {} in class {}",
                    region.region_index, region.class_id
                )));
            }
            totals.0 += 1;
            totals.1 += region.area_pixels;
        }

        for class in &self.classes {
            let (count, area) = per_class
                .get(class.id.as_str())
                .copied()
                .unwrap_or((0, 0));
            if count != class.total_regions || area != class.total_area_pixels {
                return Err(Error::Validation(format!(
                    "class {} totals ({} regions, {} px) disagree with its regions ({}, {})",
                    class.category_name, class.total_regions, class.total_area_pixels, count, area
                )));
            }
        }

        Ok(())
    }
}

/// Class row with its regions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassWithRegions {
    #[serde(flatten)]
    pub class: ClassRecord,
    pub regions: Vec<RegionRecord>,
}

/// Full hierarchy as read back from the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageHierarchy {
    pub image: ImageRecord,
    pub classes: Vec<ClassWithRegions>,
}

impl ImageHierarchy {
    pub fn total_regions(&self) -> usize {
        self.classes.iter().map(|c| c.regions.len()).sum()
    }
}

/// Write an image and its full subtree atomically; returns the image id
pub async fn commit_result(pool: &SqlitePool, graph: &ResultGraph) -> Result<String> {
    graph.validate()?;

    let mut tx = pool.begin().await?;
    insert_image(&mut tx, &graph.image).await?;
    for class in &graph.classes {
        insert_class(&mut tx, class).await?;
    }
    for region in &graph.regions {
        insert_region(&mut tx, region).await?;
    }
    tx.commit().await?;

    info!(
        image_id = %graph.image.id,
        classes = graph.classes.len(),
        regions = graph.regions.len(),
        "Committed inspection result"
    );
    Ok(graph.image.id.clone())
}

async fn insert_image(tx: &mut Transaction<'_, Sqlite>, image: &ImageRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO images (
            id, image_height, image_width, processing_time_seconds, timestamp,
            input_image_path, result_image_1_path, result_image_2_path, result_image_3_path,
            batch_id, original_filename, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&image.id)
    .bind(image.image_height)
    .bind(image.image_width)
    .bind(image.processing_time_seconds)
    .bind(image.timestamp)
    .bind(&image.input_image_path)
    .bind(&image.result_image_1_path)
    .bind(&image.result_image_2_path)
    .bind(&image.result_image_3_path)
    .bind(&image.batch_id)
    .bind(&image.original_filename)
    .bind(image.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn insert_class(tx: &mut Transaction<'_, Sqlite>, class: &ClassRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO classes (id, image_id, category_id, category_name, total_regions, total_area_pixels)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&class.id)
    .bind(&class.image_id)
    .bind(class.category_id)
    .bind(&class.category_name)
    .bind(class.total_regions)
    .bind(class.total_area_pixels)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn insert_region(tx: &mut Transaction<'_, Sqlite>, region: &RegionRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO regions (
            id, class_id, image_id, region_index, centroid_x, centroid_y,
            bbox_x, bbox_y, bbox_width, bbox_height, area_pixels, perimeter,
            major_axis, minor_axis, circularity, aspect_ratio
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&region.id)
    .bind(&region.class_id)
    .bind(&region.image_id)
    .bind(region.region_index)
    .bind(region.centroid_x)
    .bind(region.centroid_y)
    .bind(region.bbox_x)
    .bind(region.bbox_y)
    .bind(region.bbox_width)
    .bind(region.bbox_height)
    .bind(region.area_pixels)
    .bind(region.perimeter)
    .bind(region.major_axis)
    .bind(region.minor_axis)
    .bind(region.circularity)
    .bind(region.aspect_ratio)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

const IMAGE_COLUMNS: &str = "id, image_height, image_width, processing_time_seconds, timestamp, \
     input_image_path, result_image_1_path, result_image_2_path, result_image_3_path, \
     batch_id, original_filename, created_at";

const REGION_COLUMNS: &str = "r.id, r.class_id, r.image_id, r.region_index, r.centroid_x, r.centroid_y, \
     r.bbox_x, r.bbox_y, r.bbox_width, r.bbox_height, r.area_pixels, r.perimeter, \
     r.major_axis, r.minor_axis, r.circularity, r.aspect_ratio";

/// Load an image with all classes and regions
pub async fn get_image(pool: &SqlitePool, image_id: &str) -> Result<ImageHierarchy> {
    let image: ImageRecord =
        sqlx::query_as(&format!("SELECT {} FROM images WHERE id = ?", IMAGE_COLUMNS))
            .bind(image_id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("image {}", image_id)))?;

    let classes: Vec<ClassRecord> = sqlx::query_as(
        r#"
        SELECT id, image_id, category_id, category_name, total_regions, total_area_pixels
        FROM classes
        WHERE image_id = ?
        ORDER BY category_id
        "#,
    )
    .bind(image_id)
    .fetch_all(pool)
    .await?;

    let mut regions_by_class: HashMap<String, Vec<RegionRecord>> = HashMap::new();
    for region in regions_for_image(pool, image_id).await? {
        regions_by_class
            .entry(region.class_id.clone())
            .or_default()
            .push(region);
    }

    let classes = classes
        .into_iter()
        .map(|class| {
            let regions = regions_by_class.remove(&class.id).unwrap_or_default();
            ClassWithRegions { class, regions }
        })
        .collect();

    Ok(ImageHierarchy { image, classes })
}

/// All regions of an image, ordered by category then region index
pub async fn regions_for_image(pool: &SqlitePool, image_id: &str) -> Result<Vec<RegionRecord>> {
    let regions = sqlx::query_as(&format!(
        r#"
        SELECT {}
        FROM regions r
        JOIN classes c ON c.id = r.class_id
        WHERE r.image_id = ?
        ORDER BY c.category_id, r.region_index
        "#,
        REGION_COLUMNS
    ))
    .bind(image_id)
    .fetch_all(pool)
    .await?;

    Ok(regions)
}

/// All regions of one class, ordered by region index
pub async fn regions_for_class(pool: &SqlitePool, class_id: &str) -> Result<Vec<RegionRecord>> {
    let regions = sqlx::query_as(&format!(
        "SELECT {} FROM regions r WHERE r.class_id = ? ORDER BY r.region_index",
        REGION_COLUMNS
    ))
    .bind(class_id)
    .fetch_all(pool)
    .await?;

    Ok(regions)
}

/// Most recent images first
pub async fn list_images(pool: &SqlitePool, limit: u32) -> Result<Vec<ImageRecord>> {
    let images = sqlx::query_as(&format!(
        "SELECT {} FROM images ORDER BY created_at DESC, id LIMIT ?",
        IMAGE_COLUMNS
    ))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(images)
}

pub async fn list_batch_images(pool: &SqlitePool, batch_id: &str) -> Result<Vec<ImageRecord>> {
    let images = sqlx::query_as(&format!(
        "SELECT {} FROM images WHERE batch_id = ? ORDER BY created_at, id",
        IMAGE_COLUMNS
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    Ok(images)
}

/// Delete an image; classes and regions follow by cascade
pub async fn delete_image(pool: &SqlitePool, image_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query("DELETE FROM images WHERE id = ?")
        .bind(image_id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("image {}", image_id)));
    }
    tx.commit().await?;

    info!(image_id = %image_id, "Deleted image and its regions");
    Ok(())
}

/// Retention: delete every image created before `cutoff`; returns images removed
pub async fn delete_images_older_than(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query("DELETE FROM images WHERE created_at < ?")
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let removed = result.rows_affected();
    debug!(removed, %cutoff, "Retention cleanup of image rows");
    Ok(removed)
}
