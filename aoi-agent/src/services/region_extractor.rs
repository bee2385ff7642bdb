//! Defect region extraction
//!
//! Splits a [`LabelMask`] into 8-connected blobs per defect category and
//! computes geometric descriptors for each blob:
//!
//! | Field | Definition |
//! |-------|------------|
//! | `area_pixels` | member pixel count |
//! | `bbox_*` | tight axis-aligned box |
//! | `centroid_*` | mean pixel coordinate |
//! | `perimeter` | outer contour length (axis step 1, diagonal step √2) |
//! | `major_axis`, `minor_axis` | `2·sqrt(λ)` of the coordinate covariance eigenvalues |
//! | `circularity` | `4π·area / perimeter²`, clamped to [0, 1] |
//! | `aspect_ratio` | `major_axis / minor_axis` |
//!
//! All moment sums are accumulated in integers, so identical masks always
//! produce bit-identical metrics. Regions within a class are numbered from 1
//! in centroid order (top-to-bottom, then left-to-right).

use crate::services::mask_decoder::LabelMask;
use aoi_common::DefectCategory;
use serde::Serialize;
use std::f64::consts::{PI, SQRT_2};
use tracing::{debug, warn};

/// Perimeter assigned to blobs with no traceable contour (single pixels)
pub const MIN_PERIMETER: f64 = 1.0;

/// Floor for principal axis lengths of degenerate blobs
pub const MIN_AXIS: f64 = 1.0;

/// Clockwise neighbour offsets starting east (y grows downward)
const DIRECTIONS: [(i64, i64); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

/// Index of west in `DIRECTIONS`
const WEST: usize = 4;

/// Geometric description of one blob
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionMetrics {
    /// 1-based position within its class
    pub region_index: u32,
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub bbox_x: u32,
    pub bbox_y: u32,
    pub bbox_width: u32,
    pub bbox_height: u32,
    pub area_pixels: u64,
    pub perimeter: f64,
    pub major_axis: f64,
    pub minor_axis: f64,
    pub circularity: f64,
    pub aspect_ratio: f64,
}

/// All regions of one category
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassRegions {
    pub category: DefectCategory,
    pub total_regions: u32,
    pub total_area_pixels: u64,
    pub regions: Vec<RegionMetrics>,
}

/// Extraction result for one mask, classes in category id order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionOutput {
    pub classes: Vec<ClassRegions>,
}

impl ExtractionOutput {
    pub fn total_regions(&self) -> u64 {
        self.classes.iter().map(|c| c.total_regions as u64).sum()
    }

    pub fn total_area_pixels(&self) -> u64 {
        self.classes.iter().map(|c| c.total_area_pixels).sum()
    }

    pub fn class(&self, category: DefectCategory) -> Option<&ClassRegions> {
        self.classes.iter().find(|c| c.category == category)
    }
}

/// Blob awaiting index assignment; `scan_order` breaks centroid ties
struct PendingRegion {
    scan_order: usize,
    metrics: RegionMetrics,
}

/// Mask → regions converter
#[derive(Debug, Clone, Default)]
pub struct RegionExtractor {
    min_region_area: Option<u64>,
}

impl RegionExtractor {
    /// Blobs smaller than `min_region_area` pixels are discarded
    pub fn new(min_region_area: Option<u64>) -> Self {
        Self { min_region_area }
    }

    pub fn extract(&self, mask: &LabelMask) -> ExtractionOutput {
        let width = mask.width() as usize;
        let height = mask.height() as usize;
        let labels = mask.labels();

        let mut visited = vec![false; labels.len()];
        let mut pending: Vec<Vec<PendingRegion>> =
            DefectCategory::ALL.iter().map(|_| Vec::new()).collect();
        let mut unknown_pixels = 0usize;
        let mut discarded = 0usize;
        let mut scan_order = 0usize;
        let mut stack: Vec<usize> = Vec::new();

        for seed in 0..labels.len() {
            if visited[seed] || labels[seed] == 0 {
                continue;
            }
            let label = labels[seed];
            let Some(category) = DefectCategory::from_id(label) else {
                visited[seed] = true;
                unknown_pixels += 1;
                continue;
            };

            // 8-connected flood fill from the seed; the seed is the blob's
            // top-left pixel because everything before it is already visited.
            let mut pixels: Vec<(u32, u32)> = Vec::new();
            visited[seed] = true;
            stack.push(seed);
            while let Some(index) = stack.pop() {
                let x = (index % width) as i64;
                let y = (index / width) as i64;
                pixels.push((x as u32, y as u32));
                for (dx, dy) in DIRECTIONS {
                    let (nx, ny) = (x + dx, y + dy);
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }
                    let neighbour = ny as usize * width + nx as usize;
                    if !visited[neighbour] && labels[neighbour] == label {
                        visited[neighbour] = true;
                        stack.push(neighbour);
                    }
                }
            }

            let area = pixels.len() as u64;
            if self.min_region_area.is_some_and(|min| area < min) {
                discarded += 1;
                continue;
            }

            let start = ((seed % width) as u32, (seed / width) as u32);
            let metrics = blob_metrics(mask, label, &pixels, start);
            pending[category.id() as usize - 1].push(PendingRegion {
                scan_order,
                metrics,
            });
            scan_order += 1;
        }

        if unknown_pixels > 0 {
            warn!(
                unknown_pixels,
                "Mask contains labels outside the defect taxonomy; ignored"
            );
        }
        if discarded > 0 {
            debug!(discarded, min_area = ?self.min_region_area, "Discarded regions below minimum area");
        }

        let classes = DefectCategory::ALL
            .iter()
            .zip(pending)
            .filter(|(_, regions)| !regions.is_empty())
            .map(|(category, mut regions)| {
                regions.sort_by(|a, b| {
                    a.metrics
                        .centroid_y
                        .total_cmp(&b.metrics.centroid_y)
                        .then(a.metrics.centroid_x.total_cmp(&b.metrics.centroid_x))
                        .then(a.scan_order.cmp(&b.scan_order))
                });
                let regions: Vec<RegionMetrics> = regions
                    .into_iter()
                    .enumerate()
                    .map(|(i, pending)| RegionMetrics {
                        region_index: i as u32 + 1,
                        ..pending.metrics
                    })
                    .collect();
                ClassRegions {
                    category: *category,
                    total_regions: regions.len() as u32,
                    total_area_pixels: regions.iter().map(|r| r.area_pixels).sum(),
                    regions,
                }
            })
            .collect();

        ExtractionOutput { classes }
    }
}

/// Descriptors for one blob; `start` must be its top-left (first in scan order) pixel
fn blob_metrics(
    mask: &LabelMask,
    label: u16,
    pixels: &[(u32, u32)],
    start: (u32, u32),
) -> RegionMetrics {
    let n = pixels.len() as i128;

    let mut sum_x: i128 = 0;
    let mut sum_y: i128 = 0;
    let mut sum_xx: i128 = 0;
    let mut sum_yy: i128 = 0;
    let mut sum_xy: i128 = 0;
    let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
    let (mut max_x, mut max_y) = (0u32, 0u32);

    for &(x, y) in pixels {
        let (xi, yi) = (x as i128, y as i128);
        sum_x += xi;
        sum_y += yi;
        sum_xx += xi * xi;
        sum_yy += yi * yi;
        sum_xy += xi * yi;
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }

    let nf = n as f64;
    let n2 = (n * n) as f64;
    // Population covariance, numerators kept exact
    let var_x = (n * sum_xx - sum_x * sum_x) as f64 / n2;
    let var_y = (n * sum_yy - sum_y * sum_y) as f64 / n2;
    let cov_xy = (n * sum_xy - sum_x * sum_y) as f64 / n2;

    let half_trace = (var_x + var_y) / 2.0;
    let spread = (((var_x - var_y) / 2.0).powi(2) + cov_xy * cov_xy).sqrt();
    let lambda_major = half_trace + spread;
    let lambda_minor = (half_trace - spread).max(0.0);

    let major_axis = (2.0 * lambda_major.sqrt()).max(MIN_AXIS);
    let minor_axis = (2.0 * lambda_minor.sqrt()).max(MIN_AXIS);

    let perimeter = match contour_length(mask, label, start) {
        p if p > 0.0 => p,
        _ => MIN_PERIMETER,
    };
    let area = pixels.len() as u64;
    let circularity = (4.0 * PI * area as f64 / (perimeter * perimeter)).clamp(0.0, 1.0);

    RegionMetrics {
        region_index: 0,
        centroid_x: sum_x as f64 / nf,
        centroid_y: sum_y as f64 / nf,
        bbox_x: min_x,
        bbox_y: min_y,
        bbox_width: max_x - min_x + 1,
        bbox_height: max_y - min_y + 1,
        area_pixels: area,
        perimeter,
        major_axis,
        minor_axis,
        circularity,
        aspect_ratio: major_axis / minor_axis,
    }
}

/// Outer contour length by Moore-neighbour tracing
///
/// Starts at the blob's top-left pixel with the west neighbour as backtrack
/// (always outside the blob) and stops on returning to the start about to
/// repeat the first move. Returns 0 for a blob with no neighbours.
fn contour_length(mask: &LabelMask, label: u16, start: (u32, u32)) -> f64 {
    let width = mask.width() as i64;
    let height = mask.height() as i64;
    let inside = |x: i64, y: i64| {
        x >= 0 && y >= 0 && x < width && y < height && mask.get(x as u32, y as u32) == label
    };

    let start = (start.0 as i64, start.1 as i64);
    let mut current = start;
    let mut backtrack = WEST;
    let mut first_move: Option<usize> = None;
    let mut axis_steps: u64 = 0;
    let mut diagonal_steps: u64 = 0;
    // A contour revisits each boundary pixel a bounded number of times
    let max_steps = 8 * (width as u64) * (height as u64) + 8;

    loop {
        let next = (1..=8)
            .map(|i| (backtrack + i) % 8)
            .find(|&d| inside(current.0 + DIRECTIONS[d].0, current.1 + DIRECTIONS[d].1));

        let Some(direction) = next else {
            // Isolated pixel
            return 0.0;
        };

        match first_move {
            None => first_move = Some(direction),
            Some(first) if current == start && direction == first => break,
            Some(_) => {}
        }

        if direction % 2 == 0 {
            axis_steps += 1;
        } else {
            diagonal_steps += 1;
        }
        if axis_steps + diagonal_steps > max_steps {
            warn!(?start, "Contour trace did not close; using partial length");
            break;
        }

        current = (current.0 + DIRECTIONS[direction].0, current.1 + DIRECTIONS[direction].1);
        // The cell checked just before the move is background; make it the new backtrack
        backtrack = if direction % 2 == 0 {
            (direction + 6) % 8
        } else {
            (direction + 5) % 8
        };
    }

    axis_steps as f64 + diagonal_steps as f64 * SQRT_2
}
