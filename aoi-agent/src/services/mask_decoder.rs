//! Classification mask decoding
//!
//! Turns the mask image returned by the inference service into a label grid.
//! Grayscale masks carry the label directly in the pixel value; colour masks
//! are mapped through a [`MaskPalette`].

use crate::error::ExtractionError;
use aoi_common::DefectCategory;
use image::DynamicImage;
use tracing::{debug, warn};

/// Per-pixel label grid, row-major, 0 = background
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMask {
    width: u32,
    height: u32,
    labels: Vec<u16>,
}

impl LabelMask {
    pub fn new(width: u32, height: u32, labels: Vec<u16>) -> Result<Self, ExtractionError> {
        if width == 0 || height == 0 {
            return Err(ExtractionError::EmptyMask);
        }
        if labels.len() != width as usize * height as usize {
            return Err(ExtractionError::SizeMismatch {
                width,
                height,
                actual: labels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            labels,
        })
    }

    /// Build from rows of equal length (handy for small literal masks)
    pub fn from_rows(rows: &[&[u16]]) -> Result<Self, ExtractionError> {
        let height = rows.len() as u32;
        let width = rows.first().map(|r| r.len()).unwrap_or(0) as u32;
        let labels: Vec<u16> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Self::new(width, height, labels)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn labels(&self) -> &[u16] {
        &self.labels
    }

    pub fn get(&self, x: u32, y: u32) -> u16 {
        self.labels[(y * self.width + x) as usize]
    }
}

/// Colour → category lookup for RGB masks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskPalette {
    entries: Vec<([u8; 3], DefectCategory)>,
}

impl Default for MaskPalette {
    fn default() -> Self {
        Self {
            entries: vec![
                ([255, 0, 0], DefectCategory::PiParticle),
                ([0, 255, 0], DefectCategory::PrPeeling),
                ([0, 0, 255], DefectCategory::CopperNodule),
                ([255, 255, 0], DefectCategory::EnvParticle),
            ],
        }
    }
}

impl MaskPalette {
    pub fn new(entries: Vec<([u8; 3], DefectCategory)>) -> Self {
        Self { entries }
    }

    /// Label for a colour; `None` for colours outside the palette
    ///
    /// Black is background. Neutral grays whose value is a category id are
    /// treated as label-valued masks saved in RGB.
    pub fn label_for(&self, rgb: [u8; 3]) -> Option<u16> {
        if rgb == [0, 0, 0] {
            return Some(0);
        }
        if let Some((_, category)) = self.entries.iter().find(|(colour, _)| *colour == rgb) {
            return Some(category.id() as u16);
        }
        let [r, g, b] = rgb;
        if r == g && g == b && DefectCategory::from_id(r as u16).is_some() {
            return Some(r as u16);
        }
        None
    }
}

/// Decode mask image bytes into a label grid
pub fn decode_mask(bytes: &[u8], palette: &MaskPalette) -> Result<LabelMask, ExtractionError> {
    if bytes.is_empty() {
        return Err(ExtractionError::EmptyMask);
    }

    let image =
        image::load_from_memory(bytes).map_err(|e| ExtractionError::Decode(e.to_string()))?;
    let (width, height) = (image.width(), image.height());

    let labels: Vec<u16> = match image {
        DynamicImage::ImageLuma8(buf) => buf.into_raw().into_iter().map(u16::from).collect(),
        DynamicImage::ImageLuma16(buf) => buf.into_raw(),
        DynamicImage::ImageLumaA8(buf) => buf.pixels().map(|p| u16::from(p.0[0])).collect(),
        DynamicImage::ImageLumaA16(buf) => buf.pixels().map(|p| p.0[0]).collect(),
        other => {
            let rgb = other.to_rgb8();
            let mut unknown = 0usize;
            let labels = rgb
                .pixels()
                .map(|p| {
                    palette.label_for(p.0).unwrap_or_else(|| {
                        unknown += 1;
                        0
                    })
                })
                .collect();
            if unknown > 0 {
                warn!(
                    unknown_pixels = unknown,
                    "Mask contains colours outside the palette; treated as background"
                );
            }
            labels
        }
    };

    debug!(width, height, "Decoded classification mask");
    LabelMask::new(width, height, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma, Rgb, RgbImage};
    use std::io::Cursor;

    fn encode_png(image: DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_grayscale_mask_values_are_labels() {
        let mut gray = GrayImage::new(3, 2);
        gray.put_pixel(1, 0, Luma([2]));
        gray.put_pixel(2, 1, Luma([4]));

        let mask = decode_mask(&encode_png(DynamicImage::ImageLuma8(gray)), &MaskPalette::default())
            .unwrap();
        assert_eq!((mask.width(), mask.height()), (3, 2));
        assert_eq!(mask.labels(), &[0, 2, 0, 0, 0, 4]);
    }

    #[test]
    fn test_colour_mask_uses_palette() {
        let mut rgb = RgbImage::new(2, 2);
        rgb.put_pixel(0, 0, Rgb([255, 0, 0]));
        rgb.put_pixel(1, 0, Rgb([0, 0, 255]));
        rgb.put_pixel(0, 1, Rgb([12, 34, 56]));
        rgb.put_pixel(1, 1, Rgb([3, 3, 3]));

        let mask = decode_mask(&encode_png(DynamicImage::ImageRgb8(rgb)), &MaskPalette::default())
            .unwrap();
        assert_eq!(mask.labels(), &[1, 3, 0, 3]);
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let result = decode_mask(b"definitely not an image", &MaskPalette::default());
        assert!(matches!(result, Err(ExtractionError::Decode(_))));
        assert!(matches!(
            decode_mask(&[], &MaskPalette::default()),
            Err(ExtractionError::EmptyMask)
        ));
    }

    #[test]
    fn test_label_mask_dimension_checks() {
        assert!(matches!(
            LabelMask::new(2, 2, vec![0; 3]),
            Err(ExtractionError::SizeMismatch { actual: 3, .. })
        ));
        assert!(matches!(LabelMask::new(0, 5, vec![]), Err(ExtractionError::EmptyMask)));
    }
}
