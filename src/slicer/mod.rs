//! Image slicing: split one image into its detected regions, or crop it
//! around its visual focus.

pub mod focus;
pub mod segment;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::DynamicImage;
use tracing::{debug, info};

use crate::io::{load_image, save_image};
use crate::types::{BBox, Region};

pub use focus::{crop_dir, crop_file, default_crop_dir, focus_crop, CropReport, TargetSize};

/// Tuning for region detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceOptions {
    /// Regions whose bounding box covers fewer pixels are treated as noise
    pub min_area: u64,
    /// Extra margin added around each region, clamped to the image
    pub padding: u32,
}

impl Default for SliceOptions {
    fn default() -> Self {
        Self {
            min_area: 64,
            padding: 0,
        }
    }
}

/// Detect regions in an image, in reading order
pub fn find_regions(image: &DynamicImage, options: &SliceOptions) -> Vec<BBox> {
    let gray = image.to_luma8();
    let mask = segment::binarize(&gray);

    let mut boxes: Vec<BBox> = segment::external_contours(&mask)
        .iter()
        .filter_map(segment::contour_bbox)
        .filter(|b| b.area() >= options.min_area)
        .map(|b| b.pad(options.padding, image.width(), image.height()))
        .collect();
    boxes.sort_by_key(|b| (b.y1, b.x1));

    debug!("Detected {} region(s)", boxes.len());
    boxes
}

/// Directory regions go to when the caller does not name one
pub fn default_output_dir(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    input
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(format!("{stem}_regions"))
}

/// File name for region `index` of `input`
pub fn region_file_name(input: &Path, index: usize) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let ext = input
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "png".to_string());
    format!("{stem}_{index:03}.{ext}")
}

/// Slice `input` into one file per detected region
///
/// The input is decoded before anything is written, so a bad input leaves no
/// files behind.
pub fn slice_file(input: &Path, output_dir: &Path, options: &SliceOptions) -> Result<Vec<Region>> {
    let image = load_image(input).context(format!("Failed to load image: {}", input.display()))?;
    let boxes = find_regions(&image, options);

    let mut regions = Vec::with_capacity(boxes.len());
    for (i, bbox) in boxes.into_iter().enumerate() {
        let index = i + 1;
        let path = output_dir.join(region_file_name(input, index));
        let crop = image.crop_imm(bbox.x1, bbox.y1, bbox.width(), bbox.height());
        save_image(&crop, &path)?;
        regions.push(Region { index, bbox, path });
    }

    info!(
        "Sliced {} into {} region(s) under {}",
        input.display(),
        regions.len(),
        output_dir.display()
    );
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn sheet_with_squares(squares: &[(u32, u32, u32)]) -> DynamicImage {
        let img = RgbImage::from_fn(120, 80, |x, y| {
            let inside = squares
                .iter()
                .any(|&(sx, sy, s)| x >= sx && x < sx + s && y >= sy && y < sy + s);
            if inside {
                Rgb([30, 60, 90])
            } else {
                Rgb([250, 250, 250])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_find_regions_reading_order() {
        let image = sheet_with_squares(&[(70, 10, 20), (10, 10, 20), (40, 50, 20)]);
        let boxes = find_regions(&image, &SliceOptions::default());
        assert_eq!(
            boxes,
            vec![
                BBox::from_xywh(10, 10, 20, 20),
                BBox::from_xywh(70, 10, 20, 20),
                BBox::from_xywh(40, 50, 20, 20),
            ]
        );
    }

    #[test]
    fn test_find_regions_drops_specks() {
        let image = sheet_with_squares(&[(10, 10, 20), (60, 60, 3)]);
        let boxes = find_regions(&image, &SliceOptions::default());
        assert_eq!(boxes.len(), 1);

        let keep_all = SliceOptions {
            min_area: 1,
            padding: 0,
        };
        assert_eq!(find_regions(&image, &keep_all).len(), 2);
    }

    #[test]
    fn test_find_regions_padding() {
        let image = sheet_with_squares(&[(2, 10, 20)]);
        let options = SliceOptions {
            min_area: 64,
            padding: 5,
        };
        let boxes = find_regions(&image, &options);
        assert_eq!(boxes, vec![BBox { x1: 0, y1: 5, x2: 27, y2: 35 }]);
    }

    #[test]
    fn test_find_regions_blank_image() {
        let image = sheet_with_squares(&[]);
        assert!(find_regions(&image, &SliceOptions::default()).is_empty());
    }

    #[test]
    fn test_region_naming() {
        let input = Path::new("scans/page.PNG");
        assert_eq!(region_file_name(input, 7), "page_007.png");
        assert_eq!(default_output_dir(input), PathBuf::from("scans/page_regions"));
    }
}
