//! Focus-aware cropping to a fixed output size.
//!
//! The focus is the largest salient blob of the image. A target-sized window
//! is centred on it (or on the image centre when nothing stands out), clamped
//! into the image, and resized to exactly the target size.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::filter::gaussian_blur_f32;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::segment::{contour_area, contour_bbox, external_contours};
use crate::error::Error;
use crate::io::{collect_images, load_image, progress_bar, save_image, CROP_EXTENSIONS};
use crate::types::{BBox, Mask};

/// Output dimensions of a focus crop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!(
                "target size must be positive, got {width}x{height}"
            ))
            .into());
        }
        Ok(Self { width, height })
    }
}

impl Default for TargetSize {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
        }
    }
}

impl FromStr for TargetSize {
    type Err = String;

    /// Parse `WIDTHxHEIGHT`, e.g. `1024x768`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .to_lowercase()
            .split_once('x')
            .map(|(w, h)| (w.trim().to_string(), h.trim().to_string()))
            .ok_or_else(|| format!("Invalid size: {}. Use WIDTHxHEIGHT", s))?;
        let width = w
            .parse::<u32>()
            .map_err(|_| format!("Invalid width in size: {}", s))?;
        let height = h
            .parse::<u32>()
            .map_err(|_| format!("Invalid height in size: {}", s))?;
        TargetSize::new(width, height).map_err(|e| e.to_string())
    }
}

impl fmt::Display for TargetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Centre-surround contrast, stretched to the full 0..=255 range
pub fn saliency_map(gray: &GrayImage) -> GrayImage {
    let (width, height) = gray.dimensions();
    let coarse_sigma = (width.max(height) as f32 / 32.0).max(2.0);

    let fine = gaussian_blur_f32(gray, 1.0);
    let coarse = gaussian_blur_f32(gray, coarse_sigma);

    let diff: Vec<u8> = fine
        .as_raw()
        .iter()
        .zip(coarse.as_raw())
        .map(|(&a, &b)| a.abs_diff(b))
        .collect();

    let min = diff.iter().copied().min().unwrap_or(0);
    let max = diff.iter().copied().max().unwrap_or(0);
    let span = (max - min) as f32;

    GrayImage::from_fn(width, height, |x, y| {
        let v = diff[(y * width + x) as usize];
        if span == 0.0 {
            Luma([0])
        } else {
            Luma([((v - min) as f32 / span * 255.0).round() as u8])
        }
    })
}

/// Bounding box of the most salient blob, if any
pub fn focus_box(image: &DynamicImage) -> Option<BBox> {
    let saliency = saliency_map(&image.to_luma8());
    let level = otsu_level(&saliency);
    let mask = Mask::from_gray(&saliency, |v| v > level);

    let best = external_contours(&mask)
        .into_iter()
        .max_by(|a, b| contour_area(a).total_cmp(&contour_area(b)))?;
    let bbox = contour_bbox(&best);
    debug!("Focus box: {:?}", bbox);
    bbox
}

/// Target-sized window centred on `focus`, kept inside the image
pub fn crop_window(focus: BBox, image_size: (u32, u32), target: TargetSize) -> BBox {
    let (img_w, img_h) = image_size;
    let (center_x, center_y) = focus.center();

    let start_x = (center_x - target.width as f32 / 2.0) as i64;
    let start_y = (center_y - target.height as f32 / 2.0) as i64;

    let start_x = start_x.min(img_w as i64 - target.width as i64).max(0) as u32;
    let start_y = start_y.min(img_h as i64 - target.height as i64).max(0) as u32;

    BBox::from_xywh(
        start_x,
        start_y,
        target.width.min(img_w),
        target.height.min(img_h),
    )
}

/// Target-sized window centred on the image
pub fn center_window(image_size: (u32, u32), target: TargetSize) -> BBox {
    crop_window(
        BBox::from_xywh(0, 0, image_size.0, image_size.1),
        image_size,
        target,
    )
}

/// Crop around the focus and resize to exactly `target`
///
/// Images smaller than the target are resized whole.
pub fn focus_crop(image: &DynamicImage, target: TargetSize) -> DynamicImage {
    let (img_w, img_h) = (image.width(), image.height());

    if img_w < target.width || img_h < target.height {
        warn!(
            "Image size ({}x{}) is smaller than target size ({}), resizing whole image",
            img_w, img_h, target
        );
        return image.resize_exact(target.width, target.height, FilterType::Lanczos3);
    }

    let window = match focus_box(image) {
        Some(focus) => crop_window(focus, (img_w, img_h), target),
        None => {
            debug!("No focus found, using centre crop");
            center_window((img_w, img_h), target)
        }
    };

    image
        .crop_imm(window.x1, window.y1, window.width(), window.height())
        .resize_exact(target.width, target.height, FilterType::Lanczos3)
}

/// Where focus crops go when the caller does not say
///
/// A directory `photos` maps to a sibling `photos_cropped`; a file maps to a
/// `cropped` folder beside it.
pub fn default_crop_dir(input: &Path) -> PathBuf {
    let parent = input.parent().unwrap_or_else(|| Path::new(""));
    if input.is_dir() {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "images".to_string());
        parent.join(format!("{name}_cropped"))
    } else {
        parent.join("cropped")
    }
}

/// Focus-crop a single file
pub fn crop_file(input: &Path, output: &Path, target: TargetSize) -> Result<()> {
    let image = load_image(input).context(format!("Failed to load image: {}", input.display()))?;
    let cropped = focus_crop(&image, target);
    save_image(&cropped, output)
}

/// Outcome of cropping a directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CropReport {
    pub written: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Focus-crop every image under `input_dir` into `output_dir`
///
/// Relative paths are mirrored. A file that fails is logged and counted; the
/// rest of the batch still runs.
pub fn crop_dir(
    input_dir: &Path,
    output_dir: &Path,
    target: TargetSize,
    recursive: bool,
) -> Result<CropReport> {
    let inputs = collect_images(input_dir, CROP_EXTENSIONS, recursive)
        .context(format!("Failed to read directory: {}", input_dir.display()))?;
    info!(
        "Cropping {} image(s) from {} to {}",
        inputs.len(),
        input_dir.display(),
        target
    );

    let pb = progress_bar(inputs.len() as u64, "cropping")?;
    let mut report = CropReport::default();

    for input in inputs {
        let relative = input.strip_prefix(input_dir).unwrap_or(&input);
        let output = output_dir.join(relative);

        match crop_file(&input, &output, target) {
            Ok(()) => report.written.push(output),
            Err(e) => {
                error!("Failed to crop {}: {:#}", input.display(), e);
                report.failed.push(input);
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!(
        "Cropped {} image(s), {} failed",
        report.written.len(),
        report.failed.len()
    );
    Ok(report)
}
