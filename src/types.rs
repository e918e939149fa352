//! Shared type definitions for the slicer and the caption generator.

use std::path::PathBuf;

use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Pixel rectangle in format (x1, y1, x2, y2), right and bottom exclusive
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BBox {
    /// Create a box from its top-left corner and size
    pub fn from_xywh(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x1: x,
            y1: y,
            x2: x + width,
            y2: y + height,
        }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Centre point in floating point pixel coordinates
    pub fn center(&self) -> (f32, f32) {
        (
            self.x1 as f32 + self.width() as f32 / 2.0,
            self.y1 as f32 + self.height() as f32 / 2.0,
        )
    }

    /// Grow the box by `amount` on every side, clamped to `width` x `height`
    pub fn pad(&self, amount: u32, width: u32, height: u32) -> Self {
        Self {
            x1: self.x1.saturating_sub(amount),
            y1: self.y1.saturating_sub(amount),
            x2: (self.x2 + amount).min(width),
            y2: (self.y2 + amount).min(height),
        }
    }
}

/// Binary foreground mask
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<bool>, // Flattened row-major format
}

impl Mask {
    /// Create a new mask
    pub fn new(width: u32, height: u32, data: Vec<bool>) -> Self {
        assert_eq!(
            data.len(),
            (width * height) as usize,
            "Mask data size must match width * height"
        );
        Self {
            width,
            height,
            data,
        }
    }

    /// Mark every pixel of `image` for which `predicate` holds
    pub fn from_gray(image: &GrayImage, predicate: impl Fn(u8) -> bool) -> Self {
        let data = image.pixels().map(|p| predicate(p[0])).collect();
        Self::new(image.width(), image.height(), data)
    }

    /// Get mask value at (x, y)
    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.data[(y * self.width + x) as usize]
    }

    /// Flip foreground and background
    pub fn invert(&mut self) {
        self.data.iter_mut().for_each(|v| *v = !*v);
    }

    /// Get bounding box from mask
    pub fn bbox(&self) -> Option<BBox> {
        let mut min_x = self.width;
        let mut max_x = 0;
        let mut min_y = self.height;
        let mut max_y = 0;
        let mut found = false;

        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    found = true;
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                    min_y = min_y.min(y);
                    max_y = max_y.max(y);
                }
            }
        }

        found.then(|| BBox {
            x1: min_x,
            y1: min_y,
            x2: max_x + 1,
            y2: max_y + 1,
        })
    }

    /// Get number of true pixels
    pub fn pixel_count(&self) -> usize {
        self.data.iter().filter(|&&b| b).count()
    }

    /// Fraction of the outermost ring of pixels that is set
    pub fn border_ratio(&self) -> f32 {
        if self.width == 0 || self.height == 0 {
            return 0.0;
        }

        let mut total = 0usize;
        let mut set = 0usize;
        for y in 0..self.height {
            for x in 0..self.width {
                if x == 0 || y == 0 || x == self.width - 1 || y == self.height - 1 {
                    total += 1;
                    if self.get(x, y) {
                        set += 1;
                    }
                }
            }
        }
        set as f32 / total as f32
    }

    /// Render as an 8-bit image with foreground at 255
    pub fn to_gray(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            image::Luma([if self.get(x, y) { 255 } else { 0 }])
        })
    }
}

/// A sub-image written to disk by the slicer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    /// 1-based position in reading order
    pub index: usize,
    pub bbox: BBox,
    pub path: PathBuf,
}

/// A generated description for one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caption {
    pub image: PathBuf,
    pub text: String,
    pub model: String,
}

/// Outcome of captioning a directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub captions: Vec<Caption>,
    pub renamed: usize,
    pub failed: Vec<PathBuf>,
}

impl BatchReport {
    pub fn captioned(&self) -> usize {
        self.captions.len()
    }
}
