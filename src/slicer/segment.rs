//! Threshold and contour routines used by both slicing modes.

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType, Contour};
use imageproc::contrast::otsu_level;
use tracing::debug;

use crate::types::{BBox, Mask};

/// Otsu-binarize a grayscale image
///
/// Pixels strictly above the Otsu level are foreground. When most of the
/// image border ends up as foreground the background was the bright side, so
/// the mask is inverted.
pub fn binarize(gray: &GrayImage) -> Mask {
    let level = otsu_level(gray);
    let mut mask = Mask::from_gray(gray, |v| v > level);

    let border = mask.border_ratio();
    if border > 0.5 {
        mask.invert();
    }

    debug!(
        "Otsu level {} (border foreground {:.2}), {} foreground pixels",
        level,
        border,
        mask.pixel_count()
    );
    mask
}

/// Outer borders that are not nested inside another component
pub fn external_contours(mask: &Mask) -> Vec<Contour<i32>> {
    find_contours::<i32>(&mask.to_gray())
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .collect()
}

/// Axis-aligned bounding rectangle of a contour
pub fn contour_bbox(contour: &Contour<i32>) -> Option<BBox> {
    let first = contour.points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in &contour.points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }

    Some(BBox {
        x1: min_x.max(0) as u32,
        y1: min_y.max(0) as u32,
        x2: (max_x + 1).max(0) as u32,
        y2: (max_y + 1).max(0) as u32,
    })
}

/// Polygon area enclosed by a contour (shoelace formula)
pub fn contour_area(contour: &Contour<i32>) -> f64 {
    let points = &contour.points;
    if points.len() < 3 {
        return 0.0;
    }

    let twice_area: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64)
        .sum();
    twice_area.abs() as f64 / 2.0
}
