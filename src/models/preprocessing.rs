//! Image preprocessing for the vision encoder.

use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::Array4;
use tracing::debug;

/// Side length the vision encoder expects
pub const ENCODER_INPUT_SIZE: u32 = 768;

/// ImageNet normalization mean values
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet normalization std values
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Resize to cover `size` x `size` keeping aspect ratio, then crop the centre
pub fn center_crop_resize(image: &DynamicImage, size: u32) -> DynamicImage {
    let (orig_w, orig_h) = (image.width(), image.height());
    if orig_w == 0 || orig_h == 0 {
        return DynamicImage::ImageRgb8(RgbImage::from_pixel(size, size, Rgb([128, 128, 128])));
    }

    let scale = (size as f32 / orig_w as f32).max(size as f32 / orig_h as f32);
    let new_w = ((orig_w as f32 * scale).round() as u32).max(size);
    let new_h = ((orig_h as f32 * scale).round() as u32).max(size);

    let resized = image.resize_exact(new_w, new_h, FilterType::Lanczos3);
    let crop_x = (new_w - size) / 2;
    let crop_y = (new_h - size) / 2;
    resized.crop_imm(crop_x, crop_y, size, size)
}

/// Preprocess image for the vision encoder
///
/// # Arguments
///
/// * `image` - Input DynamicImage
/// * `size` - Square side length of the encoder input
///
/// # Returns
///
/// Array of shape [1, 3, size, size] with ImageNet-normalized values
pub fn preprocess_for_encoder(image: &DynamicImage, size: u32) -> Array4<f32> {
    debug!(
        "Preprocessing image for encoder: {}x{} -> {}x{}",
        image.width(),
        image.height(),
        size,
        size
    );

    let rgb = center_crop_resize(image, size).to_rgb8();

    let side = size as usize;
    let mut array = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            array[[0, c, y, x]] = (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }

    array
}
