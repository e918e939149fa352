//! Filesystem helpers: loading, saving, collecting and renaming images.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::Error;

/// Extensions the focus cropper picks up in a directory
pub const CROP_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Extensions the caption generator picks up in a directory
pub const CAPTION_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Load an image, distinguishing a missing file from an undecodable one
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    if !path.is_file() {
        return Err(Error::NotFound(path.to_path_buf()).into());
    }

    let image = image::open(path).map_err(|source| Error::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(
        "Loaded {}: {}x{}",
        path.display(),
        image.width(),
        image.height()
    );
    Ok(image)
}

/// Save an image, creating parent directories as needed
///
/// The format follows the extension. JPEG has no alpha channel so the image is
/// flattened to RGB first.
pub fn save_image(image: &DynamicImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    if has_extension(path, &["jpg", "jpeg"]) {
        DynamicImage::ImageRgb8(image.to_rgb8()).save(path)
    } else {
        image.save(path)
    }
    .with_context(|| format!("Failed to write image: {}", path.display()))?;

    debug!("Wrote {}", path.display());
    Ok(())
}

/// Case-insensitive extension check
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Collect image files under `dir`, sorted by path
pub fn collect_images(dir: &Path, extensions: &[&str], recursive: bool) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(dir.to_path_buf()).into());
    }

    let walker = if recursive {
        WalkDir::new(dir)
    } else {
        WalkDir::new(dir).max_depth(1)
    };

    let mut paths: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && has_extension(entry.path(), extensions))
        .map(|entry| entry.path().to_path_buf())
        .collect();
    paths.sort();

    debug!("Found {} image(s) in {}", paths.len(), dir.display());
    Ok(paths)
}

/// Progress bar for batch runs, drawn on stderr
pub fn progress_bar(len: u64, message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("##>-"),
    );
    pb.set_message(message.to_string());
    Ok(pb)
}

/// Path of the caption file that belongs to `image`
pub fn sidecar_path(image: &Path) -> PathBuf {
    image.with_extension("txt")
}

fn is_sequential_name(stem: &str) -> bool {
    stem.len() == 3 && stem.bytes().all(|b| b.is_ascii_digit())
}

/// Rename images in `dir` to `001.ext`, `002.ext`, ...
///
/// Files that already carry a three-digit name are left alone and their
/// numbers are never reused. Returns the (old, new) pairs in rename order.
pub fn rename_sequential(dir: &Path, extensions: &[&str]) -> Result<Vec<(PathBuf, PathBuf)>> {
    let images = collect_images(dir, extensions, false)?;

    let mut taken: HashSet<String> = HashSet::new();
    let mut pending = Vec::new();
    for path in images {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if is_sequential_name(&stem) {
            taken.insert(stem);
        } else {
            pending.push(path);
        }
    }

    let mut renamed = Vec::with_capacity(pending.len());
    let mut next = 1usize;
    for old_path in pending {
        while taken.contains(&format!("{next:03}")) {
            next += 1;
        }
        let stem = format!("{next:03}");
        let ext = old_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let new_path = dir.join(format!("{stem}.{ext}"));

        fs::rename(&old_path, &new_path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                old_path.display(),
                new_path.display()
            )
        })?;
        info!(
            "Renamed: {} -> {}",
            old_path.file_name().unwrap_or_default().to_string_lossy(),
            new_path.file_name().unwrap_or_default().to_string_lossy()
        );

        taken.insert(stem);
        renamed.push((old_path, new_path));
    }

    Ok(renamed)
}
