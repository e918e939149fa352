//! Caption pipeline: validate input, call the model, write results.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::io::{
    collect_images, load_image, progress_bar, rename_sequential, sidecar_path, CAPTION_EXTENSIONS,
};
use crate::models::CaptionModel;
use crate::slicer::{crop_file, TargetSize};
use crate::types::{BatchReport, Caption};

/// Name of the scratch folder cropped images are written to
pub const CROP_DIR_NAME: &str = "output";

/// Options for captioning a directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Rename images to `001.ext`, `002.ext`, ... before captioning
    pub rename: bool,
    /// Focus-crop images to this size and caption the crops
    pub crop: Option<TargetSize>,
    /// Replace each original with its crop instead of discarding the crop
    pub keep_cropped: bool,
}

/// Complete captioning pipeline
pub struct CaptionPipeline {
    model: Box<dyn CaptionModel>,
}

impl CaptionPipeline {
    pub fn new(model: Box<dyn CaptionModel>) -> Self {
        Self { model }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Caption one image
    ///
    /// The file is decoded before the model is called, so a missing or
    /// undecodable input never reaches inference.
    pub async fn caption_file(&self, image_path: &Path) -> Result<Caption> {
        info!("Captioning: {}", image_path.display());

        let image = load_image(image_path)
            .context(format!("Failed to load image: {}", image_path.display()))?;

        let text = self
            .model
            .describe(&image, image_path)
            .await
            .context(format!("Failed to caption image: {}", image_path.display()))?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(Error::EmptyCaption(image_path.to_path_buf()).into());
        }

        debug!("Caption for {}: {}", image_path.display(), text);
        Ok(Caption {
            image: image_path.to_path_buf(),
            text,
            model: self.model.name().to_string(),
        })
    }

    /// Caption every image in `dir`, writing a `.txt` sidecar next to each
    ///
    /// Images that fail are logged and reported; the batch keeps going. Once
    /// the crop scratch folder exists it is cleaned up on every exit path.
    pub async fn caption_dir(&self, dir: &Path, options: &BatchOptions) -> Result<BatchReport> {
        if !dir.is_dir() {
            return Err(Error::NotFound(dir.to_path_buf()).into());
        }

        let mut report = BatchReport::default();
        if options.rename {
            report.renamed = rename_sequential(dir, CAPTION_EXTENSIONS)
                .context("Failed to rename images")?
                .len();
        }

        let images = collect_images(dir, CAPTION_EXTENSIONS, false)?;
        info!("Found {} image(s) in {}", images.len(), dir.display());
        let images = drop_sidecar_clashes(images, &mut report);

        let crop_dir = dir.join(CROP_DIR_NAME);
        let work = match options.crop {
            Some(target) => prepare_crops(&images, &crop_dir, target, &mut report)?,
            None => images.iter().map(|p| (p.clone(), p.clone())).collect(),
        };

        let captioned = self.caption_work(&work, &mut report).await;
        if options.crop.is_some() {
            finish_crops(&work, &crop_dir, options.keep_cropped, &mut report);
        }
        captioned?;

        info!(
            "Captioned {} image(s), {} failed",
            report.captioned(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Caption each (original, processed) pair and write the sidecar next to
    /// the processed image
    async fn caption_work(&self, work: &[(PathBuf, PathBuf)], report: &mut BatchReport) -> Result<()> {
        let pb = progress_bar(work.len() as u64, "captioning")?;
        for (original, processed) in work {
            let written = self.caption_file(processed).await.and_then(|caption| {
                let sidecar = sidecar_path(processed);
                fs::write(&sidecar, &caption.text)
                    .with_context(|| format!("Failed to write {}", sidecar.display()))?;
                Ok(caption)
            });

            match written {
                Ok(caption) => {
                    info!("Done: {}", original.display());
                    report.captions.push(Caption {
                        image: original.clone(),
                        ..caption
                    });
                }
                Err(e) => {
                    error!("Skipping {}: {:#}", original.display(), e);
                    report.failed.push(original.clone());
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(())
    }
}

/// Keep the first image for each sidecar path
///
/// `a.jpg` and `a.png` both caption into `a.txt`; the later one is reported
/// as failed instead of overwriting the earlier caption.
fn drop_sidecar_clashes(images: Vec<PathBuf>, report: &mut BatchReport) -> Vec<PathBuf> {
    let mut owners: HashMap<PathBuf, PathBuf> = HashMap::new();
    let mut kept = Vec::with_capacity(images.len());
    for image in images {
        let sidecar = sidecar_path(&image);
        match owners.get(&sidecar) {
            Some(owner) => {
                error!(
                    "Skipping {}: {} already holds the caption of {}",
                    image.display(),
                    sidecar.display(),
                    owner.display()
                );
                report.failed.push(image);
            }
            None => {
                owners.insert(sidecar, image.clone());
                kept.push(image);
            }
        }
    }
    kept
}

/// Write crops into `crop_dir`, returning (original, crop) pairs
fn prepare_crops(
    images: &[PathBuf],
    crop_dir: &Path,
    target: TargetSize,
    report: &mut BatchReport,
) -> Result<Vec<(PathBuf, PathBuf)>> {
    if crop_dir.exists() {
        return Err(Error::InvalidArgument(format!(
            "{} already exists, refusing to use it as a scratch folder",
            crop_dir.display()
        ))
        .into());
    }
    let pb = progress_bar(images.len() as u64, "cropping")?;
    fs::create_dir_all(crop_dir)
        .with_context(|| format!("Failed to create {}", crop_dir.display()))?;
    info!("Cropping images to {}", target);

    let mut work = Vec::with_capacity(images.len());
    for image in images {
        let Some(name) = image.file_name() else {
            continue;
        };
        let cropped = crop_dir.join(name);
        match crop_file(image, &cropped, target) {
            Ok(()) => work.push((image.clone(), cropped)),
            Err(e) => {
                error!("Failed to crop {}: {:#}", image.display(), e);
                report.failed.push(image.clone());
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    Ok(work)
}

/// Move sidecars next to the originals, keep or drop the crops, and remove
/// the scratch folder
///
/// A caption whose sidecar cannot be moved is reported as failed.
fn finish_crops(
    work: &[(PathBuf, PathBuf)],
    crop_dir: &Path,
    keep_cropped: bool,
    report: &mut BatchReport,
) {
    for (original, cropped) in work {
        let cropped_txt = sidecar_path(cropped);
        if cropped_txt.exists() {
            if let Err(e) = fs::rename(&cropped_txt, sidecar_path(original)) {
                error!("Failed to move {}: {}", cropped_txt.display(), e);
                report.captions.retain(|c| &c.image != original);
                report.failed.push(original.clone());
            }
        }

        let finished = if keep_cropped {
            fs::rename(cropped, original)
        } else if cropped.exists() {
            fs::remove_file(cropped)
        } else {
            Ok(())
        };
        if let Err(e) = finished {
            warn!("Failed to finish crop {}: {}", cropped.display(), e);
        }
    }

    if let Err(e) = fs::remove_dir_all(crop_dir) {
        warn!("Failed to clean up {}: {}", crop_dir.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports the image size, or nothing for images named `blank.*`
    struct SizeModel {
        calls: AtomicUsize,
    }

    impl SizeModel {
        fn boxed() -> Box<dyn CaptionModel> {
            Box::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CaptionModel for SizeModel {
        fn name(&self) -> &str {
            "size-model"
        }

        async fn describe(&self, image: &DynamicImage, source: &Path) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if source.file_stem().is_some_and(|s| s == "blank") {
                return Ok("  \n".to_string());
            }
            Ok(format!("an image of {}x{}", image.width(), image.height()))
        }
    }

    fn write_image(path: &Path, width: u32, height: u32) {
        RgbImage::from_pixel(width, height, Rgb([90, 120, 150]))
            .save(path)
            .unwrap();
    }

    #[tokio::test]
    async fn test_caption_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.png");
        write_image(&path, 40, 30);

        let pipeline = CaptionPipeline::new(SizeModel::boxed());
        let caption = pipeline.caption_file(&path).await.unwrap();

        assert_eq!(caption.text, "an image of 40x30");
        assert_eq!(caption.model, "size-model");
        assert_eq!(caption.image, path);
    }

    #[tokio::test]
    async fn test_caption_file_missing_input() {
        let pipeline = CaptionPipeline::new(SizeModel::boxed());
        let err = pipeline
            .caption_file(Path::new("/nonexistent/cat.png"))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_caption_file_empty_caption_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.png");
        write_image(&path, 8, 8);

        let pipeline = CaptionPipeline::new(SizeModel::boxed());
        let err = pipeline.caption_file(&path).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::EmptyCaption(_))
        ));
    }

    #[tokio::test]
    async fn test_caption_dir_writes_sidecars_and_skips_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("a.png"), 10, 10);
        write_image(&dir.path().join("blank.png"), 10, 10);
        fs::write(dir.path().join("broken.jpg"), b"nope").unwrap();

        let pipeline = CaptionPipeline::new(SizeModel::boxed());
        let report = pipeline
            .caption_dir(dir.path(), &BatchOptions::default())
            .await
            .unwrap();

        assert_eq!(report.captioned(), 1);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "an image of 10x10"
        );
        assert!(!dir.path().join("blank.txt").exists());
        assert!(!dir.path().join("broken.txt").exists());
    }

    #[tokio::test]
    async fn test_caption_dir_with_rename() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("zeta.png"), 10, 10);
        write_image(&dir.path().join("alpha.png"), 12, 12);

        let pipeline = CaptionPipeline::new(SizeModel::boxed());
        let options = BatchOptions {
            rename: true,
            ..BatchOptions::default()
        };
        let report = pipeline.caption_dir(dir.path(), &options).await.unwrap();

        assert_eq!(report.renamed, 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("001.txt")).unwrap(),
            "an image of 12x12"
        );
        assert!(dir.path().join("002.txt").exists());
    }

    #[tokio::test]
    async fn test_caption_dir_with_crop_discards_crops() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("a.png"), 200, 100);

        let pipeline = CaptionPipeline::new(SizeModel::boxed());
        let options = BatchOptions {
            crop: Some(TargetSize::new(64, 32).unwrap()),
            ..BatchOptions::default()
        };
        let report = pipeline.caption_dir(dir.path(), &options).await.unwrap();

        assert_eq!(report.captions[0].image, dir.path().join("a.png"));
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "an image of 64x32"
        );
        let original = load_image(&dir.path().join("a.png")).unwrap();
        assert_eq!((original.width(), original.height()), (200, 100));
        assert!(!dir.path().join(CROP_DIR_NAME).exists());
    }

    #[tokio::test]
    async fn test_caption_dir_with_crop_keeps_crops() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("a.png"), 200, 100);

        let pipeline = CaptionPipeline::new(SizeModel::boxed());
        let options = BatchOptions {
            rename: false,
            crop: Some(TargetSize::new(64, 32).unwrap()),
            keep_cropped: true,
        };
        pipeline.caption_dir(dir.path(), &options).await.unwrap();

        let replaced = load_image(&dir.path().join("a.png")).unwrap();
        assert_eq!((replaced.width(), replaced.height()), (64, 32));
        assert!(dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_caption_dir_sidecar_clash_keeps_first_caption() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("a.jpg"), 10, 10);
        write_image(&dir.path().join("a.png"), 12, 12);

        let pipeline = CaptionPipeline::new(SizeModel::boxed());
        let report = pipeline
            .caption_dir(dir.path(), &BatchOptions::default())
            .await
            .unwrap();

        assert_eq!(report.captioned(), 1);
        assert_eq!(report.failed, vec![dir.path().join("a.png")]);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "an image of 10x10"
        );
    }

    #[tokio::test]
    async fn test_caption_dir_unwritable_sidecar_does_not_stop_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("a.png"), 10, 10);
        write_image(&dir.path().join("b.png"), 10, 10);
        fs::create_dir(dir.path().join("a.txt")).unwrap();

        let pipeline = CaptionPipeline::new(SizeModel::boxed());
        let report = pipeline
            .caption_dir(dir.path(), &BatchOptions::default())
            .await
            .unwrap();

        assert_eq!(report.captioned(), 1);
        assert_eq!(report.failed, vec![dir.path().join("a.png")]);
        assert!(dir.path().join("b.txt").is_file());
    }

    #[tokio::test]
    async fn test_caption_dir_with_crop_cleans_up_after_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("a.png"), 40, 40);
        write_image(&dir.path().join("b.png"), 40, 40);
        fs::create_dir(dir.path().join("a.txt")).unwrap();

        let pipeline = CaptionPipeline::new(SizeModel::boxed());
        let options = BatchOptions {
            crop: Some(TargetSize::new(16, 16).unwrap()),
            ..BatchOptions::default()
        };
        let report = pipeline.caption_dir(dir.path(), &options).await.unwrap();

        assert_eq!(report.captioned(), 1);
        assert_eq!(report.captions[0].image, dir.path().join("b.png"));
        assert_eq!(report.failed, vec![dir.path().join("a.png")]);
        assert!(dir.path().join("b.txt").is_file());
        assert!(!dir.path().join(CROP_DIR_NAME).exists());

        // Nothing is left behind, so the next run can crop again
        fs::remove_dir(dir.path().join("a.txt")).unwrap();
        let report = pipeline.caption_dir(dir.path(), &options).await.unwrap();
        assert_eq!(report.captioned(), 2);
    }

    #[tokio::test]
    async fn test_caption_dir_refuses_existing_scratch_folder() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("a.png"), 20, 20);
        fs::create_dir(dir.path().join(CROP_DIR_NAME)).unwrap();
        fs::write(dir.path().join(CROP_DIR_NAME).join("keep.txt"), "mine").unwrap();

        let pipeline = CaptionPipeline::new(SizeModel::boxed());
        let options = BatchOptions {
            crop: Some(TargetSize::new(8, 8).unwrap()),
            ..BatchOptions::default()
        };
        assert!(pipeline.caption_dir(dir.path(), &options).await.is_err());
        assert!(dir.path().join(CROP_DIR_NAME).join("keep.txt").exists());
    }
}
