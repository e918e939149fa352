//! Error types shared by the slicer and the caption generator.

use std::path::PathBuf;

use thiserror::Error;

/// Failures the tools report to the user.
///
/// Library functions return `anyhow::Result` and wrap these with context, so
/// callers that care about the kind can `downcast_ref::<Error>()`.
#[derive(Debug, Error)]
pub enum Error {
    /// The input path does not exist or is not a regular file.
    #[error("input not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but is not a decodable raster image.
    #[error("failed to decode image {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Model weights or tokenizer files are missing.
    #[error("model files not found in {}: {detail}", .dir.display())]
    ModelNotFound { dir: PathBuf, detail: String },

    /// The model ran but failed to produce output.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The model produced only whitespace.
    #[error("model returned an empty caption for {}", .0.display())]
    EmptyCaption(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
