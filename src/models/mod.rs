//! Captioning models: a local ONNX vision-language model and a remote
//! OpenAI-compatible chat endpoint, behind one trait.

pub mod decoder;
pub mod encoder;
pub mod local;
pub mod preprocessing;
pub mod remote;

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use tracing::debug;

pub use local::{LocalOptions, OnnxCaptioner};
pub use preprocessing::preprocess_for_encoder;
pub use remote::{RemoteCaptioner, RemoteOptions};

/// A pretrained model that turns one image into a description
#[async_trait]
pub trait CaptionModel: Send + Sync {
    /// Name reported alongside each caption
    fn name(&self) -> &str;

    /// Describe `image`, which was decoded from `source`
    async fn describe(&self, image: &DynamicImage, source: &Path) -> Result<String>;
}

/// Open an ONNX model on the CPU execution provider
pub(crate) fn load_session(model_path: &Path) -> Result<Session> {
    debug!("Loading ONNX model from: {}", model_path.display());

    let session = Session::builder()
        .context("Failed to create ONNX Runtime session builder")?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .context("Failed to set CPU execution provider")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(4)
        .context("Failed to set intra threads")?
        .commit_from_file(model_path)
        .context(format!("Failed to load ONNX model: {}", model_path.display()))?;

    debug!(
        "Model loaded - inputs: {:?}, outputs: {:?}",
        session.inputs.iter().map(|i| &i.name).collect::<Vec<_>>(),
        session.outputs.iter().map(|o| &o.name).collect::<Vec<_>>()
    );
    Ok(session)
}
