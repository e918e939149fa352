//! Vision encoder: turns a preprocessed image into a sequence of features.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use ndarray::{Array2, Array4, ArrayViewD, Axis, Ix2};
use ort::session::Session;
use ort::value::Value;
use tracing::{debug, info};

use super::load_session;
use crate::error::Error;

/// Vision half of the captioning model
pub struct VisionEncoder {
    session: Mutex<Session>,
    input_name: String,
}

impl std::fmt::Debug for VisionEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionEncoder")
            .field("input_name", &self.input_name)
            .finish_non_exhaustive()
    }
}

impl VisionEncoder {
    /// Load the encoder from an ONNX file
    pub fn new(model_path: &Path) -> Result<Self> {
        if !model_path.is_file() {
            return Err(Error::ModelNotFound {
                dir: model_path.parent().unwrap_or(model_path).to_path_buf(),
                detail: format!("missing {}", model_path.display()),
            }
            .into());
        }

        let session = load_session(model_path).context("Failed to load vision encoder")?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "pixel_values".to_string());

        info!("Vision encoder loaded from {}", model_path.display());
        Ok(Self {
            session: Mutex::new(session),
            input_name,
        })
    }

    /// Encode an image tensor of shape [1, 3, H, W] into [seq_len, embed_dim]
    pub fn encode(&self, input: &Array4<f32>) -> Result<Array2<f32>> {
        let shape = input.shape();
        if shape[0] != 1 || shape[1] != 3 {
            return Err(Error::Inference(format!(
                "invalid encoder input shape {:?}, expected [1, 3, H, W]",
                shape
            ))
            .into());
        }

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("vision encoder session lock poisoned"))?;

        let input_value =
            Value::from_array(input.to_owned()).context("Failed to create input tensor")?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input_value])
            .map_err(|e| Error::Inference(format!("vision encoder: {e}")))?;

        let features = outputs[0]
            .try_extract_array::<f32>()
            .context("Failed to extract encoder output")?;
        let embeddings = to_embeddings(features)?;

        debug!(
            "Encoded image to {} x {} features",
            embeddings.nrows(),
            embeddings.ncols()
        );
        Ok(embeddings)
    }
}

/// Flatten encoder output to [seq_len, embed_dim]
///
/// Accepts [1, seq_len, embed_dim] or [seq_len, embed_dim].
pub fn to_embeddings(output: ArrayViewD<'_, f32>) -> Result<Array2<f32>> {
    let features = match output.ndim() {
        3 if output.shape()[0] == 1 => output.index_axis(Axis(0), 0).to_owned(),
        2 => output.to_owned(),
        _ => {
            return Err(Error::Inference(format!(
                "unexpected encoder output shape {:?}",
                output.shape()
            ))
            .into())
        }
    };

    features
        .into_dimensionality::<Ix2>()
        .context("Encoder output is not two-dimensional")
}
