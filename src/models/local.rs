//! Local captioning with an ONNX export of a vision-language model.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use tracing::info;

use super::decoder::{clamp_max_tokens, TextDecoder, DEFAULT_MAX_TOKENS};
use super::encoder::VisionEncoder;
use super::preprocessing::{preprocess_for_encoder, ENCODER_INPUT_SIZE};
use super::CaptionModel;
use crate::error::Error;

/// Prompt the decoder continues from
pub const DEFAULT_LOCAL_PROMPT: &str = "A photo of";

const ENCODER_FILES: &[&str] = &["vision_encoder.onnx", "encoder.onnx"];
const DECODER_FILES: &[&str] = &["decoder_model.onnx", "decoder.onnx"];
const EMBED_FILE: &str = "embed_tokens.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Generation settings for the local model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalOptions {
    pub prompt: String,
    pub max_tokens: usize,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_LOCAL_PROMPT.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Vision encoder + text decoder loaded from one model directory
#[derive(Debug)]
pub struct OnnxCaptioner {
    encoder: VisionEncoder,
    decoder: TextDecoder,
    prompt: String,
    name: String,
}

impl OnnxCaptioner {
    /// Load all model artifacts from `model_dir`
    ///
    /// Expected files:
    /// - `vision_encoder.onnx` or `encoder.onnx`
    /// - `decoder_model.onnx` or `decoder.onnx`
    /// - `embed_tokens.onnx`
    /// - `tokenizer.json`
    pub fn load(model_dir: &Path, options: LocalOptions) -> Result<Self> {
        if !model_dir.is_dir() {
            return Err(Error::ModelNotFound {
                dir: model_dir.to_path_buf(),
                detail: "model directory does not exist".to_string(),
            }
            .into());
        }

        info!("Loading captioning model from {}", model_dir.display());
        let encoder_path = find_model_file(model_dir, ENCODER_FILES)?;
        let decoder_path = find_model_file(model_dir, DECODER_FILES)?;
        let embed_path = find_model_file(model_dir, &[EMBED_FILE])?;
        let tokenizer_path = find_model_file(model_dir, &[TOKENIZER_FILE])?;

        let encoder = VisionEncoder::new(&encoder_path)?;
        let decoder = TextDecoder::new(&decoder_path, &embed_path, &tokenizer_path)?
            .with_max_tokens(clamp_max_tokens(options.max_tokens));

        let name = model_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());
        info!(
            "Captioning model {} ready (up to {} tokens per caption)",
            name,
            decoder.max_tokens()
        );

        Ok(Self {
            encoder,
            decoder,
            prompt: options.prompt,
            name,
        })
    }

    /// Caption an already decoded image
    pub fn caption(&self, image: &DynamicImage) -> Result<String> {
        let start = Instant::now();

        let pixels = preprocess_for_encoder(image, ENCODER_INPUT_SIZE);
        let features = self
            .encoder
            .encode(&pixels)
            .context("Failed to encode image")?;
        let prompt = (!self.prompt.is_empty()).then_some(self.prompt.as_str());
        let text = self
            .decoder
            .generate(&features, prompt)
            .context("Failed to generate caption")?;

        info!(
            "Generated {} chars in {}ms",
            text.len(),
            start.elapsed().as_millis()
        );
        Ok(text)
    }
}

#[async_trait]
impl CaptionModel for OnnxCaptioner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn describe(&self, image: &DynamicImage, _source: &Path) -> Result<String> {
        self.caption(image)
    }
}

/// First of `names` that exists in `dir`
fn find_model_file(dir: &Path, names: &[&str]) -> Result<PathBuf> {
    names
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            Error::ModelNotFound {
                dir: dir.to_path_buf(),
                detail: format!("tried {}", names.join(", ")),
            }
            .into()
        })
}
