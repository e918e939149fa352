//! Text decoder: greedy autoregressive generation conditioned on image
//! features.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use ndarray::{Array2, Array3, ArrayViewD, Axis};
use ort::session::Session;
use ort::value::Value;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use super::load_session;
use crate::error::Error;

/// Default maximum tokens to generate
pub const DEFAULT_MAX_TOKENS: usize = 150;

/// Minimum tokens to generate
pub const MIN_TOKENS: usize = 10;

/// Maximum tokens to generate
pub const MAX_TOKENS: usize = 500;

/// How many of the most recent tokens may not be picked again
pub const REPEAT_WINDOW: usize = 5;

const SPECIAL_TOKENS: &[&str] = &[
    "<s>", "</s>", "<pad>", "<cap>", "</cap>", "<dcap>", "</dcap>", "<ncap>", "</ncap>",
];

/// Language half of the captioning model
///
/// Needs three artifacts: the decoder graph, a token embedding graph
/// (`embed_tokens.onnx`, next to the decoder) and the tokenizer.
pub struct TextDecoder {
    session: Mutex<Session>,
    embed_session: Mutex<Session>,
    tokenizer: Tokenizer,
    max_tokens: usize,
    bos_token_id: u32,
    eos_token_id: u32,
}

impl std::fmt::Debug for TextDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextDecoder")
            .field("max_tokens", &self.max_tokens)
            .field("bos_token_id", &self.bos_token_id)
            .field("eos_token_id", &self.eos_token_id)
            .finish_non_exhaustive()
    }
}

impl TextDecoder {
    /// Load the decoder, its token embedder and the tokenizer
    pub fn new(model_path: &Path, embed_path: &Path, tokenizer_path: &Path) -> Result<Self> {
        for path in [model_path, embed_path, tokenizer_path] {
            if !path.is_file() {
                return Err(Error::ModelNotFound {
                    dir: path.parent().unwrap_or(path).to_path_buf(),
                    detail: format!("missing {}", path.display()),
                }
                .into());
            }
        }

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        info!(
            "Loaded tokenizer with {} tokens",
            tokenizer.get_vocab_size(true)
        );

        let embed_session = load_session(embed_path).context("Failed to load token embedder")?;
        let session = load_session(model_path).context("Failed to load text decoder")?;

        let bos_token_id = tokenizer
            .token_to_id("<s>")
            .or_else(|| tokenizer.token_to_id("[CLS]"))
            .unwrap_or(0);
        let eos_token_id = tokenizer
            .token_to_id("</s>")
            .or_else(|| tokenizer.token_to_id("[SEP]"))
            .unwrap_or(2);
        debug!("Special tokens - BOS: {}, EOS: {}", bos_token_id, eos_token_id);

        info!("Text decoder loaded from {}", model_path.display());
        Ok(Self {
            session: Mutex::new(session),
            embed_session: Mutex::new(embed_session),
            tokenizer,
            max_tokens: DEFAULT_MAX_TOKENS,
            bos_token_id,
            eos_token_id,
        })
    }

    /// Set the maximum tokens to generate
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = clamp_max_tokens(max_tokens);
        self
    }

    /// Generation limit after clamping
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Generate text from image features of shape [seq_len, embed_dim]
    ///
    /// Generation starts from BOS followed by the prompt tokens and stops at
    /// EOS or after `max_tokens` new tokens. The prompt is part of the
    /// returned text.
    pub fn generate(&self, image_features: &Array2<f32>, prompt: Option<&str>) -> Result<String> {
        let mut tokens = vec![self.bos_token_id];
        if let Some(prompt) = prompt {
            let encoding = self
                .tokenizer
                .encode(prompt, false)
                .map_err(|e| anyhow!("Failed to encode prompt: {}", e))?;
            tokens.extend(
                encoding
                    .get_ids()
                    .iter()
                    .copied()
                    .filter(|&id| id != self.bos_token_id && id != self.eos_token_id),
            );
        }
        debug!("Prompt {:?} -> {} initial tokens", prompt, tokens.len());

        let variance = feature_variance(image_features);
        if variance.is_nan() {
            warn!("Image features contain NaN values");
        } else if variance < 1e-3 {
            warn!("Image features have very low variance ({:.6})", variance);
        }

        let prompt_len = tokens.len();
        let encoder_states = image_features.clone().insert_axis(Axis(0));
        for step in 0..self.max_tokens {
            let logits = self.forward(&encoder_states, &tokens)?;
            let next = pick_next_token(&logits, &tokens, self.bos_token_id, REPEAT_WINDOW)
                .ok_or_else(|| Error::Inference("decoder produced no logits".to_string()))?;

            if next == self.eos_token_id {
                debug!("EOS after {} generated tokens", step);
                break;
            }
            tokens.push(next);
        }

        if generated_count(&tokens, prompt_len) == 0 {
            debug!("Decoder generated nothing past the prompt");
            return Ok(String::new());
        }

        let text = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!("Decoding failed: {}", e))?;
        Ok(clean_caption(&text))
    }

    fn embed_tokens(&self, ids: &[u32]) -> Result<Array3<f32>> {
        let mut session = self
            .embed_session
            .lock()
            .map_err(|_| anyhow!("token embedder session lock poisoned"))?;

        let input_ids = Array2::<i64>::from_shape_vec(
            (1, ids.len()),
            ids.iter().map(|&id| id as i64).collect(),
        )?;
        let input_value =
            Value::from_array(input_ids).context("Failed to create input IDs tensor")?;

        let outputs = session
            .run(ort::inputs!["input_ids" => input_value])
            .map_err(|e| Error::Inference(format!("token embedder: {e}")))?;
        let embeds = outputs[0]
            .try_extract_array::<f32>()
            .context("Failed to extract token embeddings")?;

        embeds
            .to_owned()
            .into_dimensionality::<ndarray::Ix3>()
            .context("Token embeddings are not three-dimensional")
    }

    fn forward(&self, encoder_states: &Array3<f32>, ids: &[u32]) -> Result<Vec<f32>> {
        let inputs_embeds = self.embed_tokens(ids)?;
        let seq_len = encoder_states.shape()[1];

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("text decoder session lock poisoned"))?;

        let encoder_value = Value::from_array(encoder_states.clone())
            .context("Failed to create encoder hidden states tensor")?;
        let mask_value = Value::from_array(Array2::<i64>::ones((1, seq_len)))
            .context("Failed to create encoder attention mask tensor")?;
        let embeds_value =
            Value::from_array(inputs_embeds).context("Failed to create inputs_embeds tensor")?;

        let outputs = session
            .run(ort::inputs![
                "encoder_hidden_states" => encoder_value,
                "encoder_attention_mask" => mask_value,
                "inputs_embeds" => embeds_value
            ])
            .map_err(|e| Error::Inference(format!("text decoder: {e}")))?;
        let logits = outputs[0]
            .try_extract_array::<f32>()
            .context("Failed to extract decoder logits")?;

        last_position_logits(logits)
    }
}

/// Clamp a requested generation length into the supported range
pub fn clamp_max_tokens(max_tokens: usize) -> usize {
    max_tokens.clamp(MIN_TOKENS, MAX_TOKENS)
}

/// Logits of the final sequence position from [1, seq, vocab] or [seq, vocab]
pub fn last_position_logits(logits: ArrayViewD<'_, f32>) -> Result<Vec<f32>> {
    let shape = logits.shape().to_vec();
    let row = match shape.as_slice() {
        [1, seq, vocab] if *seq > 0 => (0..*vocab)
            .map(|v| logits[&[0, seq - 1, v][..]])
            .collect(),
        [seq, vocab] if *seq > 0 => (0..*vocab)
            .map(|v| logits[&[seq - 1, v][..]])
            .collect(),
        _ => {
            return Err(
                Error::Inference(format!("unexpected decoder output shape {:?}", shape)).into(),
            )
        }
    };
    Ok(row)
}

/// Number of tokens produced after the starting BOS + prompt sequence
pub fn generated_count(tokens: &[u32], prompt_len: usize) -> usize {
    tokens.len().saturating_sub(prompt_len)
}

/// Greedy choice that skips BOS and the last `window` tokens
pub fn pick_next_token(logits: &[f32], history: &[u32], bos: u32, window: usize) -> Option<u32> {
    let masked: HashSet<u32> = history
        .iter()
        .rev()
        .take(window)
        .copied()
        .chain(std::iter::once(bos))
        .collect();

    logits
        .iter()
        .enumerate()
        .filter(|(idx, _)| !masked.contains(&(*idx as u32)))
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(idx, _)| idx as u32)
}

/// Strip special and task tokens left in decoded text
pub fn clean_caption(text: &str) -> String {
    let mut cleaned = text.to_string();
    for token in SPECIAL_TOKENS {
        cleaned = cleaned.replace(token, "");
    }
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn feature_variance(features: &Array2<f32>) -> f32 {
    if features.is_empty() {
        return 0.0;
    }
    let mean = features.iter().sum::<f32>() / features.len() as f32;
    features.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / features.len() as f32
}
