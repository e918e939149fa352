//! Captioning through an OpenAI-compatible chat completions endpoint.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::DynamicImage;
use reqwest::Client;
use tracing::{debug, info};

use super::CaptionModel;
use crate::error::Error;

pub const DEFAULT_ENDPOINT: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_MODEL: &str = "qwen-vl-plus-latest";
pub const DEFAULT_REMOTE_PROMPT: &str =
    "Describe the content of this image in plain English. Keep it short.";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

// --- OpenAI-compatible serde structs ---

#[derive(serde::Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(serde::Serialize)]
struct ChatMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(serde::Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Connection and prompt settings for the remote model
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            prompt: DEFAULT_REMOTE_PROMPT.to_string(),
            max_tokens: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Client for a hosted vision-language model
pub struct RemoteCaptioner {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    prompt: String,
    max_tokens: Option<u32>,
}

impl RemoteCaptioner {
    pub fn new(options: RemoteOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let endpoint = options.endpoint.trim_end_matches('/').to_string();
        info!(
            "Remote captioner configured: endpoint={}, model={}",
            endpoint, options.model
        );

        Ok(Self {
            client,
            endpoint,
            api_key: options.api_key.filter(|k| !k.trim().is_empty()),
            model: options.model,
            prompt: options.prompt,
            max_tokens: options.max_tokens,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let mut builder = self.client.post(self.completions_url()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Inference(format!("request to {} failed: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Inference(format!("endpoint returned {status}: {body}")).into());
        }

        let chat: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;
        Ok(first_choice_text(chat))
    }

    /// Check the endpoint accepts our credentials with a one-token request
    pub async fn verify(&self) -> Result<()> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: serde_json::Value::String("test".to_string()),
            }],
            max_tokens: Some(1),
        };
        self.complete(&request)
            .await
            .context("API key verification failed")?;
        info!("API key verified against {}", self.endpoint);
        Ok(())
    }
}

#[async_trait]
impl CaptionModel for RemoteCaptioner {
    fn name(&self) -> &str {
        &self.model
    }

    async fn describe(&self, _image: &DynamicImage, source: &Path) -> Result<String> {
        let start = Instant::now();
        let bytes = tokio::fs::read(source)
            .await
            .context(format!("Failed to read image: {}", source.display()))?;
        let request = describe_request(&self.model, &self.prompt, self.max_tokens, &bytes, source);

        let text = self.complete(&request).await?;
        debug!(
            "Remote caption for {} in {}ms",
            source.display(),
            start.elapsed().as_millis()
        );
        Ok(text)
    }
}

fn describe_request(
    model: &str,
    prompt: &str,
    max_tokens: Option<u32>,
    bytes: &[u8],
    source: &Path,
) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: serde_json::json!([
                {"type": "text", "text": prompt},
                {"type": "image_url", "image_url": {"url": image_data_url(bytes, source)}}
            ]),
        }],
        max_tokens,
    }
}

fn first_choice_text(response: ChatResponse) -> String {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default()
}

/// MIME type for an image path, by extension
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

/// Inline the image bytes as a base64 `data:` URL
pub fn image_data_url(bytes: &[u8], path: &Path) -> String {
    format!("data:{};base64,{}", mime_type(path), STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_options_default() {
        let options = RemoteOptions::default();
        assert_eq!(options.model, "qwen-vl-plus-latest");
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert!(options.api_key.is_none());
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let captioner = RemoteCaptioner::new(RemoteOptions {
            endpoint: "http://localhost:8081/v1/".to_string(),
            ..RemoteOptions::default()
        })
        .unwrap();
        assert_eq!(
            captioner.completions_url(),
            "http://localhost:8081/v1/chat/completions"
        );
    }

    #[test]
    fn test_blank_api_key_is_dropped() {
        let captioner = RemoteCaptioner::new(RemoteOptions {
            api_key: Some("   ".to_string()),
            ..RemoteOptions::default()
        })
        .unwrap();
        assert!(captioner.api_key.is_none());
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(mime_type(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_type(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_type(Path::new("a.webp")), "image/webp");
        assert_eq!(mime_type(Path::new("a.png")), "image/png");
        assert_eq!(mime_type(Path::new("noext")), "image/png");
    }

    #[test]
    fn test_image_data_url() {
        let url = image_data_url(b"abc", Path::new("x.jpg"));
        assert_eq!(url, "data:image/jpeg;base64,YWJj");
    }

    #[test]
    fn test_describe_request_format() {
        let request = describe_request("qwen-vl", "Describe.", None, b"abc", Path::new("x.png"));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "qwen-vl");
        assert!(json.get("max_tokens").is_none());
        let content = &json["messages"][0]["content"];
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "Describe.");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,YWJj");
    }

    #[test]
    fn test_response_parsing() {
        let json = serde_json::json!({
            "choices": [{
                "message": { "role": "assistant", "content": "A cat on a windowsill." }
            }],
            "usage": { "total_tokens": 42 }
        });
        let response: ChatResponse = serde_json::from_value(json).unwrap();
        assert_eq!(first_choice_text(response), "A cat on a windowsill.");
    }

    #[test]
    fn test_response_without_content() {
        let json = serde_json::json!({ "choices": [{ "message": { "content": null } }] });
        let response: ChatResponse = serde_json::from_value(json).unwrap();
        assert_eq!(first_choice_text(response), "");

        let json = serde_json::json!({ "choices": [] });
        let response: ChatResponse = serde_json::from_value(json).unwrap();
        assert_eq!(first_choice_text(response), "");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_inference_error() {
        let captioner = RemoteCaptioner::new(RemoteOptions {
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_secs(2),
            ..RemoteOptions::default()
        })
        .unwrap();
        let err = captioner.verify().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Inference(_))
        ));
    }
}
