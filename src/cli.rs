//! Command-line interfaces for the slicer and the caption generator.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::models::decoder::DEFAULT_MAX_TOKENS;
use crate::models::remote::{DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_TIMEOUT_SECS};
use crate::slicer::TargetSize;

/// img-slice - Split an image into its regions, or crop it around its focus
#[derive(Parser, Debug)]
#[command(name = "img-slice", version, about)]
pub struct SliceCli {
    /// Input image (or directory, in focus mode)
    #[arg(long, value_name = "PATH")]
    pub input: PathBuf,

    /// Output directory (defaults next to the input)
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// What to produce: one file per region, or one focus crop per image
    #[arg(long, default_value = "regions", value_name = "MODE")]
    pub mode: SliceMode,

    /// Ignore regions whose bounding box covers fewer pixels
    #[arg(long, default_value = "64", value_name = "PIXELS")]
    pub min_area: u64,

    /// Margin added around each region
    #[arg(long, default_value = "0", value_name = "PIXELS")]
    pub padding: u32,

    /// Focus crop width
    #[arg(long, default_value = "1024")]
    pub width: u32,

    /// Focus crop height
    #[arg(long, default_value = "1024")]
    pub height: u32,

    /// Descend into subdirectories (focus mode on a directory)
    #[arg(long)]
    pub recursive: bool,

    /// Output format
    #[arg(long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Verbose logging (can be repeated: -v, -vv)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// img-caption - Describe images with a pretrained vision-language model
#[derive(Parser, Debug)]
#[command(name = "img-caption", version, about)]
pub struct CaptionCli {
    /// Image to caption; the caption is printed to stdout
    #[arg(long, value_name = "PATH", required_unless_present = "dir", conflicts_with = "dir")]
    pub image: Option<PathBuf>,

    /// Caption every image in a directory, writing <name>.txt next to each
    #[arg(long, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Model backend
    #[arg(long, default_value = "onnx", value_name = "BACKEND")]
    pub backend: Backend,

    /// Directory holding the ONNX model files and tokenizer.json
    #[arg(long, default_value = "models/vlm", value_name = "DIR", env = "CAPTION_MODEL_DIR")]
    pub model_dir: PathBuf,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, default_value = DEFAULT_ENDPOINT, value_name = "URL", env = "CAPTION_ENDPOINT")]
    pub endpoint: String,

    /// API key for the remote backend
    #[arg(long, value_name = "KEY", env = "CAPTION_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Remote model name
    #[arg(long, default_value = DEFAULT_MODEL, value_name = "NAME", env = "CAPTION_MODEL")]
    pub model: String,

    /// Prompt override (backend default when omitted)
    #[arg(long, value_name = "TEXT")]
    pub prompt: Option<String>,

    /// Maximum tokens to generate
    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS, value_name = "N")]
    pub max_tokens: usize,

    /// Remote request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, value_name = "SECS")]
    pub timeout_secs: u64,

    /// Also write <name>.txt next to a single --image
    #[arg(long)]
    pub sidecar: bool,

    /// Rename images to 001.ext, 002.ext, ... before captioning (--dir only)
    #[arg(long, requires = "dir")]
    pub rename: bool,

    /// Focus-crop images to WIDTHxHEIGHT before captioning (--dir only)
    #[arg(long, value_name = "WxH", requires = "dir")]
    pub crop: Option<TargetSize>,

    /// Replace originals with their crops instead of discarding the crops
    #[arg(long, requires = "crop")]
    pub keep_cropped: bool,

    /// Send a one-token request to check the API key before captioning
    #[arg(long)]
    pub verify_key: bool,

    /// Output format
    #[arg(long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Verbose logging (can be repeated: -v, -vv)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "text" => Ok(OutputFormat::Text),
            _ => Err(format!("Unknown format: {}. Use 'json' or 'text'", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Text => write!(f, "text"),
        }
    }
}

/// Slicer mode selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceMode {
    Regions,
    Focus,
}

impl std::str::FromStr for SliceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "regions" => Ok(SliceMode::Regions),
            "focus" => Ok(SliceMode::Focus),
            _ => Err(format!("Unknown mode: {}. Use 'regions' or 'focus'", s)),
        }
    }
}

/// Caption model backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Onnx,
    Api,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "onnx" | "local" => Ok(Backend::Onnx),
            "api" | "remote" => Ok(Backend::Api),
            _ => Err(format!("Unknown backend: {}. Use 'onnx' or 'api'", s)),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Onnx => write!(f, "onnx"),
            Backend::Api => write!(f, "api"),
        }
    }
}

/// Get tracing level from verbosity
pub fn get_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Log filter for a verbosity level
///
/// A non-empty `RUST_LOG` replaces the verbosity level entirely. Otherwise
/// ONNX Runtime's own logging stays at warn below `-vv`.
pub fn log_filter(verbose: u8, rust_log: Option<&str>) -> EnvFilter {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        return EnvFilter::new(directives);
    }

    let mut directives = get_log_level(verbose).to_string();
    if verbose < 2 {
        directives.push_str(",ort=warn");
    }
    EnvFilter::new(directives)
}

/// Install the stderr log subscriber
pub fn init_logging(verbose: u8) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, rust_log.as_deref()))
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("TEXT".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert!("jso".parse::<OutputFormat>().is_err());
        assert!("".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_output_format_display() {
        assert_eq!(OutputFormat::Json.to_string(), "json");
        assert_eq!(OutputFormat::Text.to_string(), "text");
    }

    #[test]
    fn test_slice_mode_parsing() {
        assert_eq!("regions".parse::<SliceMode>().unwrap(), SliceMode::Regions);
        assert_eq!("Focus".parse::<SliceMode>().unwrap(), SliceMode::Focus);
        assert!("crop".parse::<SliceMode>().is_err());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("onnx".parse::<Backend>().unwrap(), Backend::Onnx);
        assert_eq!("remote".parse::<Backend>().unwrap(), Backend::Api);
        assert!("cuda".parse::<Backend>().is_err());
        assert_eq!(Backend::Api.to_string(), "api");
    }

    #[test]
    fn test_log_level() {
        assert_eq!(get_log_level(0), "info");
        assert_eq!(get_log_level(1), "debug");
        assert_eq!(get_log_level(2), "trace");
        assert_eq!(get_log_level(255), "trace");
    }

    #[test]
    fn test_log_filter_from_verbosity() {
        assert_eq!(log_filter(0, None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter(1, Some("  ")).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(log_filter(2, None).max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn test_log_filter_rust_log_wins() {
        assert_eq!(log_filter(0, Some("warn")).max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(log_filter(2, Some("error")).max_level_hint(), Some(LevelFilter::ERROR));
        assert_eq!(
            log_filter(0, Some("ort=debug")).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
    }

    #[test]
    fn test_cli_definitions_are_valid() {
        SliceCli::command().debug_assert();
        CaptionCli::command().debug_assert();
    }

    #[test]
    fn test_slice_cli_defaults() {
        let cli = SliceCli::try_parse_from(["img-slice", "--input", "page.png"]).unwrap();
        assert_eq!(cli.input, PathBuf::from("page.png"));
        assert_eq!(cli.mode, SliceMode::Regions);
        assert_eq!(cli.min_area, 64);
        assert_eq!((cli.width, cli.height), (1024, 1024));
        assert!(cli.output.is_none());
    }

    #[test]
    fn test_slice_cli_requires_input() {
        assert!(SliceCli::try_parse_from(["img-slice"]).is_err());
    }

    #[test]
    fn test_caption_cli_single_image() {
        let cli = CaptionCli::try_parse_from(["img-caption", "--image", "cat.jpg"]).unwrap();
        assert_eq!(cli.image, Some(PathBuf::from("cat.jpg")));
        assert_eq!(cli.backend, Backend::Onnx);
        assert_eq!(cli.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_caption_cli_image_or_dir() {
        assert!(CaptionCli::try_parse_from(["img-caption"]).is_err());
        assert!(
            CaptionCli::try_parse_from(["img-caption", "--image", "a.png", "--dir", "imgs"]).is_err()
        );
    }

    #[test]
    fn test_caption_cli_batch_crop() {
        let cli = CaptionCli::try_parse_from([
            "img-caption",
            "--dir",
            "imgs",
            "--backend",
            "api",
            "--crop",
            "512x768",
            "--keep-cropped",
        ])
        .unwrap();
        assert_eq!(cli.backend, Backend::Api);
        assert_eq!(cli.crop, Some(TargetSize::new(512, 768).unwrap()));
        assert!(cli.keep_cropped);
    }

    #[test]
    fn test_caption_cli_crop_requires_dir() {
        assert!(
            CaptionCli::try_parse_from(["img-caption", "--image", "a.png", "--crop", "64x64"])
                .is_err()
        );
    }
}
