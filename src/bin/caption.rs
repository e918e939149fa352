//! img-caption - describe images with a pretrained vision-language model

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use slice_caption::cli::{init_logging, Backend, CaptionCli, OutputFormat};
use slice_caption::error::Error;
use slice_caption::io::sidecar_path;
use slice_caption::models::local::DEFAULT_LOCAL_PROMPT;
use slice_caption::models::remote::DEFAULT_REMOTE_PROMPT;
use slice_caption::models::{CaptionModel, LocalOptions, OnnxCaptioner, RemoteCaptioner, RemoteOptions};
use slice_caption::pipeline::{BatchOptions, CaptionPipeline};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = CaptionCli::parse();
    init_logging(cli.verbose);

    // Report a bad input before spending time on model loading
    if let Some(image) = &cli.image {
        if !image.is_file() {
            return Err(Error::NotFound(image.clone()).into());
        }
    }
    if let Some(dir) = &cli.dir {
        if !dir.is_dir() {
            return Err(Error::NotFound(dir.clone()).into());
        }
    }

    let model = load_model(&cli).await?;
    let pipeline = CaptionPipeline::new(model);
    tracing::info!("Using {} backend ({})", cli.backend, pipeline.model_name());

    if let Some(image) = &cli.image {
        let caption = pipeline.caption_file(image).await?;
        if cli.sidecar {
            let path = sidecar_path(image);
            fs::write(&path, &caption.text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&caption)?),
            OutputFormat::Text => println!("{}", caption.text),
        }
        return Ok(());
    }

    if let Some(dir) = &cli.dir {
        let options = BatchOptions {
            rename: cli.rename,
            crop: cli.crop,
            keep_cropped: cli.keep_cropped,
        };
        let report = pipeline.caption_dir(dir, &options).await?;
        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => {
                println!("Directory: {}", dir.display());
                if options.rename {
                    println!("Renamed: {}", report.renamed);
                }
                println!("Captioned: {}", report.captioned());
                println!("Failed: {}", report.failed.len());
                for failed in &report.failed {
                    println!("  {}", failed.display());
                }
            }
        }
    }

    Ok(())
}

async fn load_model(cli: &CaptionCli) -> Result<Box<dyn CaptionModel>> {
    match cli.backend {
        Backend::Onnx => {
            let options = LocalOptions {
                prompt: cli
                    .prompt
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LOCAL_PROMPT.to_string()),
                max_tokens: cli.max_tokens,
            };
            let model = OnnxCaptioner::load(&cli.model_dir, options)
                .context("Failed to load local captioning model")?;
            Ok(Box::new(model))
        }
        Backend::Api => {
            let options = RemoteOptions {
                endpoint: cli.endpoint.clone(),
                api_key: cli.api_key.clone(),
                model: cli.model.clone(),
                prompt: cli
                    .prompt
                    .clone()
                    .unwrap_or_else(|| DEFAULT_REMOTE_PROMPT.to_string()),
                max_tokens: u32::try_from(cli.max_tokens).ok(),
                timeout: Duration::from_secs(cli.timeout_secs),
            };
            let model = RemoteCaptioner::new(options)?;
            if cli.verify_key {
                model.verify().await?;
            }
            Ok(Box::new(model))
        }
    }
}
