//! img-slice - split an image into region files, or focus-crop images

use anyhow::Result;
use clap::Parser;
use serde_json::json;

use slice_caption::cli::{init_logging, OutputFormat, SliceCli, SliceMode};
use slice_caption::slicer::{
    crop_dir, crop_file, default_crop_dir, default_output_dir, slice_file, SliceOptions,
    TargetSize,
};

fn main() -> Result<()> {
    let cli = SliceCli::parse();
    init_logging(cli.verbose);

    match cli.mode {
        SliceMode::Regions => run_regions(&cli),
        SliceMode::Focus => run_focus(&cli),
    }
}

fn run_regions(cli: &SliceCli) -> Result<()> {
    let output_dir = cli
        .output
        .clone()
        .unwrap_or_else(|| default_output_dir(&cli.input));
    let options = SliceOptions {
        min_area: cli.min_area,
        padding: cli.padding,
    };

    let regions = slice_file(&cli.input, &output_dir, &options)?;

    match cli.format {
        OutputFormat::Json => {
            let json = json!({
                "input": cli.input,
                "output_dir": output_dir,
                "regions": regions,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("Image: {}", cli.input.display());
            println!("Regions: {}", regions.len());
            for region in &regions {
                println!(
                    "  {:>3}: ({}, {}, {}, {}) -> {}",
                    region.index,
                    region.bbox.x1,
                    region.bbox.y1,
                    region.bbox.x2,
                    region.bbox.y2,
                    region.path.display()
                );
            }
        }
    }
    Ok(())
}

fn run_focus(cli: &SliceCli) -> Result<()> {
    let target = TargetSize::new(cli.width, cli.height)?;
    let output_dir = cli
        .output
        .clone()
        .unwrap_or_else(|| default_crop_dir(&cli.input));

    if cli.input.is_dir() {
        let report = crop_dir(&cli.input, &output_dir, target, cli.recursive)?;
        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => {
                println!(
                    "Cropped {} image(s) to {} in {}",
                    report.written.len(),
                    target,
                    output_dir.display()
                );
                for failed in &report.failed {
                    println!("  failed: {}", failed.display());
                }
            }
        }
        return Ok(());
    }

    let file_name = cli.input.file_name().unwrap_or_default();
    let output = output_dir.join(file_name);
    crop_file(&cli.input, &output, target)?;

    match cli.format {
        OutputFormat::Json => {
            let json = json!({ "input": cli.input, "output": output, "size": target });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => println!("{}", output.display()),
    }
    Ok(())
}
