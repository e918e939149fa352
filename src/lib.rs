#![doc = include_str!("../README.md")]

pub mod cli;
pub mod error;
pub mod io;
pub mod models;
pub mod pipeline;
pub mod slicer;
pub mod types;

pub use error::Error;
pub use models::CaptionModel;
pub use pipeline::{BatchOptions, CaptionPipeline};
pub use slicer::{SliceOptions, TargetSize};
pub use types::{BBox, BatchReport, Caption, Mask, Region};
