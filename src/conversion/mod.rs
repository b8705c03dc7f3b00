//! # Conversion Module
//!
//! The worker routine that turns one uploaded file into the target format
//! and proves it did so.
//!
//! ## Key Components:
//! - **pipeline**: stage sequencing, progress milestones, error capture
//! - **reporter**: the only path by which a running task writes its record
//! - **verify**: post-encode checks on the produced file

pub mod pipeline;
pub mod reporter;
pub mod verify;

pub use pipeline::{ConversionJob, ConversionPipeline};
pub use reporter::TaskReporter;
