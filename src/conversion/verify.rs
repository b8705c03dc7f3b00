//! Post-encode verification.
//!
//! Runs after the encoder returns and checks, in order:
//! 1. the output file exists
//! 2. the output read back independently has the target shape
//! 3. the output bytes differ from the input bytes
//! 4. input and output sizes, compared against whether the input already
//!    had the target shape
//!
//! The first three are hard failures. The size comparison only classifies.

use crate::audio::fingerprint::file_digest;
use crate::audio::{AudioBackend, AudioFormat};
use crate::error::ConversionError;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

/// Accepted difference between the read-back and target sample rate.
pub const SAMPLE_RATE_TOLERANCE_HZ: u32 = 10;

/// Relative size difference below which input and output count as "the
/// same size".
pub const SIZE_SIMILARITY_THRESHOLD: f64 = 0.05;

/// Outcome of the input/output size comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    /// Sizes differ noticeably
    Distinct,
    /// Sizes are close and the input already had the target shape
    ExpectedNoOp,
    /// Sizes are close although the input had a different shape
    Suspicious,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub input_size: u64,
    pub output_size: u64,
    pub input_digest: String,
    pub output_digest: String,
    pub output_format: AudioFormat,
    pub size_check: SizeCheck,
}

/// Check the encoded `output` against `target` and against `input`.
pub fn verify_output(
    backend: &dyn AudioBackend,
    input: &Path,
    output: &Path,
    original: &AudioFormat,
    target: &AudioFormat,
) -> Result<Verification, ConversionError> {
    if !output.is_file() {
        error!(output = %output.display(), "Encoder reported success but produced no file");
        return Err(ConversionError::ConversionFailed("no output file was produced".to_string()));
    }

    let output_format = backend.inspect(output).map_err(|e| {
        error!(output = %output.display(), error = %format!("{:#}", e), "Could not read back converted file");
        ConversionError::OutputValidationFailed("converted file could not be read back".to_string())
    })?;

    if !output_format.conforms_to(target, SAMPLE_RATE_TOLERANCE_HZ) {
        error!(?output_format, ?target, "Converted file has the wrong shape");
        return Err(ConversionError::OutputValidationFailed(format!(
            "converted file has incorrect audio properties: channels={}, rate={}, width={}",
            output_format.channels,
            output_format.sample_rate,
            output_format.bit_depth / 8
        )));
    }

    let (input_digest, output_digest) = file_digest(input)
        .and_then(|i| file_digest(output).map(|o| (i, o)))
        .map_err(|e| {
            error!(error = %format!("{:#}", e), "Could not fingerprint files");
            ConversionError::ConversionFailed("could not fingerprint files".to_string())
        })?;

    info!(input_digest = %input_digest, output_digest = %output_digest, "File digests");

    if input_digest == output_digest {
        error!("Output is byte-identical to input");
        return Err(ConversionError::ConversionFailed(
            "conversion did not change the audio file".to_string(),
        ));
    }

    let (input_size, output_size) = file_size(input)
        .and_then(|i| file_size(output).map(|o| (i, o)))
        .map_err(|e| {
            error!(error = %e, "Could not stat files");
            ConversionError::ConversionFailed("could not read file sizes".to_string())
        })?;

    let size_check = classify_sizes(input_size, output_size, original, target);
    match size_check {
        SizeCheck::Distinct => {
            info!(input_size, output_size, "Input and output sizes differ as expected");
        }
        SizeCheck::ExpectedNoOp => {
            info!(
                input_size,
                output_size,
                "Input already had the target format, similar output size is expected"
            );
        }
        SizeCheck::Suspicious => {
            warn!(
                input_size,
                output_size,
                ?original,
                "Output size is suspiciously close to the input size"
            );
        }
    }

    Ok(Verification {
        input_size,
        output_size,
        input_digest,
        output_digest,
        output_format,
        size_check,
    })
}

/// Classify an input/output size pair. Sizes count as similar when they
/// differ by less than 5% of the input size.
pub fn classify_sizes(input_size: u64, output_size: u64, original: &AudioFormat, target: &AudioFormat) -> SizeCheck {
    let difference = input_size.abs_diff(output_size) as f64;
    if difference >= input_size as f64 * SIZE_SIMILARITY_THRESHOLD {
        SizeCheck::Distinct
    } else if original.conforms_to(target, SAMPLE_RATE_TOLERANCE_HZ) {
        SizeCheck::ExpectedNoOp
    } else {
        SizeCheck::Suspicious
    }
}

fn file_size(path: &Path) -> std::io::Result<u64> {
    fs::metadata(path).map(|m| m.len())
}
