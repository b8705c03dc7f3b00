//! # Conversion Pipeline
//!
//! Drives one task from `processing` to a terminal state:
//!
//! ```text
//! probe(5) → decode(10) → mix(30) → resample(50) → requantize(70)
//!          → encode(85) → verify(95) → complete(100)
//! ```
//!
//! Every stage failure is caught here, turned into an `error` record and
//! logged with its full detail. Nothing escapes to whoever launched the run.
//! The pipeline is synchronous and CPU bound; callers run it on a blocking
//! worker.

use super::reporter::TaskReporter;
use super::verify::{self, Verification};
use crate::audio::normalize::{self, NormalizeStep, StepOutcome};
use crate::audio::{AudioBackend, AudioFormat};
use crate::error::ConversionError;
use crate::tasks::record::{CompletedOutput, TaskRecord};
use crate::tasks::store::TaskId;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Progress checkpoints written while a task is processing.
pub mod milestones {
    pub const STARTED: u8 = 0;
    pub const PROBE: u8 = 5;
    pub const DECODE: u8 = 10;
    pub const CHANNEL_MIX: u8 = 30;
    pub const RESAMPLE: u8 = 50;
    pub const REQUANTIZE: u8 = 70;
    pub const ENCODE: u8 = 85;
    pub const VERIFY: u8 = 95;
}

/// Everything the pipeline needs to know about one accepted upload.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub task_id: TaskId,
    pub input_path: PathBuf,
    /// Client-facing name of the upload, used to derive the output name
    pub display_name: String,
    pub output_dir: PathBuf,
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub output: CompletedOutput,
    pub steps: Vec<(NormalizeStep, StepOutcome)>,
    pub verification: Verification,
}

pub struct ConversionPipeline {
    backend: Arc<dyn AudioBackend>,
    target: AudioFormat,
}

impl ConversionPipeline {
    pub fn new(backend: Arc<dyn AudioBackend>, target: AudioFormat) -> Self {
        Self { backend, target }
    }

    /// Run the job to a terminal state, publishing every step through
    /// `reporter`. Returns the report on success.
    pub fn run(&self, job: &ConversionJob, reporter: &TaskReporter) -> Result<ConversionReport, ConversionError> {
        info!(task_id = %job.task_id, input = %job.input_path.display(), "Starting conversion");
        reporter.progress(milestones::STARTED);

        match self.execute(job, reporter) {
            Ok(report) => {
                info!(
                    task_id = %job.task_id,
                    filename = %report.output.filename,
                    original_size = report.output.original_size,
                    converted_size = report.output.converted_size,
                    steps = ?report.steps,
                    size_check = ?report.verification.size_check,
                    "Conversion complete"
                );
                reporter.finish(TaskRecord::complete(report.output.clone()));
                Ok(report)
            }
            Err(err) => {
                error!(task_id = %job.task_id, kind = %err.kind(), error = %err, "Conversion failed");
                reporter.fail(&err);
                Err(err)
            }
        }
    }

    fn execute(&self, job: &ConversionJob, reporter: &TaskReporter) -> Result<ConversionReport, ConversionError> {
        let input = job.input_path.as_path();

        reporter.progress(milestones::PROBE);
        let info = self.backend.probe(input).map_err(|e| {
            warn!(task_id = %job.task_id, error = %format!("{:#}", e), "Probe rejected input");
            ConversionError::InvalidInput
        })?;
        debug!(
            task_id = %job.task_id,
            codec = %info.codec,
            sample_rate = info.sample_rate,
            channels = ?info.channels,
            "Probed input"
        );

        reporter.progress(milestones::DECODE);
        let audio = self.backend.decode(input).map_err(|e| {
            warn!(task_id = %job.task_id, error = %format!("{:#}", e), "Decode failed");
            ConversionError::InvalidInput
        })?;
        let original = audio.format();
        info!(
            task_id = %job.task_id,
            channels = original.channels,
            sample_rate = original.sample_rate,
            bit_depth = original.bit_depth,
            frames = audio.frames(),
            "Decoded input"
        );

        let mut steps = Vec::with_capacity(3);

        reporter.progress(milestones::CHANNEL_MIX);
        let (audio, outcome) = normalize::mix_channels(audio, self.target.channels);
        log_step(job.task_id, NormalizeStep::ChannelMix, outcome);
        steps.push((NormalizeStep::ChannelMix, outcome));

        reporter.progress(milestones::RESAMPLE);
        let (audio, outcome) = normalize::resample(audio, self.target.sample_rate).map_err(|e| {
            error!(task_id = %job.task_id, error = %format!("{:#}", e), "Resampling failed");
            ConversionError::ConversionFailed("resampling failed".to_string())
        })?;
        log_step(job.task_id, NormalizeStep::Resample, outcome);
        steps.push((NormalizeStep::Resample, outcome));

        reporter.progress(milestones::REQUANTIZE);
        let (audio, outcome) = normalize::requantize(audio, self.target.bit_depth);
        log_step(job.task_id, NormalizeStep::Requantize, outcome);
        steps.push((NormalizeStep::Requantize, outcome));

        reporter.progress(milestones::ENCODE);
        let filename = output_filename(&job.display_name, &self.target);
        let output_path = job.output_dir.join(format!("{}_{}", job.task_id, filename));
        let comment = format!("task {}", job.task_id);
        self.backend
            .encode(&audio, &self.target, &comment, &output_path)
            .map_err(|e| {
                error!(task_id = %job.task_id, error = %format!("{:#}", e), "Encoding failed");
                ConversionError::ConversionFailed("encoding failed".to_string())
            })?;

        reporter.progress(milestones::VERIFY);
        let verification = verify::verify_output(self.backend.as_ref(), input, &output_path, &original, &self.target)?;

        Ok(ConversionReport {
            output: CompletedOutput {
                output_path,
                filename,
                original_size: verification.input_size,
                converted_size: verification.output_size,
                original_format: original,
            },
            steps,
            verification,
        })
    }
}

fn log_step(task_id: TaskId, step: NormalizeStep, outcome: StepOutcome) {
    info!(task_id = %task_id, ?step, ?outcome, "Normalize step");
}

/// Name offered for download: `<stem>_<mono|Nch>_<8khz|Nhz>_<bits>bit.wav`.
pub fn output_filename(display_name: &str, target: &AudioFormat) -> String {
    let stem = Path::new(display_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("audio");

    let channels = match target.channels {
        1 => "mono".to_string(),
        n => format!("{}ch", n),
    };
    let rate = if target.sample_rate % 1000 == 0 {
        format!("{}khz", target.sample_rate / 1000)
    } else {
        format!("{}hz", target.sample_rate)
    };

    format!("{}_{}_{}_{}bit.wav", stem, channels, rate, target.bit_depth)
}
