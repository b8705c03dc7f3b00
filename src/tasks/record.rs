//! # Task Records
//!
//! A task record is the single source of truth about one conversion. Its
//! status is a tagged sum type: every variant carries exactly the fields that
//! make sense for it, so a "complete" record without an output path or an
//! "error" record with a progress value cannot be built.
//!
//! ## Persisted Shape:
//! Records are stored flat, with the variant name under `status`:
//! ```json
//! { "status": "processing", "progress": 50, "timestamp": "2025-01-01T12:00:00Z" }
//! { "status": "error", "error": "Invalid audio file format", "kind": "invalid_input", "timestamp": "..." }
//! ```

use crate::audio::AudioFormat;
use crate::error::{ConversionError, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Payload of a successfully converted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedOutput {
    /// Where the converted file lives on disk (never sent to clients)
    pub output_path: PathBuf,
    /// Name offered to the client when downloading
    pub filename: String,
    pub original_size: u64,
    pub converted_size: u64,
    pub original_format: AudioFormat,
}

/// Lifecycle state of a task.
///
/// ## State Transitions:
/// Pending → Processing → Complete | Error
///
/// Complete and Error are terminal; only deletion removes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing { progress: u8 },
    Complete(CompletedOutput),
    Error { error: String, kind: ErrorKind },
}

/// A task state plus the instant it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(flatten)]
    pub state: TaskState,
    /// Last update; drives retention
    pub timestamp: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            timestamp: Utc::now(),
        }
    }

    pub fn pending() -> Self {
        Self::new(TaskState::Pending)
    }

    pub fn processing(progress: u8) -> Self {
        Self::new(TaskState::Processing {
            progress: progress.min(99),
        })
    }

    pub fn complete(output: CompletedOutput) -> Self {
        Self::new(TaskState::Complete(output))
    }

    pub fn failed(err: &ConversionError) -> Self {
        Self::new(TaskState::Error {
            error: err.to_string(),
            kind: err.kind(),
        })
    }

    pub fn status(&self) -> &'static str {
        match self.state {
            TaskState::Pending => "pending",
            TaskState::Processing { .. } => "processing",
            TaskState::Complete(_) => "complete",
            TaskState::Error { .. } => "error",
        }
    }

    /// 0 until processing starts, 100 only once complete.
    pub fn progress(&self) -> u8 {
        match self.state {
            TaskState::Pending => 0,
            TaskState::Processing { progress } => progress,
            TaskState::Complete(_) => 100,
            TaskState::Error { .. } => 0,
        }
    }

    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TaskState::Complete(_) | TaskState::Error { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.state {
            TaskState::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
