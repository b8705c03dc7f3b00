//! # Task Dispatcher
//!
//! Entry point for the HTTP layer. Creates task records, launches
//! conversions without waiting for them, and answers status and download
//! lookups from the store.

use super::record::{TaskRecord, TaskState};
use super::store::{TaskId, TaskStore};
use super::supervisor::Supervisor;
use crate::conversion::{ConversionJob, ConversionPipeline, TaskReporter};
use crate::error::ConversionError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const DOWNLOAD_NOT_READY: &str = "File not found or conversion not complete";
pub const OUTPUT_MISSING: &str = "Output file not found on server";

/// Result of a status lookup: the record, or the explicit "unknown"
/// sentinel for ids that never existed or were swept.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskLookup {
    Known(TaskRecord),
    Unknown,
}

/// A converted file ready to be served.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadTarget {
    pub path: PathBuf,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub output_dir: PathBuf,
    pub task_timeout: Option<Duration>,
    pub download_grace: Duration,
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    pipeline: Arc<ConversionPipeline>,
    supervisor: Arc<Supervisor>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        pipeline: Arc<ConversionPipeline>,
        supervisor: Arc<Supervisor>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            pipeline,
            supervisor,
            settings,
        }
    }

    /// Record `task_id` as pending and start converting `input_path` in the
    /// background. Returns as soon as the conversion is scheduled.
    pub fn dispatch(&self, task_id: TaskId, input_path: PathBuf, display_name: String) -> Result<TaskId, ConversionError> {
        self.store.put(task_id, TaskRecord::pending())?;

        let job = ConversionJob {
            task_id,
            input_path,
            display_name,
            output_dir: self.settings.output_dir.clone(),
        };
        let reporter = TaskReporter::new(task_id, Arc::clone(&self.store));

        self.supervisor
            .spawn_conversion(Arc::clone(&self.pipeline), job, reporter, self.settings.task_timeout);

        info!(task_id = %task_id, "Dispatched conversion");
        Ok(task_id)
    }

    /// Record an upload that was refused before conversion started.
    pub fn reject(&self, task_id: TaskId, reason: &ConversionError) -> Result<(), ConversionError> {
        warn!(task_id = %task_id, error = %reason, "Upload rejected");
        self.store.put(task_id, TaskRecord::failed(reason))
    }

    pub fn status(&self, task_id: &TaskId) -> TaskLookup {
        match self.store.get(task_id) {
            Some(record) => TaskLookup::Known(record),
            None => {
                warn!(task_id = %task_id, "Task ID not found");
                TaskLookup::Unknown
            }
        }
    }

    /// Locate the converted file of a completed task.
    ///
    /// A `complete` record whose file has disappeared is rewritten to
    /// `error` before reporting not-found.
    pub fn resolve_download(&self, task_id: &TaskId) -> Result<DownloadTarget, ConversionError> {
        let output = match self.store.get(task_id) {
            Some(TaskRecord { state: TaskState::Complete(output), .. }) => output,
            _ => return Err(ConversionError::NotFound(DOWNLOAD_NOT_READY.to_string())),
        };

        if !output.output_path.is_file() {
            error!(task_id = %task_id, path = %output.output_path.display(), "Output file does not exist");
            let err = ConversionError::NotFound(OUTPUT_MISSING.to_string());
            if let Err(e) = self.store.put(*task_id, TaskRecord::failed(&err)) {
                warn!(task_id = %task_id, error = %e, "Could not record missing output");
            }
            return Err(err);
        }

        Ok(DownloadTarget {
            path: output.output_path,
            filename: output.filename,
        })
    }

    /// Forget the task a while after its file was served, leaving the file
    /// itself to the sweeper.
    pub fn schedule_cleanup(&self, task_id: TaskId) {
        self.supervisor
            .schedule_record_deletion(Arc::clone(&self.store), task_id, self.settings.download_grace);
    }
}
