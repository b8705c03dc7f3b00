//! Progress and terminal-state reporting for one task.
//!
//! The pipeline never keeps a private copy of its task record: every update
//! is written to the store as a whole replacement record. Progress writes are
//! best-effort, terminal writes are retried. A per-task gate makes sure that
//! once a terminal state has been written (including a timeout written from
//! outside the worker) nothing else is written for that task.

use crate::error::ConversionError;
use crate::tasks::record::TaskRecord;
use crate::tasks::store::{TaskId, TaskStore};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Attempts made for a terminal write before giving up.
pub const TERMINAL_WRITE_ATTEMPTS: u32 = 3;

const TERMINAL_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Gate {
    last_progress: Option<u8>,
    finished: bool,
}

/// Cloneable handle; clones share the same gate.
#[derive(Clone)]
pub struct TaskReporter {
    id: TaskId,
    store: Arc<dyn TaskStore>,
    gate: Arc<Mutex<Gate>>,
}

impl TaskReporter {
    pub fn new(id: TaskId, store: Arc<dyn TaskStore>) -> Self {
        Self {
            id,
            store,
            gate: Arc::new(Mutex::new(Gate::default())),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Record a processing checkpoint. Regressions are ignored and write
    /// failures are only logged.
    pub fn progress(&self, progress: u8) {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if gate.finished {
            return;
        }
        if gate.last_progress.is_some_and(|last| progress < last) {
            debug!(task_id = %self.id, progress, "Ignoring progress regression");
            return;
        }

        gate.last_progress = Some(progress);
        if let Err(e) = self.store.put(self.id, TaskRecord::processing(progress)) {
            warn!(task_id = %self.id, progress, error = %e, "Progress update lost");
        }
    }

    /// Write a terminal record, retrying on storage failure.
    ///
    /// Returns `false` when the task was already finished or every attempt
    /// failed.
    pub fn finish(&self, record: TaskRecord) -> bool {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if gate.finished {
            debug!(task_id = %self.id, status = record.status(), "Task already finished, dropping update");
            return false;
        }
        gate.finished = true;

        for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
            match self.store.put(self.id, record.clone()) {
                Ok(()) => return true,
                Err(e) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                    warn!(task_id = %self.id, attempt, error = %e, "Terminal status write failed, retrying");
                    std::thread::sleep(TERMINAL_RETRY_DELAY);
                }
                Err(e) => {
                    error!(
                        task_id = %self.id,
                        attempts = TERMINAL_WRITE_ATTEMPTS,
                        error = %e,
                        "Giving up on terminal status write"
                    );
                }
            }
        }
        false
    }

    /// Terminal failure shorthand.
    pub fn fail(&self, err: &ConversionError) -> bool {
        self.finish(TaskRecord::failed(err))
    }
}
