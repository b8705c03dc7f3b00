//! # Background Work Supervisor
//!
//! Owns every background job the process starts: one conversion per
//! accepted upload, the retention sweeper and deferred record deletions.
//!
//! ## Shutdown Sequence:
//! 1. `shutdown` flips the watch channel every background loop listens on
//! 2. all registered handles are joined, bounded by a grace period
//! 3. anything still running after the grace period is abandoned
//!
//! Conversions run on tokio's blocking pool and cannot be interrupted. A
//! per-task timeout therefore only stops *waiting* for the worker: the task
//! is marked `error` with kind `timeout` and the worker's later writes are
//! dropped by its reporter.

use super::store::{TaskId, TaskStore};
use crate::conversion::{ConversionJob, ConversionPipeline, TaskReporter};
use crate::error::ConversionError;
use futures_util::future::join_all;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Supervisor {
    runtime: Handle,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Supervisor {
    /// Jobs are spawned onto `runtime`, independent of whichever thread
    /// asks for them.
    pub fn new(runtime: Handle) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            runtime,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Receiver that turns `true` once shutdown has started.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Number of registered jobs that have not finished yet.
    pub fn active_jobs(&self) -> usize {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Spawn and register a background job.
    pub fn spawn<F>(&self, name: &'static str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.runtime.spawn(job);
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((name, handle));
        debug!(job = name, registered = handles.len(), "Spawned background job");
    }

    /// Run a conversion on the blocking pool, optionally bounded by
    /// `timeout`.
    pub fn spawn_conversion(
        &self,
        pipeline: Arc<ConversionPipeline>,
        job: ConversionJob,
        reporter: TaskReporter,
        timeout: Option<Duration>,
    ) {
        let runtime = self.runtime.clone();
        let task_id = job.task_id;

        self.spawn("conversion", async move {
            let worker_reporter = reporter.clone();
            let worker = runtime.spawn_blocking(move || {
                // The pipeline records its own outcome
                let _ = pipeline.run(&job, &worker_reporter);
            });

            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, worker).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(task_id = %task_id, timeout_secs = limit.as_secs(), "Conversion timed out, abandoning worker");
                        let err = ConversionError::Timeout(limit.as_secs());
                        finish_off_thread(&runtime, reporter, err).await;
                        return;
                    }
                },
                None => worker.await,
            };

            if let Err(e) = outcome {
                error!(task_id = %task_id, error = %e, "Conversion worker panicked");
                let err = ConversionError::ConversionFailed("internal error".to_string());
                finish_off_thread(&runtime, reporter, err).await;
            }
        });
    }

    /// Remove the record of `task_id` after `delay`, unless shutdown
    /// starts first.
    pub fn schedule_record_deletion(&self, store: Arc<dyn TaskStore>, task_id: TaskId, delay: Duration) {
        let mut shutdown = self.shutdown_signal();
        let runtime = self.runtime.clone();

        self.spawn("deferred-delete", async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    debug!(task_id = %task_id, "Shutdown started, leaving record to the sweeper");
                    return;
                }
            }

            match runtime.spawn_blocking(move || store.delete(&task_id)).await {
                Ok(Ok(true)) => info!(task_id = %task_id, "Deleted task record after download"),
                Ok(Ok(false)) => debug!(task_id = %task_id, "Task record already gone"),
                Ok(Err(e)) => warn!(task_id = %task_id, error = %e, "Failed to delete task record"),
                Err(e) => error!(task_id = %task_id, error = %e, "Deferred deletion panicked"),
            }
        });
    }

    /// Signal shutdown and wait up to `grace` for every job.
    ///
    /// Returns `true` when everything finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown_tx.send_replace(true);

        let handles: Vec<_> = {
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            handles.drain(..).collect()
        };
        let pending = handles.iter().filter(|(_, h)| !h.is_finished()).count();
        info!(pending, grace_secs = grace.as_secs(), "Waiting for background jobs");

        let joins = join_all(handles.into_iter().map(|(name, handle)| async move {
            if let Err(e) = handle.await {
                error!(job = name, error = %e, "Background job failed");
            }
        }));

        match tokio::time::timeout(grace, joins).await {
            Ok(_) => {
                info!("All background jobs finished");
                true
            }
            Err(_) => {
                warn!("Background jobs still running after grace period, abandoning them");
                false
            }
        }
    }
}

/// Terminal writes may sleep between retries, so keep them off the async
/// workers.
async fn finish_off_thread(runtime: &Handle, reporter: TaskReporter, err: ConversionError) {
    let task_id = reporter.id();
    if let Err(e) = runtime.spawn_blocking(move || reporter.fail(&err)).await {
        error!(task_id = %task_id, error = %e, "Failed to record task failure");
    }
}
