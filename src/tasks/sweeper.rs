//! # Retention Sweeper
//!
//! Periodically evicts anything older than the retention window:
//! - files in the upload and output directories, by modification time
//! - task records, by their `timestamp`
//!
//! The two passes are independent. A record may outlive its output file;
//! the next download attempt will then flip it to `error`.

use super::store::TaskStore;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What one sweep cycle removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub files_removed: usize,
    pub records_removed: usize,
}

pub struct RetentionSweeper {
    store: Arc<dyn TaskStore>,
    directories: Vec<PathBuf>,
    retention: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn TaskStore>, directories: Vec<PathBuf>, retention: Duration, interval: Duration) -> Self {
        Self {
            store,
            directories,
            retention,
            interval,
        }
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    /// One full cycle, judging ages relative to `now`.
    pub fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();

        for dir in &self.directories {
            report.files_removed += self.sweep_directory(dir, now);
        }

        let Some(cutoff) = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| DateTime::<Utc>::from(now).checked_sub_signed(retention))
        else {
            return report;
        };

        for (id, record) in self.store.list_all() {
            if record.timestamp >= cutoff {
                continue;
            }
            // Re-checked under the store's write lock; a record its pipeline
            // rewrote after the snapshot stays
            match self.store.delete_if_older(&id, cutoff) {
                Ok(true) => {
                    debug!(task_id = %id, status = record.status(), "Removed expired task record");
                    report.records_removed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(task_id = %id, error = %e, "Failed to remove expired task record"),
            }
        }

        report
    }

    fn sweep_directory(&self, dir: &Path, now: SystemTime) -> usize {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot scan directory");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            let age = metadata.modified().ok().and_then(|m| now.duration_since(m).ok());
            if !self.is_expired(age) {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed expired file");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => error!(path = %path.display(), error = %e, "Failed to remove expired file"),
            }
        }
        removed
    }

    /// Unknown or negative ages never expire.
    fn is_expired(&self, age: Option<Duration>) -> bool {
        age.is_some_and(|age| age > self.retention)
    }

    /// Sweep once per interval, starting immediately, until `shutdown`
    /// turns `true` or its sender goes away.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "Retention sweeper started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sweeper = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                        Ok(report) if report != SweepReport::default() => info!(
                            files_removed = report.files_removed,
                            records_removed = report.records_removed,
                            "Sweep finished"
                        ),
                        Ok(_) => debug!("Sweep found nothing to remove"),
                        Err(e) => error!(error = %e, "Sweep cycle panicked"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Retention sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConversionError;
    use crate::tasks::record::TaskRecord;
    use crate::tasks::store::{JsonTaskStore, TaskId};
    use std::collections::HashMap;
    use uuid::Uuid;

    const RETENTION: Duration = Duration::from_secs(30 * 60);

    fn sweeper(store: Arc<dyn TaskStore>, dirs: Vec<PathBuf>) -> RetentionSweeper {
        RetentionSweeper::new(store, dirs, RETENTION, Duration::from_secs(3600))
    }

    #[test]
    fn test_fresh_entries_survive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.wav"), b"data").unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(JsonTaskStore::in_memory());
        let id = Uuid::new_v4();
        store.put(id, TaskRecord::pending()).unwrap();

        let report = sweeper(Arc::clone(&store), vec![dir.path().to_path_buf()]).sweep();

        assert_eq!(report, SweepReport::default());
        assert!(store.get(&id).is_some());
        assert!(dir.path().join("a.wav").exists());
    }

    #[test]
    fn test_everything_expires_after_retention() {
        let uploads = tempfile::tempdir().unwrap();
        let outputs = tempfile::tempdir().unwrap();
        std::fs::write(uploads.path().join("in.mp3"), b"in").unwrap();
        std::fs::write(outputs.path().join("out.wav"), b"out").unwrap();
        std::fs::create_dir(outputs.path().join("nested")).unwrap();

        let store: Arc<dyn TaskStore> = Arc::new(JsonTaskStore::in_memory());
        let ids: Vec<_> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            store.put(*id, TaskRecord::processing(50)).unwrap();
        }

        let sweeper = sweeper(
            Arc::clone(&store),
            vec![uploads.path().to_path_buf(), outputs.path().to_path_buf()],
        );
        let later = SystemTime::now() + RETENTION + Duration::from_secs(60);
        let report = sweeper.sweep_at(later);

        assert_eq!(report, SweepReport { files_removed: 2, records_removed: 3 });
        assert!(store.list_all().is_empty());
        assert!(outputs.path().join("nested").is_dir());
    }

    /// Hands out a snapshot, then lets the owning pipeline write a fresh
    /// record before the sweeper acts on it.
    struct RacingStore {
        inner: JsonTaskStore,
        racing_id: TaskId,
    }

    impl TaskStore for RacingStore {
        fn get(&self, id: &TaskId) -> Option<TaskRecord> {
            self.inner.get(id)
        }

        fn put(&self, id: TaskId, record: TaskRecord) -> Result<(), ConversionError> {
            self.inner.put(id, record)
        }

        fn delete(&self, id: &TaskId) -> Result<bool, ConversionError> {
            self.inner.delete(id)
        }

        fn delete_if_older(&self, id: &TaskId, cutoff: DateTime<Utc>) -> Result<bool, ConversionError> {
            self.inner.delete_if_older(id, cutoff)
        }

        fn list_all(&self) -> HashMap<TaskId, TaskRecord> {
            let snapshot = self.inner.list_all();
            self.inner.put(self.racing_id, TaskRecord::processing(95)).unwrap();
            snapshot
        }
    }

    #[test]
    fn test_record_rewritten_after_snapshot_survives() {
        let racing_id = Uuid::new_v4();
        let store = RacingStore { inner: JsonTaskStore::in_memory(), racing_id };
        let mut stale = TaskRecord::processing(85);
        stale.timestamp = Utc::now() - chrono::Duration::hours(2);
        store.inner.put(racing_id, stale).unwrap();

        let store: Arc<dyn TaskStore> = Arc::new(store);
        let report = sweeper(Arc::clone(&store), Vec::new()).sweep();

        assert_eq!(report.records_removed, 0);
        assert_eq!(store.get(&racing_id).unwrap().progress(), 95);
    }

    #[test]
    fn test_missing_directory_is_not_fatal() {
        let store: Arc<dyn TaskStore> = Arc::new(JsonTaskStore::in_memory());
        let report = sweeper(store, vec![PathBuf::from("/definitely/not/a/dir")]).sweep();
        assert_eq!(report.files_removed, 0);
    }

    #[tokio::test]
    async fn test_loop_sweeps_then_stops_on_shutdown() {
        let store: Arc<dyn TaskStore> = Arc::new(JsonTaskStore::in_memory());
        let stale = Uuid::new_v4();
        let mut record = TaskRecord::pending();
        record.timestamp = Utc::now() - chrono::Duration::hours(2);
        store.put(stale, record).unwrap();

        let (tx, rx) = watch::channel(false);
        let sweeper = Arc::new(sweeper(Arc::clone(&store), Vec::new()));
        let handle = tokio::spawn(sweeper.run(rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.get(&stale).is_none());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
