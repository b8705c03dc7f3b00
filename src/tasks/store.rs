//! # Task Store
//!
//! Durable mapping from task id to [`TaskRecord`], shared by HTTP handlers,
//! pipeline workers and the sweeper.
//!
//! ## Thread Safety Pattern:
//! [`JsonTaskStore`] keeps the whole document in an `RwLock<HashMap>`:
//! - Readers take the read lock just long enough to clone one record, so a
//!   reader sees either the full previous or the full next document.
//! - Writers take the write lock, apply their single-key change, persist the
//!   complete document and only then release. A failed persist rolls the
//!   change back, so readers never see a record that is not on disk.
//!
//! ## Durability:
//! The document is written to a sibling temp file and renamed over the
//! original, so a crash mid-write leaves the previous document intact. A
//! document that fails to parse is logged and treated as empty.

use super::record::TaskRecord;
use crate::error::ConversionError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type TaskId = Uuid;

/// Narrow storage interface the rest of the crate depends on.
pub trait TaskStore: Send + Sync {
    /// Current record for `id`, if any. Never fails; read problems look like
    /// an absent record.
    fn get(&self, id: &TaskId) -> Option<TaskRecord>;

    /// Insert or replace the record for `id`. Durable once it returns `Ok`.
    fn put(&self, id: TaskId, record: TaskRecord) -> Result<(), ConversionError>;

    /// Remove the record for `id`. Returns whether a record was removed;
    /// deleting a missing id is not an error.
    fn delete(&self, id: &TaskId) -> Result<bool, ConversionError>;

    /// Remove the record for `id` only if its `timestamp` is still older
    /// than `cutoff` at the moment of removal. A record rewritten since the
    /// caller last looked at it is kept.
    fn delete_if_older(&self, id: &TaskId, cutoff: DateTime<Utc>) -> Result<bool, ConversionError>;

    /// Snapshot of every record.
    fn list_all(&self) -> HashMap<TaskId, TaskRecord>;
}

/// RwLock-guarded map, optionally mirrored to one JSON document.
#[derive(Debug)]
pub struct JsonTaskStore {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    path: Option<PathBuf>,
}

impl JsonTaskStore {
    /// Store that lives only in memory.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Store mirrored to `path`. Existing records are loaded; a missing
    /// document is created empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let tasks = load_document(&path);

        let store = Self {
            tasks: RwLock::new(tasks),
            path: Some(path),
        };

        if let Some(path) = &store.path {
            if !path.exists() {
                match store.persist(&HashMap::new()) {
                    Ok(()) => info!(path = %path.display(), "Created tasks file"),
                    Err(e) => error!(path = %path.display(), error = %e, "Failed to create tasks file"),
                }
            }
        }

        store
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the full document. No-op for in-memory stores.
    fn persist(&self, tasks: &HashMap<TaskId, TaskRecord>) -> Result<(), ConversionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let bytes = serde_json::to_vec(tasks)
            .map_err(|e| ConversionError::StorageIo(format!("failed to serialize tasks: {}", e)))?;

        let tmp_path = path.with_extension("json.tmp");
        let result = fs::write(&tmp_path, &bytes).and_then(|_| fs::rename(&tmp_path, path));

        result.map_err(|e| {
            error!(path = %path.display(), error = %e, "Error writing tasks file");
            ConversionError::StorageIo(e.kind().to_string())
        })
    }
}

/// Read and parse the backing document. Every failure degrades to empty.
fn load_document(path: &Path) -> HashMap<TaskId, TaskRecord> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Error reading tasks file");
            return HashMap::new();
        }
    };

    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return HashMap::new();
    }

    match serde_json::from_slice::<HashMap<TaskId, TaskRecord>>(&bytes) {
        Ok(tasks) => {
            debug!(path = %path.display(), count = tasks.len(), "Loaded tasks file");
            tasks
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Invalid JSON in tasks file, starting empty");
            HashMap::new()
        }
    }
}

impl TaskStore for JsonTaskStore {
    fn get(&self, id: &TaskId) -> Option<TaskRecord> {
        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        tasks.get(id).cloned()
    }

    fn put(&self, id: TaskId, record: TaskRecord) -> Result<(), ConversionError> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let previous = tasks.insert(id, record);

        if let Err(e) = self.persist(&tasks) {
            match previous {
                Some(previous) => tasks.insert(id, previous),
                None => tasks.remove(&id),
            };
            return Err(e);
        }

        Ok(())
    }

    fn delete(&self, id: &TaskId) -> Result<bool, ConversionError> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let Some(previous) = tasks.remove(id) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&tasks) {
            tasks.insert(*id, previous);
            return Err(e);
        }

        Ok(true)
    }

    fn delete_if_older(&self, id: &TaskId, cutoff: DateTime<Utc>) -> Result<bool, ConversionError> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if !tasks.get(id).is_some_and(|record| record.timestamp < cutoff) {
            return Ok(false);
        }
        let Some(previous) = tasks.remove(id) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&tasks) {
            tasks.insert(*id, previous);
            return Err(e);
        }

        Ok(true)
    }

    fn list_all(&self) -> HashMap<TaskId, TaskRecord> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConversionError, ErrorKind};
    use std::sync::Arc;

    #[test]
    fn test_unknown_id_is_absent() {
        let store = JsonTaskStore::in_memory();
        assert!(store.get(&Uuid::new_v4()).is_none());
        assert!(store.list_all().is_empty());
    }

    #[test]
    fn test_put_replaces_whole_record() {
        let store = JsonTaskStore::in_memory();
        let id = Uuid::new_v4();

        store.put(id, TaskRecord::processing(30)).unwrap();
        store.put(id, TaskRecord::failed(&ConversionError::InvalidInput)).unwrap();

        let record = store.get(&id).unwrap();
        assert_eq!(record.status(), "error");
        assert_eq!(record.error_kind(), Some(ErrorKind::InvalidInput));
        assert_eq!(store.list_all().len(), 1);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = JsonTaskStore::in_memory();
        let id = Uuid::new_v4();
        store.put(id, TaskRecord::pending()).unwrap();

        assert!(store.delete(&id).unwrap());
        assert!(!store.delete(&id).unwrap());
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn test_conditional_delete_keeps_rewritten_record() {
        let store = JsonTaskStore::in_memory();
        let id = Uuid::new_v4();
        let mut stale = TaskRecord::processing(50);
        stale.timestamp = Utc::now() - chrono::Duration::hours(2);
        store.put(id, stale).unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(30);
        // The owner writes again before the conditional delete runs
        store.put(id, TaskRecord::processing(95)).unwrap();

        assert!(!store.delete_if_older(&id, cutoff).unwrap());
        assert_eq!(store.get(&id).unwrap().progress(), 95);
        assert!(!store.delete_if_older(&Uuid::new_v4(), cutoff).unwrap());
    }

    #[test]
    fn test_conditional_delete_removes_stale_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversion_tasks.json");
        let store = JsonTaskStore::open(&path);
        let id = Uuid::new_v4();
        let mut stale = TaskRecord::pending();
        stale.timestamp = Utc::now() - chrono::Duration::hours(2);
        store.put(id, stale).unwrap();

        assert!(store.delete_if_older(&id, Utc::now() - chrono::Duration::minutes(30)).unwrap());
        assert!(JsonTaskStore::open(&path).get(&id).is_none());
    }

    #[test]
    fn test_document_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversion_tasks.json");
        let id = Uuid::new_v4();

        {
            let store = JsonTaskStore::open(&path);
            store.put(id, TaskRecord::processing(70)).unwrap();
        }

        let reopened = JsonTaskStore::open(&path);
        assert_eq!(reopened.get(&id).unwrap().progress(), 70);
    }

    #[test]
    fn test_open_creates_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversion_tasks.json");

        let store = JsonTaskStore::open(&path);
        assert!(store.list_all().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_corrupt_document_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversion_tasks.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = JsonTaskStore::open(&path);
        assert!(store.list_all().is_empty());

        // The next write replaces the corrupt document with a valid one
        let id = Uuid::new_v4();
        store.put(id, TaskRecord::pending()).unwrap();
        assert!(JsonTaskStore::open(&path).get(&id).is_some());
    }

    #[test]
    fn test_failed_write_is_reported_and_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = JsonTaskStore::open(blocker.join("tasks.json"));
        let id = Uuid::new_v4();

        let err = store.put(id, TaskRecord::pending()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageIo);
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversion_tasks.json");
        let store = Arc::new(JsonTaskStore::open(&path));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let id = Uuid::new_v4();
                    for progress in [0u8, 5, 10, 30, 50, 70, 85, 95] {
                        store.put(id, TaskRecord::processing(progress)).unwrap();
                        assert!(store.get(&id).unwrap().progress() >= progress);
                    }
                    id
                })
            })
            .collect();

        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let reopened = JsonTaskStore::open(&path);
        assert_eq!(reopened.list_all().len(), 8);
        for id in ids {
            assert_eq!(reopened.get(&id).unwrap().progress(), 95);
        }
    }
}
