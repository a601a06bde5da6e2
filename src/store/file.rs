//! File-backed store.
//!
//! Layout under the store root (default `.procflow/`):
//!
//! ```text
//! processes/{id}.json      process rows, rewritten on every update
//! records/{id}.jsonl       step records, one JSON object per line
//! active/{resource}.json   active-resource claims
//! locks/{key}.json         resource locks
//! ```
//!
//! Resource and lock keys are hex-encoded into file names. Claims and locks
//! are created with `create_new`, so two stores on the same directory cannot
//! both take one. Rewrites go through a temporary file and a rename.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{LockAttempt, LockStore, ProcessStore, ResourceLock, StoreError};
use crate::workflow::process::{Process, ProcessId, ProcessStatus, StepRecord};

/// Default store directory, relative to the working directory.
pub const DEFAULT_STORE_DIR: &str = ".procflow";

fn encode_key(key: &str) -> String {
    key.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value)?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Writes `value` to `path` only if the file does not exist yet.
/// Returns false when it already exists.
fn write_new<T: Serialize>(path: &Path, value: &T) -> Result<bool, StoreError> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    file.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
    file.sync_all()?;
    Ok(true)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut items = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(item) = read_json(&path)? {
            items.push(item);
        }
    }
    Ok(items)
}

/// JSON-file implementation of [`ProcessStore`] and [`LockStore`].
///
/// # Example
///
/// ```no_run
/// use procflow::store::FileStore;
///
/// let store = FileStore::open(".procflow")?;
/// # Ok::<(), procflow::store::StoreError>(())
/// ```
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    guard: Mutex<()>,
}

impl FileStore {
    /// Opens a store at `root`, creating the directory layout if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in ["processes", "records", "active", "locks"] {
            fs::create_dir_all(root.join(dir))?;
        }
        info!("Using file store at {}", root.display());
        Ok(Self {
            root,
            guard: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn exclusive(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.guard.lock().map_err(|_| StoreError::Poisoned)
    }

    fn process_path(&self, id: ProcessId) -> PathBuf {
        self.root.join("processes").join(format!("{}.json", id))
    }

    fn records_path(&self, id: ProcessId) -> PathBuf {
        self.root.join("records").join(format!("{}.jsonl", id))
    }

    fn claim_path(&self, resource: &str) -> PathBuf {
        self.root
            .join("active")
            .join(format!("{}.json", encode_key(resource)))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("{}.json", encode_key(key)))
    }

    fn read_process(&self, id: ProcessId) -> Result<Process, StoreError> {
        read_json(&self.process_path(id))?.ok_or(StoreError::ProcessNotFound(id))
    }

    /// Parses the record log. A trailing line without a newline is a torn
    /// write from a crash and is ignored; its byte offset is returned so the
    /// next append can truncate it.
    fn read_records(&self, id: ProcessId) -> Result<(Vec<StepRecord>, Option<u64>), StoreError> {
        let content = match fs::read_to_string(self.records_path(id)) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::ProcessNotFound(id))
            }
            Err(e) => return Err(e.into()),
        };

        let complete_len = content.rfind('\n').map(|pos| pos + 1).unwrap_or(0);
        let torn = if complete_len < content.len() {
            warn!(
                "Ignoring incomplete trailing record in log of process {}",
                id
            );
            Some(complete_len as u64)
        } else {
            None
        };

        let mut records = Vec::new();
        for (line_no, line) in content[..complete_len].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: StepRecord =
                serde_json::from_str(line).map_err(|e| StoreError::CorruptLog {
                    process_id: id,
                    reason: format!("line {}: {}", line_no + 1, e),
                })?;
            records.push(record);
        }

        Ok((records, torn))
    }

    fn claim_holder(&self, resource: &str) -> Result<Option<ProcessId>, StoreError> {
        read_json(&self.claim_path(resource))
    }
}

impl ProcessStore for FileStore {
    fn create_process(&self, process: &Process) -> Result<(), StoreError> {
        let _guard = self.exclusive()?;

        let path = self.process_path(process.id);
        if path.exists() {
            return Err(StoreError::DuplicateProcess(process.id));
        }

        if let Some(resource) = &process.target {
            if !write_new(&self.claim_path(resource), &process.id)? {
                let holder = self
                    .claim_holder(resource)?
                    .unwrap_or(process.id);
                return Err(StoreError::ResourceBusy {
                    resource: resource.clone(),
                    holder,
                });
            }
        }

        write_atomic(&path, process)?;
        File::create(self.records_path(process.id))?;
        debug!("Created process file {}", path.display());
        Ok(())
    }

    fn load_process(&self, id: ProcessId) -> Result<Process, StoreError> {
        self.read_process(id)
    }

    fn set_status(
        &self,
        id: ProcessId,
        status: ProcessStatus,
        now: DateTime<Utc>,
    ) -> Result<Process, StoreError> {
        let _guard = self.exclusive()?;

        let mut process = self.read_process(id)?;
        process.status = status;
        process.modified_at = now;
        write_atomic(&self.process_path(id), &process)?;

        if status.is_terminal() {
            if let Some(resource) = &process.target {
                if self.claim_holder(resource)? == Some(id) {
                    remove_if_exists(&self.claim_path(resource))?;
                }
            }
        }

        Ok(process)
    }

    fn request_abort(&self, id: ProcessId, now: DateTime<Utc>) -> Result<Process, StoreError> {
        let _guard = self.exclusive()?;

        let mut process = self.read_process(id)?;
        process.abort_requested = true;
        process.modified_at = now;
        write_atomic(&self.process_path(id), &process)?;
        Ok(process)
    }

    fn list_processes(&self) -> Result<Vec<Process>, StoreError> {
        let mut processes: Vec<Process> = read_dir_json(&self.root.join("processes"))?;
        processes.sort_by_key(|p| p.created_at);
        Ok(processes)
    }

    fn append_record(&self, record: &StepRecord) -> Result<(), StoreError> {
        let _guard = self.exclusive()?;

        let (records, torn) = self.read_records(record.process_id)?;
        let expected = records.len() as u64;
        if record.seq != expected {
            return Err(StoreError::SequenceGap {
                process_id: record.process_id,
                expected,
                found: record.seq,
            });
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(self.records_path(record.process_id))?;
        if let Some(offset) = torn {
            file.set_len(offset)?;
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn load_records(&self, id: ProcessId) -> Result<Vec<StepRecord>, StoreError> {
        self.read_records(id).map(|(records, _)| records)
    }

    fn active_process_for(&self, resource: &str) -> Result<Option<ProcessId>, StoreError> {
        self.claim_holder(resource)
    }
}

impl LockStore for FileStore {
    fn try_lock(&self, lock: &ResourceLock) -> Result<LockAttempt, StoreError> {
        let _guard = self.exclusive()?;
        let path = self.lock_path(&lock.key);

        if write_new(&path, lock)? {
            return Ok(LockAttempt::Acquired);
        }

        match read_json::<ResourceLock>(&path)? {
            Some(held) => Ok(LockAttempt::Held(held)),
            // Released between the two calls
            None => {
                if write_new(&path, lock)? {
                    Ok(LockAttempt::Acquired)
                } else {
                    Err(io::Error::new(
                        ErrorKind::WouldBlock,
                        "lock file changed concurrently",
                    )
                    .into())
                }
            }
        }
    }

    fn refresh(&self, key: &str, owner: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let _guard = self.exclusive()?;
        let path = self.lock_path(key);

        match read_json::<ResourceLock>(&path)? {
            Some(mut held) if held.owner == owner => {
                held.heartbeat_at = now;
                write_atomic(&path, &held)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn unlock(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let _guard = self.exclusive()?;
        let path = self.lock_path(key);

        match read_json::<ResourceLock>(&path)? {
            Some(held) if held.owner == owner => {
                remove_if_exists(&path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn reclaim(
        &self,
        stale: &ResourceLock,
        replacement: &ResourceLock,
    ) -> Result<bool, StoreError> {
        let _guard = self.exclusive()?;
        let path = self.lock_path(&stale.key);

        match read_json::<ResourceLock>(&path)? {
            Some(held) if held == *stale => {
                write_atomic(&path, replacement)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get_lock(&self, key: &str) -> Result<Option<ResourceLock>, StoreError> {
        read_json(&self.lock_path(key))
    }

    fn list_locks(&self) -> Result<Vec<ResourceLock>, StoreError> {
        read_dir_json(&self.root.join("locks"))
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;
    use crate::workflow::state::StateEnvelope;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_and_load() {
        let (_dir, store) = store();
        contract::create_and_load(&store);
    }

    #[test]
    fn test_claim_is_exclusive_until_terminal() {
        let (_dir, store) = store();
        contract::claim_is_exclusive_until_terminal(&store);
    }

    #[test]
    fn test_untargeted_processes_do_not_claim() {
        let (_dir, store) = store();
        contract::untargeted_processes_do_not_claim(&store);
    }

    #[test]
    fn test_records_are_contiguous() {
        let (_dir, store) = store();
        contract::records_are_contiguous(&store);
    }

    #[test]
    fn test_append_requires_process() {
        let (_dir, store) = store();
        contract::append_requires_process(&store);
    }

    #[test]
    fn test_abort_flag() {
        let (_dir, store) = store();
        contract::abort_flag(&store);
    }

    #[test]
    fn test_lock_exclusion() {
        let (_dir, store) = store();
        contract::lock_exclusion(&store);
    }

    #[test]
    fn test_lock_reclaim() {
        let (_dir, store) = store();
        contract::lock_reclaim(&store);
    }

    #[test]
    fn test_encode_key() {
        assert_eq!(encode_key("ab/1"), "61622f31");
    }

    #[test]
    fn test_reopen_sees_existing_data() {
        let dir = tempdir().unwrap();
        let process = Process::new(ProcessId::new(), "wf", Some("node-1".into()));
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.create_process(&process).unwrap();
            store
                .append_record(&StepRecord::created(process.id, StateEnvelope::new(1)))
                .unwrap();
        }

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_process(process.id).unwrap(), process);
        assert_eq!(reopened.load_records(process.id).unwrap().len(), 1);
        assert_eq!(reopened.active_process_for("node-1").unwrap(), Some(process.id));
    }

    #[test]
    fn test_torn_trailing_record_is_dropped() {
        let (_dir, store) = store();
        let process = Process::new(ProcessId::new(), "wf", None);
        store.create_process(&process).unwrap();
        store
            .append_record(&StepRecord::created(process.id, StateEnvelope::new(1)))
            .unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(store.records_path(process.id))
            .unwrap();
        file.write_all(b"{\"process_id\": \"trunc").unwrap();
        drop(file);

        assert_eq!(store.load_records(process.id).unwrap().len(), 1);

        let state = StateEnvelope::new(1);
        store
            .append_record(&StepRecord::advanced(
                process.id,
                1,
                "a",
                0,
                crate::workflow::process::OutcomeKind::Success,
                state.clone(),
                state,
            ))
            .unwrap();
        assert_eq!(store.load_records(process.id).unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_line_is_reported() {
        let (_dir, store) = store();
        let process = Process::new(ProcessId::new(), "wf", None);
        store.create_process(&process).unwrap();
        fs::write(store.records_path(process.id), "not json\n").unwrap();

        assert!(matches!(
            store.load_records(process.id),
            Err(StoreError::CorruptLog { .. })
        ));
    }
}
