//! In-memory store.
//!
//! Keeps processes, records, claims and locks in maps behind mutexes.
//! Cloning shares the underlying data, so two engines built on clones of the
//! same store behave like two instances on one database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{LockAttempt, LockStore, ProcessStore, ResourceLock, StoreError};
use crate::workflow::process::{Process, ProcessId, ProcessStatus, StepRecord};

#[derive(Debug, Default)]
struct Tables {
    processes: HashMap<ProcessId, Process>,
    records: HashMap<ProcessId, Vec<StepRecord>>,
    /// resource id -> claiming process
    active: HashMap<String, ProcessId>,
}

/// Thread-safe in-memory implementation of [`ProcessStore`] and [`LockStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    locks: Arc<Mutex<HashMap<String, ResourceLock>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    fn locks(&self) -> Result<MutexGuard<'_, HashMap<String, ResourceLock>>, StoreError> {
        self.locks.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ProcessStore for MemoryStore {
    fn create_process(&self, process: &Process) -> Result<(), StoreError> {
        let mut tables = self.tables()?;

        if tables.processes.contains_key(&process.id) {
            return Err(StoreError::DuplicateProcess(process.id));
        }

        if let Some(resource) = &process.target {
            if let Some(holder) = tables.active.get(resource) {
                return Err(StoreError::ResourceBusy {
                    resource: resource.clone(),
                    holder: *holder,
                });
            }
            tables.active.insert(resource.clone(), process.id);
        }

        tables.processes.insert(process.id, process.clone());
        tables.records.insert(process.id, Vec::new());
        Ok(())
    }

    fn load_process(&self, id: ProcessId) -> Result<Process, StoreError> {
        self.tables()?
            .processes
            .get(&id)
            .cloned()
            .ok_or(StoreError::ProcessNotFound(id))
    }

    fn set_status(
        &self,
        id: ProcessId,
        status: ProcessStatus,
        now: DateTime<Utc>,
    ) -> Result<Process, StoreError> {
        let mut tables = self.tables()?;

        let process = tables
            .processes
            .get_mut(&id)
            .ok_or(StoreError::ProcessNotFound(id))?;
        process.status = status;
        process.modified_at = now;
        let updated = process.clone();

        if status.is_terminal() {
            if let Some(resource) = &updated.target {
                if tables.active.get(resource) == Some(&id) {
                    tables.active.remove(resource);
                }
            }
        }

        Ok(updated)
    }

    fn request_abort(&self, id: ProcessId, now: DateTime<Utc>) -> Result<Process, StoreError> {
        let mut tables = self.tables()?;
        let process = tables
            .processes
            .get_mut(&id)
            .ok_or(StoreError::ProcessNotFound(id))?;
        process.abort_requested = true;
        process.modified_at = now;
        Ok(process.clone())
    }

    fn list_processes(&self) -> Result<Vec<Process>, StoreError> {
        let mut processes: Vec<Process> = self.tables()?.processes.values().cloned().collect();
        processes.sort_by_key(|p| p.created_at);
        Ok(processes)
    }

    fn append_record(&self, record: &StepRecord) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        let records = tables
            .records
            .get_mut(&record.process_id)
            .ok_or(StoreError::ProcessNotFound(record.process_id))?;

        let expected = records.len() as u64;
        if record.seq != expected {
            return Err(StoreError::SequenceGap {
                process_id: record.process_id,
                expected,
                found: record.seq,
            });
        }

        records.push(record.clone());
        Ok(())
    }

    fn load_records(&self, id: ProcessId) -> Result<Vec<StepRecord>, StoreError> {
        self.tables()?
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::ProcessNotFound(id))
    }

    fn active_process_for(&self, resource: &str) -> Result<Option<ProcessId>, StoreError> {
        Ok(self.tables()?.active.get(resource).copied())
    }
}

impl LockStore for MemoryStore {
    fn try_lock(&self, lock: &ResourceLock) -> Result<LockAttempt, StoreError> {
        let mut locks = self.locks()?;

        match locks.get(&lock.key) {
            Some(held) => Ok(LockAttempt::Held(held.clone())),
            None => {
                locks.insert(lock.key.clone(), lock.clone());
                Ok(LockAttempt::Acquired)
            }
        }
    }

    fn refresh(&self, key: &str, owner: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut locks = self.locks()?;
        match locks.get_mut(key) {
            Some(held) if held.owner == owner => {
                held.heartbeat_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn unlock(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks()?;
        match locks.get(key) {
            Some(held) if held.owner == owner => {
                locks.remove(key);
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
        let mut locks = self.locks()?;
        match locks.get(&stale.key) {
            Some(held) if held == stale => {
                locks.insert(stale.key.clone(), replacement.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get_lock(&self, key: &str) -> Result<Option<ResourceLock>, StoreError> {
        Ok(self.locks()?.get(key).cloned())
    }

    fn list_locks(&self) -> Result<Vec<ResourceLock>, StoreError> {
        Ok(self.locks()?.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    #[test]
    fn test_create_and_load() {
        contract::create_and_load(&MemoryStore::new());
    }

    #[test]
    fn test_claim_is_exclusive_until_terminal() {
        contract::claim_is_exclusive_until_terminal(&MemoryStore::new());
    }

    #[test]
    fn test_untargeted_processes_do_not_claim() {
        contract::untargeted_processes_do_not_claim(&MemoryStore::new());
    }

    #[test]
    fn test_records_are_contiguous() {
        contract::records_are_contiguous(&MemoryStore::new());
    }

    #[test]
    fn test_append_requires_process() {
        contract::append_requires_process(&MemoryStore::new());
    }

    #[test]
    fn test_abort_flag() {
        contract::abort_flag(&MemoryStore::new());
    }

    #[test]
    fn test_lock_exclusion() {
        contract::lock_exclusion(&MemoryStore::new());
    }

    #[test]
    fn test_lock_reclaim() {
        contract::lock_reclaim(&MemoryStore::new());
    }

    #[test]
    fn test_clones_share_data() {
        let store = MemoryStore::new();
        let other = store.clone();
        let process = Process::new(ProcessId::new(), "wf", None);

        store.create_process(&process).unwrap();
        assert_eq!(other.load_process(process.id).unwrap().id, process.id);
    }
}
