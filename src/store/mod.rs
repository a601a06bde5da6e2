//! Persistence Layer
//!
//! The process table, the append-only step-record log, the active-resource
//! claims and the lock table. The log is the single source of truth for a
//! process: its current state is always rebuilt by replaying records.
//!
//! # Backends
//!
//! - [`MemoryStore`]: in-memory, shared between engines through `Clone`
//! - [`FileStore`]: JSON files under a directory

pub mod file;
pub mod memory;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::process::{Process, ProcessId, ProcessStatus, StepRecord};

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Process {0} not found")]
    ProcessNotFound(ProcessId),

    #[error("Process {0} already exists")]
    DuplicateProcess(ProcessId),

    /// Another non-terminal process already acts on the resource.
    #[error("Resource '{resource}' is claimed by active process {holder}")]
    ResourceBusy { resource: String, holder: ProcessId },

    /// An append did not continue the log contiguously.
    #[error("Record sequence gap for process {process_id}: expected {expected}, got {found}")]
    SequenceGap {
        process_id: ProcessId,
        expected: u64,
        found: u64,
    },

    #[error("Corrupt log for process {process_id}: {reason}")]
    CorruptLog { process_id: ProcessId, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Storage for processes and their step records.
///
/// Implementations must be internally synchronised; the engine shares one
/// store between threads.
pub trait ProcessStore: Send + Sync {
    /// Inserts a new process row.
    ///
    /// When the process has a target, the active-resource claim is taken in
    /// the same atomic operation; an existing claim yields
    /// [`StoreError::ResourceBusy`] and nothing is written.
    fn create_process(&self, process: &Process) -> Result<(), StoreError>;

    fn load_process(&self, id: ProcessId) -> Result<Process, StoreError>;

    /// Updates the status and modification time. Moving to a terminal
    /// status drops the active-resource claim.
    fn set_status(
        &self,
        id: ProcessId,
        status: ProcessStatus,
        now: DateTime<Utc>,
    ) -> Result<Process, StoreError>;

    /// Sets the abort-requested flag.
    fn request_abort(&self, id: ProcessId, now: DateTime<Utc>) -> Result<Process, StoreError>;

    fn list_processes(&self) -> Result<Vec<Process>, StoreError>;

    /// Appends one record. `record.seq` must equal the current record count.
    fn append_record(&self, record: &StepRecord) -> Result<(), StoreError>;

    /// All records of a process, ordered by sequence number.
    fn load_records(&self, id: ProcessId) -> Result<Vec<StepRecord>, StoreError>;

    /// The non-terminal process currently claiming `resource`, if any.
    fn active_process_for(&self, resource: &str) -> Result<Option<ProcessId>, StoreError>;
}

/// A held resource lock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceLock {
    pub key: String,
    pub process_id: ProcessId,

    /// Engine instance holding the lock
    pub owner: String,

    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl ResourceLock {
    pub fn new(key: impl Into<String>, process_id: ProcessId, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            process_id,
            owner: owner.into(),
            acquired_at: now,
            heartbeat_at: now,
        }
    }

    /// True when no heartbeat arrived within `window`.
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.heartbeat_at > window
    }
}

/// Result of [`LockStore::try_lock`].
#[derive(Debug, Clone, PartialEq)]
pub enum LockAttempt {
    Acquired,
    /// The lock is held by someone else
    Held(ResourceLock),
}

/// Storage for resource locks.
pub trait LockStore: Send + Sync {
    /// Takes the lock if it is free.
    ///
    /// Not re-entrant: two threads of one engine instance exclude each
    /// other like two instances do.
    fn try_lock(&self, lock: &ResourceLock) -> Result<LockAttempt, StoreError>;

    /// Updates the heartbeat. Returns false when `owner` no longer holds it.
    fn refresh(&self, key: &str, owner: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Releases the lock. Returns false when `owner` did not hold it.
    fn unlock(&self, key: &str, owner: &str) -> Result<bool, StoreError>;

    /// Replaces `stale` with `replacement` if the stored lock still equals
    /// `stale`. Returns false when someone else got there first.
    fn reclaim(&self, stale: &ResourceLock, replacement: &ResourceLock) -> Result<bool, StoreError>;

    fn get_lock(&self, key: &str) -> Result<Option<ResourceLock>, StoreError>;

    fn list_locks(&self) -> Result<Vec<ResourceLock>, StoreError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_staleness() {
        let mut lock = ResourceLock::new("node-1", ProcessId::new(), "engine");
        let now = Utc::now();
        assert!(!lock.is_stale(now, Duration::seconds(30)));

        lock.heartbeat_at = now - Duration::seconds(31);
        assert!(lock.is_stale(now, Duration::seconds(30)));
    }

    #[test]
    fn test_store_error_messages() {
        let id = ProcessId::new();
        let err = StoreError::SequenceGap {
            process_id: id,
            expected: 2,
            found: 5,
        };
        assert!(err.to_string().contains("expected 2, got 5"));
    }
}
