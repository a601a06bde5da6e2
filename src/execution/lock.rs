//! Resource Locks
//!
//! Mutual exclusion per target resource. A lock records the process it
//! guards and the engine instance holding it; the holder refreshes the
//! heartbeat while a step runs so other instances can tell a live holder
//! from a crashed one.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::retry::millis;
use crate::store::{LockAttempt, LockStore, ResourceLock, StoreError};
use crate::workflow::process::ProcessId;

/// Timing of lock acquisition and staleness detection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LockSettings {
    /// A lock without a heartbeat for this long may be reclaimed
    #[serde(with = "millis")]
    pub stale_after: Duration,

    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,

    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// How long `resume` waits for a busy lock
    #[serde(with = "millis")]
    pub resume_timeout: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            resume_timeout: Duration::from_secs(5),
        }
    }
}

impl LockSettings {
    pub(crate) fn stale_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }
}

/// Acquires and releases resource locks on behalf of one engine instance.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    owner: String,
    settings: LockSettings,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn LockStore>,
        owner: impl Into<String>,
        settings: LockSettings,
    ) -> Self {
        Self {
            store,
            owner: owner.into(),
            settings,
        }
    }

    /// Identity written into every lock this manager takes.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    pub(crate) fn set_settings(&mut self, settings: LockSettings) {
        self.settings = settings;
    }

    pub(crate) fn set_owner(&mut self, owner: impl Into<String>) {
        self.owner = owner.into();
    }

    /// Tries to lock `key` for `process_id`, polling until `timeout`.
    ///
    /// Returns false if the lock is still held by someone else when the
    /// timeout runs out. A zero timeout makes exactly one attempt.
    pub fn acquire(
        &self,
        key: &str,
        process_id: ProcessId,
        timeout: Duration,
    ) -> Result<bool, StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            let lock = ResourceLock::new(key, process_id, self.owner.as_str());
            match self.store.try_lock(&lock)? {
                LockAttempt::Acquired => {
                    debug!("Acquired lock '{}' for process {}", key, process_id);
                    return Ok(true);
                }
                LockAttempt::Held(held) => {
                    if Instant::now() >= deadline {
                        debug!(
                            "Lock '{}' is held by process {} ({})",
                            key, held.process_id, held.owner
                        );
                        return Ok(false);
                    }
                }
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    /// Releases `key` if this instance holds it.
    pub fn release(&self, key: &str) -> Result<bool, StoreError> {
        let released = self.store.unlock(key, &self.owner)?;
        if released {
            debug!("Released lock '{}'", key);
        } else {
            warn!("Lock '{}' was not held by {}", key, self.owner);
        }
        Ok(released)
    }

    /// Refreshes the heartbeat of `key`. Returns false if the lock was lost.
    pub fn heartbeat(&self, key: &str) -> Result<bool, StoreError> {
        self.store.refresh(key, &self.owner, Utc::now())
    }

    pub fn holder(&self, key: &str) -> Result<Option<ResourceLock>, StoreError> {
        self.store.get_lock(key)
    }

    pub fn is_stale(&self, lock: &ResourceLock) -> bool {
        lock.is_stale(Utc::now(), self.settings.stale_window())
    }

    /// Locks held past the staleness window.
    pub fn stale_locks(&self) -> Result<Vec<ResourceLock>, StoreError> {
        Ok(self
            .store
            .list_locks()?
            .into_iter()
            .filter(|lock| self.is_stale(lock))
            .collect())
    }

    /// Takes over a stale lock for the same process.
    ///
    /// Fails when the stored lock changed since `stale` was read, e.g. when
    /// the old holder woke up and refreshed it.
    pub fn reclaim(&self, stale: &ResourceLock) -> Result<bool, StoreError> {
        let replacement =
            ResourceLock::new(stale.key.as_str(), stale.process_id, self.owner.as_str());
        let reclaimed = self.store.reclaim(stale, &replacement)?;
        if reclaimed {
            info!(
                "Reclaimed stale lock '{}' of process {} from {}",
                stale.key, stale.process_id, stale.owner
            );
        }
        Ok(reclaimed)
    }

    /// Drops a lock left behind by another instance.
    pub(crate) fn force_release(&self, stale: &ResourceLock) -> Result<bool, StoreError> {
        let released = self.store.unlock(&stale.key, &stale.owner)?;
        if released {
            info!("Released orphaned lock '{}' held by {}", stale.key, stale.owner);
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn fast() -> LockSettings {
        LockSettings {
            stale_after: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(5),
            resume_timeout: Duration::from_millis(50),
        }
    }

    fn managers() -> (LockManager, LockManager) {
        let store = Arc::new(MemoryStore::new());
        (
            LockManager::new(store.clone(), "engine-a", fast()),
            LockManager::new(store, "engine-b", fast()),
        )
    }

    #[test]
    fn test_acquire_and_release() {
        let (a, b) = managers();
        let pid = ProcessId::new();

        assert!(a.acquire("node-1", pid, Duration::ZERO).unwrap());
        assert!(!b.acquire("node-1", ProcessId::new(), Duration::from_millis(20)).unwrap());
        assert_eq!(a.holder("node-1").unwrap().unwrap().owner, "engine-a");

        assert!(a.release("node-1").unwrap());
        assert!(b.acquire("node-1", pid, Duration::ZERO).unwrap());
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let (a, b) = managers();
        let pid = ProcessId::new();
        assert!(a.acquire("node-2", pid, Duration::ZERO).unwrap());

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            a.release("node-2").unwrap()
        });

        assert!(b.acquire("node-2", pid, Duration::from_secs(2)).unwrap());
        assert!(releaser.join().unwrap());
    }

    #[test]
    fn test_release_by_non_holder_is_refused() {
        let (a, b) = managers();
        assert!(a.acquire("node-3", ProcessId::new(), Duration::ZERO).unwrap());
        assert!(!b.release("node-3").unwrap());
        assert!(!b.heartbeat("node-3").unwrap());
        assert!(a.heartbeat("node-3").unwrap());
    }

    #[test]
    fn test_stale_lock_reclaim() {
        let (a, b) = managers();
        let pid = ProcessId::new();
        assert!(a.acquire("node-4", pid, Duration::ZERO).unwrap());
        assert!(b.stale_locks().unwrap().is_empty());

        thread::sleep(Duration::from_millis(150));
        let stale = b.stale_locks().unwrap();
        assert_eq!(stale.len(), 1);

        assert!(b.reclaim(&stale[0]).unwrap());
        assert!(!a.heartbeat("node-4").unwrap());
        assert_eq!(b.holder("node-4").unwrap().unwrap().owner, "engine-b");
        assert!(!b.reclaim(&stale[0]).unwrap());
    }

    #[test]
    fn test_settings_from_yaml() {
        let settings: LockSettings = serde_yaml::from_str("stale_after: 1000\n").unwrap();
        assert_eq!(settings.stale_after, Duration::from_secs(1));
        assert_eq!(settings.poll_interval, Duration::from_millis(50));
    }
}
