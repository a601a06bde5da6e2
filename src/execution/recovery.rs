//! Crash Recovery
//!
//! After an engine instance dies its locks stay behind. Recovery finds
//! locks whose heartbeat is older than the staleness window, takes them
//! over and continues the processes from the last durable record.

use chrono::Utc;
use log::{info, warn};

use super::engine::Engine;
use super::replay::replay;
use crate::error::EngineError;
use crate::store::{ResourceLock, StoreError};
use crate::workflow::process::{ProcessId, ProcessStatus};

/// What a recovery pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RecoveryReport {
    /// Stale locks taken over from another instance
    pub reclaimed: Vec<String>,

    /// Stale locks dropped because their process no longer needs them
    pub released: Vec<String>,

    /// Processes continued, with the status they reached
    pub resumed: Vec<(ProcessId, ProcessStatus)>,

    /// Stale locks left alone because their process still shows progress
    pub skipped: Vec<String>,

    pub errors: Vec<(ProcessId, String)>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty()
            && self.released.is_empty()
            && self.resumed.is_empty()
            && self.skipped.is_empty()
            && self.errors.is_empty()
    }
}

impl Engine {
    /// Recovers processes orphaned by crashed engine instances.
    ///
    /// 1. Stale locks of waiting, terminal or unknown processes are dropped.
    /// 2. Stale locks of running processes are reclaimed (unless the log
    ///    was written to within the staleness window) and the processes are
    ///    continued from their last record. Completed steps are not run
    ///    again.
    /// 3. Running processes without any lock are continued as well.
    ///
    /// A process whose log ends in a suspension, a failure or an abort that
    /// its status never caught up with is moved to the status its log
    /// records instead of being run.
    pub fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();
        let locks = self.lock_manager();

        for stale in locks.stale_locks()? {
            if let Err(e) = self.recover_lock(&stale, &mut report) {
                warn!("Recovery of process {} failed: {}", stale.process_id, e);
                report.errors.push((stale.process_id, e.to_string()));
            }
        }

        for process in self.process_store().list_processes()? {
            if !self.needs_driver(&process)? {
                continue;
            }
            if report.resumed.iter().any(|(id, _)| *id == process.id) {
                continue;
            }
            if locks.holder(&process.lock_key())?.is_some() {
                continue;
            }

            info!("Continuing unlocked process {}", process.id);
            match self.run_process(process.id) {
                Ok(status) => report.resumed.push((process.id, status)),
                // Picked up by someone else in the meantime
                Err(EngineError::LockContention { .. }) => {}
                Err(e) => report.errors.push((process.id, e.to_string())),
            }
        }

        if !report.is_empty() {
            info!(
                "Recovery finished: {} reclaimed, {} released, {} continued, {} errors",
                report.reclaimed.len(),
                report.released.len(),
                report.resumed.len(),
                report.errors.len()
            );
        }
        Ok(report)
    }

    fn recover_lock(
        &self,
        stale: &ResourceLock,
        report: &mut RecoveryReport,
    ) -> Result<(), EngineError> {
        let locks = self.lock_manager();
        let store = self.process_store();

        let process = match store.load_process(stale.process_id) {
            Ok(process) => Some(process),
            Err(StoreError::ProcessNotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let process = match process {
            Some(process) if self.needs_driver(&process)? => Some(process),
            _ => None,
        };
        let Some(process) = process else {
            if locks.force_release(stale)? {
                report.released.push(stale.key.clone());
            }
            return Ok(());
        };

        let last_write = replay(process.id, &store.load_records(process.id)?)?.last_timestamp;
        if Utc::now() - last_write < locks.settings().stale_window() {
            info!(
                "Lock '{}' has no heartbeat but process {} wrote at {}, leaving it",
                stale.key, process.id, last_write
            );
            report.skipped.push(stale.key.clone());
            return Ok(());
        }

        if !locks.reclaim(stale)? {
            report.skipped.push(stale.key.clone());
            return Ok(());
        }
        report.reclaimed.push(stale.key.clone());

        let result = store
            .load_process(process.id)
            .map_err(EngineError::from)
            .and_then(|process| self.continue_locked(process));
        if let Err(e) = locks.release(&stale.key) {
            warn!("Failed to release lock '{}': {}", stale.key, e);
        }

        report.resumed.push((process.id, result?));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use chrono::Duration;

    use crate::store::{LockAttempt, LockStore, MemoryStore, ProcessStore};
    use crate::workflow::process::{
        ErrorKind, ErrorPayload, OutcomeKind, Process, StepRecord, Wait,
    };
    use crate::workflow::schema::{FieldKind, InputSchema};
    use crate::workflow::state::{fields, StateEnvelope};
    use crate::workflow::{Registry, Step, Target, WorkflowDefinition};

    const STEPS: [&str; 5] = ["Reserve", "Allocate", "Configure", "Verify", "Activate"];

    fn registry(counters: &[Arc<AtomicU32>]) -> Arc<Registry> {
        let mut registry = Registry::new();
        for (name, counter) in STEPS.iter().zip(counters) {
            let counter = Arc::clone(counter);
            let key = name.to_lowercase();
            registry
                .register_step(Step::action(*name, move |_, s| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(s.clone().with(key.as_str(), true))
                }))
                .unwrap();
        }
        registry
            .register_workflow(
                WorkflowDefinition::new("provision", Target::System).steps(STEPS),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn counters() -> Vec<Arc<AtomicU32>> {
        (0..STEPS.len()).map(|_| Arc::new(AtomicU32::new(0))).collect()
    }

    fn calls(counters: &[Arc<AtomicU32>]) -> Vec<u32> {
        counters.iter().map(|c| c.load(Ordering::SeqCst)).collect()
    }

    fn append_old(store: &MemoryStore, mut record: StepRecord) {
        record.timestamp = Utc::now() - Duration::minutes(5);
        store.append_record(&record).unwrap();
    }

    /// Writes a process that a dead instance ran through `done` steps.
    fn crashed_process(
        store: &MemoryStore,
        done: usize,
        status: ProcessStatus,
        age: Duration,
    ) -> Process {
        let mut process = Process::new(ProcessId::new(), "provision", None);
        process.status = status;
        store.create_process(&process).unwrap();

        let then = Utc::now() - age;
        let mut state = StateEnvelope::new(1);
        let mut created = StepRecord::created(process.id, state.clone());
        created.timestamp = then;
        store.append_record(&created).unwrap();

        for (index, name) in STEPS.iter().take(done).enumerate() {
            let next = state.clone().with(name.to_lowercase(), true);
            let mut record = StepRecord::advanced(
                process.id,
                index as u64 + 1,
                name,
                index,
                OutcomeKind::Success,
                state,
                next.clone(),
            );
            record.timestamp = then;
            store.append_record(&record).unwrap();
            state = next;
        }

        let mut lock = ResourceLock::new(process.lock_key(), process.id, "dead-instance");
        lock.acquired_at = then;
        lock.heartbeat_at = then;
        assert_eq!(store.try_lock(&lock).unwrap(), LockAttempt::Acquired);
        process
    }

    #[test]
    fn test_recovery_continues_after_last_record() {
        let store = MemoryStore::new();
        let process = crashed_process(&store, 3, ProcessStatus::Running, Duration::minutes(5));

        let counters = counters();
        let shared = Arc::new(store.clone());
        let engine = Engine::new(registry(&counters), shared.clone(), shared);

        let report = engine.recover().unwrap();

        assert_eq!(report.reclaimed, vec![process.lock_key()]);
        assert_eq!(report.resumed, vec![(process.id, ProcessStatus::Completed)]);
        assert!(report.errors.is_empty());

        let calls: Vec<u32> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(calls, vec![0, 0, 0, 1, 1]);

        let records = engine.records(process.id).unwrap();
        assert_eq!(records.len(), STEPS.len() + 1);
        assert_eq!(records[4].step, "Verify");
        assert_eq!(records[4].seq, 4);

        let state = engine.state(process.id).unwrap();
        assert!(STEPS.iter().all(|s| state.get_bool(&s.to_lowercase()) == Some(true)));
        assert!(store.get_lock(&process.lock_key()).unwrap().is_none());
    }

    #[test]
    fn test_recent_log_activity_keeps_lock() {
        let store = MemoryStore::new();
        let process = crashed_process(&store, 1, ProcessStatus::Running, Duration::seconds(0));
        let mut lock = store.get_lock(&process.lock_key()).unwrap().unwrap();
        let old = lock.clone();
        lock.heartbeat_at = Utc::now() - Duration::minutes(5);
        assert!(store.reclaim(&old, &lock).unwrap());

        let counters = counters();
        let shared = Arc::new(store.clone());
        let engine = Engine::new(registry(&counters), shared.clone(), shared);

        let report = engine.recover().unwrap();
        assert_eq!(report.skipped, vec![process.lock_key()]);
        assert!(report.resumed.is_empty());
        assert_eq!(
            store.get_lock(&process.lock_key()).unwrap().unwrap().owner,
            "dead-instance"
        );
    }

    #[test]
    fn test_stale_lock_of_waiting_process_is_released() {
        let store = MemoryStore::new();
        let process = crashed_process(&store, 2, ProcessStatus::Waiting, Duration::minutes(5));
        let state = StateEnvelope::new(1)
            .with("reserve", true)
            .with("allocate", true);
        append_old(
            &store,
            StepRecord::suspended(
                process.id,
                3,
                "Configure",
                2,
                state.clone(),
                state,
                InputSchema::new(),
                Wait::input(),
            ),
        );

        let counters = counters();
        let shared = Arc::new(store.clone());
        let engine = Engine::new(registry(&counters), shared.clone(), shared);

        let report = engine.recover().unwrap();
        assert_eq!(report.released, vec![process.lock_key()]);
        assert!(report.resumed.is_empty());
        assert_eq!(engine.process(process.id).unwrap().status, ProcessStatus::Waiting);
        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 0));
    }

    #[test]
    fn test_unlocked_running_process_is_continued() {
        let store = MemoryStore::new();
        let process = crashed_process(&store, 4, ProcessStatus::Running, Duration::minutes(5));
        assert!(store.unlock(&process.lock_key(), "dead-instance").unwrap());

        let counters = counters();
        let shared = Arc::new(store.clone());
        let engine = Engine::new(registry(&counters), shared.clone(), shared);

        let report = engine.recover().unwrap();
        assert!(report.reclaimed.is_empty());
        assert_eq!(report.resumed, vec![(process.id, ProcessStatus::Completed)]);
        assert_eq!(counters[4].load(Ordering::SeqCst), 1);
        assert_eq!(counters[0].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_nothing_to_recover() {
        let engine = Engine::in_memory(registry(&counters()));
        assert!(engine.recover().unwrap().is_empty());
    }

    #[test]
    fn test_suspension_ahead_of_status_is_not_run_past() {
        let store = MemoryStore::new();
        let process = crashed_process(&store, 0, ProcessStatus::Running, Duration::minutes(5));
        let schema = InputSchema::new().required("ok", FieldKind::Bool);
        let state = StateEnvelope::new(1);
        append_old(
            &store,
            StepRecord::suspended(
                process.id,
                1,
                "Reserve",
                0,
                state.clone(),
                state,
                schema.clone(),
                Wait::input(),
            ),
        );

        let counters = counters();
        let shared = Arc::new(store.clone());
        let engine = Engine::new(registry(&counters), shared.clone(), shared);

        let report = engine.recover().unwrap();
        assert_eq!(report.resumed, vec![(process.id, ProcessStatus::Waiting)]);
        assert!(report.errors.is_empty());
        assert_eq!(calls(&counters), vec![0, 0, 0, 0, 0]);
        assert_eq!(engine.process(process.id).unwrap().status, ProcessStatus::Waiting);
        assert_eq!(engine.required_input(process.id).unwrap(), Some(schema));
        assert_eq!(engine.records(process.id).unwrap().len(), 2);

        let status = engine
            .resume(process.id, fields([("ok", true.into())]))
            .unwrap();
        assert_eq!(status, ProcessStatus::Completed);
        assert_eq!(calls(&counters), vec![0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_terminal_record_ahead_of_status_is_kept() {
        for (kind, expected) in [
            (OutcomeKind::Failed, ProcessStatus::Failed),
            (OutcomeKind::Aborted, ProcessStatus::Aborted),
        ] {
            let store = MemoryStore::new();
            let process =
                crashed_process(&store, 1, ProcessStatus::Running, Duration::minutes(5));
            let state = StateEnvelope::new(1).with("reserve", true);
            let record = match kind {
                OutcomeKind::Failed => StepRecord::errored(
                    process.id,
                    2,
                    "Allocate",
                    1,
                    OutcomeKind::Failed,
                    state.clone(),
                    ErrorPayload::new(ErrorKind::FatalStep, "address pool exhausted"),
                ),
                _ => StepRecord::aborted(process.id, 2, state.clone()),
            };
            append_old(&store, record);

            let counters = counters();
            let shared = Arc::new(store.clone());
            let engine = Engine::new(registry(&counters), shared.clone(), shared);

            let report = engine.recover().unwrap();
            assert_eq!(report.resumed, vec![(process.id, expected)]);
            assert!(report.errors.is_empty());
            assert_eq!(calls(&counters), vec![0, 0, 0, 0, 0]);

            assert_eq!(engine.process(process.id).unwrap().status, expected);
            assert_eq!(engine.records(process.id).unwrap().len(), 3);
            assert_eq!(engine.state(process.id).unwrap(), state);
            assert!(store.get_lock(&process.lock_key()).unwrap().is_none());
            if expected == ProcessStatus::Failed {
                assert!(matches!(
                    engine.failure(process.id).unwrap(),
                    Some(EngineError::FatalStep { .. })
                ));
            }
        }
    }

    #[test]
    fn test_resume_record_ahead_of_status_continues() {
        let store = MemoryStore::new();
        let process = crashed_process(&store, 0, ProcessStatus::Waiting, Duration::minutes(5));
        let state = StateEnvelope::new(1);
        let resumed = state.clone().with("ok", true);
        append_old(
            &store,
            StepRecord::suspended(
                process.id,
                1,
                "Reserve",
                0,
                state.clone(),
                state.clone(),
                InputSchema::new().required("ok", FieldKind::Bool),
                Wait::input(),
            ),
        );
        append_old(
            &store,
            StepRecord::resumed(process.id, 2, "Reserve", 0, state, resumed, Wait::input()),
        );

        let counters = counters();
        let shared = Arc::new(store.clone());
        let engine = Engine::new(registry(&counters), shared.clone(), shared);

        let report = engine.recover().unwrap();
        assert_eq!(report.reclaimed, vec![process.lock_key()]);
        assert_eq!(report.resumed, vec![(process.id, ProcessStatus::Completed)]);
        assert_eq!(calls(&counters), vec![0, 1, 1, 1, 1]);
        assert_eq!(engine.state(process.id).unwrap().get_bool("ok"), Some(true));
    }
}
