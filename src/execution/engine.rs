//! Process Execution Engine
//!
//! The engine that drives processes through their workflow:
//! - Input validation and process creation with a per-resource claim
//! - The step loop, with retries, suspension and schema checks
//! - Resume with external input or a call back, and cooperative abort
//! - Lock heartbeats while a step runs
//! - An engine-wide pause switch
//!
//! Every transition is appended to the process log before the engine moves
//! on, so a process can always be continued from its log alone. When the
//! process row and the log disagree, the log wins.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use super::lock::{LockManager, LockSettings};
use super::replay::{replay, PendingInput, Replay};
use super::retry::RetryPolicy;
use crate::config::{ConfigError, EngineConfig};
use crate::error::EngineError;
use crate::events::{EventSink, LogSink, ProcessEvent};
use crate::store::{LockStore, MemoryStore, ProcessStore};
use crate::workflow::combinators::CALLBACK_TOKEN_KEY;
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::process::{
    ErrorKind, ErrorPayload, OutcomeKind, Process, ProcessId, ProcessStatus, StepRecord, WaitKind,
};
use crate::workflow::registry::Registry;
use crate::workflow::schema::InputSchema;
use crate::workflow::state::{Fields, StateEnvelope};
use crate::workflow::step::{Step, StepContext, StepError, StepOutcome};

/// Workflow execution engine.
///
/// Cheap to share behind an `Arc`: all operations take `&self`, and several
/// engines (in one or several OS processes) may work on the same stores.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use procflow::execution::Engine;
/// use procflow::workflow::state::fields;
/// use procflow::workflow::{ProcessStatus, Registry, Step, Target, WorkflowDefinition};
///
/// let mut registry = Registry::new();
/// registry.register_step(Step::action("Greet", |_, s| Ok(s.clone().with("greeted", true))))?;
/// registry.register_workflow(WorkflowDefinition::new("greet", Target::System).step("Greet"))?;
///
/// let engine = Engine::in_memory(Arc::new(registry));
/// let id = engine.start("greet", fields([("name", "Ada".into())]))?;
///
/// assert_eq!(engine.process(id)?.status, ProcessStatus::Completed);
/// assert_eq!(engine.state(id)?.get_bool("greeted"), Some(true));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Engine {
    registry: Arc<Registry>,
    processes: Arc<dyn ProcessStore>,
    locks: LockManager,
    sink: Arc<dyn EventSink>,
    retry: RetryPolicy,
    paused: AtomicBool,
}

fn new_instance_id() -> String {
    format!("engine-{}", Uuid::new_v4())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Engine {
    /// Creates an engine on the given stores.
    pub fn new(
        registry: Arc<Registry>,
        processes: Arc<dyn ProcessStore>,
        locks: Arc<dyn LockStore>,
    ) -> Self {
        let instance_id = new_instance_id();
        info!("Engine instance {} starting", instance_id);
        Self {
            registry,
            processes,
            locks: LockManager::new(locks, instance_id, LockSettings::default()),
            sink: Arc::new(LogSink),
            retry: RetryPolicy::default(),
            paused: AtomicBool::new(false),
        }
    }

    /// Creates an engine on a fresh [`MemoryStore`].
    pub fn in_memory(registry: Arc<Registry>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(registry, store.clone(), store)
    }

    /// Creates an engine from configuration, opening the configured store.
    pub fn from_config(
        registry: Arc<Registry>,
        config: &EngineConfig,
    ) -> Result<Self, ConfigError> {
        let (processes, locks) = config.store.open()?;
        let mut engine = Self::new(registry, processes, locks);
        if let Some(id) = &config.instance_id {
            engine.set_instance_id(id.clone());
        }
        engine.set_retry_policy(config.retry.clone());
        engine.set_lock_settings(config.lock.clone());
        Ok(engine)
    }

    /// Sets the receiver of process events.
    pub fn set_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sink = sink;
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry = policy;
    }

    pub fn set_lock_settings(&mut self, settings: LockSettings) {
        self.locks.set_settings(settings);
    }

    /// Sets the owner name this engine writes into locks.
    pub fn set_instance_id(&mut self, id: impl Into<String>) {
        self.locks.set_owner(id);
    }

    pub fn instance_id(&self) -> &str {
        self.locks.owner()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub(crate) fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    pub(crate) fn process_store(&self) -> &dyn ProcessStore {
        self.processes.as_ref()
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    /// Starts a process and runs it in the calling thread until it
    /// completes, fails, suspends or is paused.
    pub fn start(&self, workflow: &str, input: Fields) -> Result<ProcessId, EngineError> {
        let (process, definition) = self.begin(workflow, input)?;
        let key = process.lock_key();

        let result = self.drive(&process, &definition);
        self.release(&key);
        result.map(|_| process.id)
    }

    /// Creates a process and leaves it `running` for a worker to pick up.
    pub fn create(&self, workflow: &str, input: Fields) -> Result<ProcessId, EngineError> {
        let (process, _) = self.begin(workflow, input)?;
        self.release(&process.lock_key());
        Ok(process.id)
    }

    /// Continues a process that nobody is driving.
    ///
    /// Waiting and terminal processes are left alone and their status is
    /// returned.
    pub fn run_process(&self, id: ProcessId) -> Result<ProcessStatus, EngineError> {
        let process = self.processes.load_process(id)?;
        if !self.needs_driver(&process)? {
            return Ok(process.status);
        }

        let key = process.lock_key();
        if !self.locks.acquire(&key, id, Duration::ZERO)? {
            return Err(self.contention(&key));
        }

        let result = self
            .processes
            .load_process(id)
            .map_err(EngineError::from)
            .and_then(|process| self.continue_locked(process));
        self.release(&key);
        result
    }

    /// Resumes a waiting process with external input.
    ///
    /// The input is validated against the schema recorded when the process
    /// suspended. Invalid input leaves the process untouched. Processes
    /// waiting for a call back can be resumed this way as well, e.g. by an
    /// operator completing the external work by hand.
    pub fn resume(&self, id: ProcessId, input: Fields) -> Result<ProcessStatus, EngineError> {
        self.resume_with(id, input, None)
    }

    /// Delivers the call back a [`callback`](crate::workflow::callback)
    /// step is waiting for.
    ///
    /// `token` must be the one the step handed to the external system.
    pub fn callback(
        &self,
        id: ProcessId,
        token: &str,
        input: Fields,
    ) -> Result<ProcessStatus, EngineError> {
        self.resume_with(id, input, Some(token))
    }

    /// Aborts a process.
    ///
    /// A waiting or undriven process is aborted immediately. A process that
    /// another thread or instance is running gets an abort request, which
    /// its step loop honours before the next step or when the running step
    /// suspends. Aborting an aborted process does nothing; completed and
    /// failed processes cannot be aborted.
    pub fn abort(&self, id: ProcessId) -> Result<ProcessStatus, EngineError> {
        let process = self.processes.load_process(id)?;
        if let Some(status) = Self::abort_precheck(&process)? {
            return Ok(status);
        }

        let key = process.lock_key();
        let wait = if process.status == ProcessStatus::Waiting {
            self.locks.settings().resume_timeout
        } else {
            Duration::ZERO
        };

        if self.locks.acquire(&key, id, wait)? {
            return self.abort_with_lock(id, &key);
        }

        let process = self.processes.request_abort(id, Utc::now())?;
        info!("Abort requested for process {} ({})", id, process.status);

        // The driver suspended before it saw the request
        if process.status == ProcessStatus::Waiting
            && self
                .locks
                .acquire(&key, id, self.locks.settings().resume_timeout)?
        {
            return self.abort_with_lock(id, &key);
        }
        Ok(process.status)
    }

    /// Makes step loops stop before their next step.
    ///
    /// Paused processes stay `running` and are continued by
    /// [`run_process`](Self::run_process) after [`unpause`](Self::unpause).
    pub fn pause(&self) {
        info!("Engine paused");
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        info!("Engine resumed");
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn process(&self, id: ProcessId) -> Result<Process, EngineError> {
        Ok(self.processes.load_process(id)?)
    }

    pub fn records(&self, id: ProcessId) -> Result<Vec<StepRecord>, EngineError> {
        Ok(self.processes.load_records(id)?)
    }

    /// Current state, rebuilt from the log.
    pub fn state(&self, id: ProcessId) -> Result<StateEnvelope, EngineError> {
        Ok(self.cursor(id)?.state)
    }

    /// Input a waiting process needs; `None` for any other status.
    pub fn required_input(&self, id: ProcessId) -> Result<Option<InputSchema>, EngineError> {
        if self.processes.load_process(id)?.status != ProcessStatus::Waiting {
            return Ok(None);
        }
        Ok(self.cursor(id)?.pending.map(|pending| pending.schema))
    }

    /// The error that failed a process, rebuilt from its last `failed` record.
    pub fn failure(&self, id: ProcessId) -> Result<Option<EngineError>, EngineError> {
        let records = self.processes.load_records(id)?;
        Ok(records
            .iter()
            .rev()
            .find(|r| r.kind == OutcomeKind::Failed)
            .and_then(|r| {
                r.error
                    .as_ref()
                    .map(|payload| EngineError::from_payload(&r.step, payload))
            }))
    }

    /// Processes, oldest first, optionally filtered by status.
    pub fn list(&self, status: Option<ProcessStatus>) -> Result<Vec<Process>, EngineError> {
        let processes = self.processes.list_processes()?;
        Ok(match status {
            Some(status) => processes
                .into_iter()
                .filter(|p| p.status == status)
                .collect(),
            None => processes,
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn definition(&self, workflow: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.registry
            .workflow(workflow)
            .ok_or_else(|| EngineError::workflow_not_found(workflow))
    }

    fn cursor(&self, id: ProcessId) -> Result<Replay, EngineError> {
        Ok(replay(id, &self.processes.load_records(id)?)?)
    }

    /// Whether `process` has steps left to run without outside input.
    pub(crate) fn needs_driver(&self, process: &Process) -> Result<bool, EngineError> {
        Ok(match process.status {
            ProcessStatus::Created | ProcessStatus::Running => true,
            // The log moved past the suspension but the row did not follow
            ProcessStatus::Waiting => self.cursor(process.id)?.pending.is_none(),
            _ => false,
        })
    }

    fn contention(&self, key: &str) -> EngineError {
        let holder = match self.locks.holder(key) {
            Ok(lock) => lock.map(|l| l.process_id),
            Err(e) => {
                warn!("Could not read lock '{}': {}", key, e);
                None
            }
        };
        EngineError::LockContention {
            resource: key.to_string(),
            holder,
        }
    }

    fn release(&self, key: &str) {
        if let Err(e) = self.locks.release(key) {
            error!("Failed to release lock '{}': {}", key, e);
        }
    }

    fn emit(&self, event: ProcessEvent) {
        self.sink.emit(&event);
    }

    fn set_status(
        &self,
        process: &Process,
        status: ProcessStatus,
    ) -> Result<Process, EngineError> {
        let updated = self.processes.set_status(process.id, status, Utc::now())?;
        debug!("Process {} is now {}", process.id, status);
        Ok(updated)
    }

    /// Appends a record and advances `cursor` past it.
    fn record(&self, cursor: &mut Replay, record: StepRecord) -> Result<(), EngineError> {
        self.processes.append_record(&record)?;
        cursor.apply(&record)?;
        Ok(())
    }

    /// Brings the process row in line with its log.
    ///
    /// Records are written before the row is updated, so a crash in
    /// between leaves the row one transition behind.
    fn settle(&self, process: &Process, cursor: &Replay) -> Result<Process, EngineError> {
        let logged = match (cursor.terminal, &cursor.pending) {
            (Some(OutcomeKind::Aborted), _) => ProcessStatus::Aborted,
            (Some(_), _) => ProcessStatus::Failed,
            (None, Some(_)) => ProcessStatus::Waiting,
            (None, None) if process.status == ProcessStatus::Waiting => ProcessStatus::Running,
            (None, None) => return Ok(process.clone()),
        };
        if process.status == logged {
            return Ok(process.clone());
        }

        warn!(
            "Process {} is {} but its log ends in {:?}, moving it to {}",
            process.id, process.status, cursor.last_kind, logged
        );
        let settled = self.set_status(process, logged)?;

        let mut event = ProcessEvent::new(process.id, &process.workflow, logged);
        if let Some(pending) = &cursor.pending {
            event = event
                .with_step(pending.step.as_str())
                .with_required_input(pending.schema.clone(), pending.wait.kind);
        }
        self.emit(event);
        Ok(settled)
    }

    /// Validates input, creates the process and moves it to `running`.
    /// On success the resource lock is held by this engine.
    fn begin(
        &self,
        workflow: &str,
        input: Fields,
    ) -> Result<(Process, Arc<WorkflowDefinition>), EngineError> {
        let definition = self.definition(workflow)?;
        definition.initial_input.validate(&input)?;

        let id = ProcessId::new();
        let process = Process::new(id, definition.name.clone(), definition.resource_id(&input));
        let key = process.lock_key();

        if !self.locks.acquire(&key, id, Duration::ZERO)? {
            return Err(self.contention(&key));
        }

        if let Err(e) = self.processes.create_process(&process) {
            self.release(&key);
            return Err(e.into());
        }
        info!("Created process {} of workflow '{}'", id, definition.name);

        let initial = definition.initial_state(&input);
        let setup = self
            .processes
            .append_record(&StepRecord::created(id, initial))
            .map_err(EngineError::from)
            .and_then(|_| {
                self.emit(
                    ProcessEvent::new(id, &definition.name, ProcessStatus::Created)
                        .with_step("Start"),
                );
                self.set_status(&process, ProcessStatus::Running)
            });

        match setup {
            Ok(process) => {
                self.emit(ProcessEvent::new(id, &definition.name, ProcessStatus::Running));
                Ok((process, definition))
            }
            Err(e) => {
                self.release(&key);
                Err(e)
            }
        }
    }

    /// Moves a `created` process to `running` and drives it. The caller
    /// holds the lock.
    pub(crate) fn continue_locked(&self, process: Process) -> Result<ProcessStatus, EngineError> {
        let definition = self.definition(&process.workflow)?;
        let process = match process.status {
            ProcessStatus::Created => {
                let running = self.set_status(&process, ProcessStatus::Running)?;
                self.emit(ProcessEvent::new(
                    process.id,
                    &process.workflow,
                    ProcessStatus::Running,
                ));
                running
            }
            status if status.is_terminal() => return Ok(status),
            _ => process,
        };
        self.drive(&process, &definition)
    }

    fn resume_with(
        &self,
        id: ProcessId,
        input: Fields,
        token: Option<&str>,
    ) -> Result<ProcessStatus, EngineError> {
        let process = self.processes.load_process(id)?;
        if process.status != ProcessStatus::Waiting {
            return Err(EngineError::InvalidTransition {
                process_id: id,
                action: "resume",
                status: process.status,
            });
        }
        if let Some(pending) = self.cursor(id)?.pending {
            pending.schema.validate(&input)?;
        }

        let key = process.lock_key();
        if !self
            .locks
            .acquire(&key, id, self.locks.settings().resume_timeout)?
        {
            return Err(self.contention(&key));
        }

        let result = self.resume_locked(id, input, token);
        self.release(&key);
        result
    }

    fn resume_locked(
        &self,
        id: ProcessId,
        input: Fields,
        token: Option<&str>,
    ) -> Result<ProcessStatus, EngineError> {
        let mut cursor = self.cursor(id)?;
        let process = self.settle(&self.processes.load_process(id)?, &cursor)?;
        let pending = match (process.status, cursor.pending.clone()) {
            (ProcessStatus::Waiting, Some(pending)) => pending,
            (status, _) => {
                return Err(EngineError::InvalidTransition {
                    process_id: id,
                    action: "resume",
                    status,
                })
            }
        };
        if process.abort_requested {
            return self.abort_locked(id);
        }
        if let Some(token) = token {
            Self::check_callback(id, &pending, &cursor.state, token)?;
        }

        let definition = self.definition(&process.workflow)?;
        if definition.steps.get(pending.index).map(String::as_str) != Some(pending.step.as_str()) {
            error!(
                "Process {} suspended at '{}' (step {}), which workflow '{}' no longer has there",
                id, pending.step, pending.index, definition.name
            );
            return Err(EngineError::step_not_found(&pending.step));
        }

        let merged = cursor.state.clone().merge(input);
        let record = StepRecord::resumed(
            id,
            cursor.next_seq(),
            &pending.step,
            pending.index,
            cursor.state.clone(),
            merged,
            pending.wait,
        );
        self.record(&mut cursor, record)?;
        info!("Resumed process {} at step '{}'", id, pending.step);

        let process = self.set_status(&process, ProcessStatus::Running)?;
        self.emit(
            ProcessEvent::new(id, &process.workflow, ProcessStatus::Running)
                .with_step(pending.step),
        );
        self.drive(&process, &definition)
    }

    fn check_callback(
        id: ProcessId,
        pending: &PendingInput,
        state: &StateEnvelope,
        token: &str,
    ) -> Result<(), EngineError> {
        let reject = |reason: &str| EngineError::CallbackRejected {
            process_id: id,
            reason: reason.to_string(),
        };
        if pending.wait.kind != WaitKind::Callback {
            return Err(reject("process is waiting for input, not a callback"));
        }
        if state.get_str(CALLBACK_TOKEN_KEY) != Some(token) {
            return Err(reject("token does not match"));
        }
        Ok(())
    }

    fn abort_precheck(process: &Process) -> Result<Option<ProcessStatus>, EngineError> {
        match process.status {
            ProcessStatus::Aborted => {
                debug!("Process {} is already aborted", process.id);
                Ok(Some(ProcessStatus::Aborted))
            }
            ProcessStatus::Completed | ProcessStatus::Failed => {
                Err(EngineError::InvalidTransition {
                    process_id: process.id,
                    action: "abort",
                    status: process.status,
                })
            }
            _ => Ok(None),
        }
    }

    /// Aborts `id` while holding the lock on `key`, then releases it.
    fn abort_with_lock(&self, id: ProcessId, key: &str) -> Result<ProcessStatus, EngineError> {
        let result = self.abort_locked(id);
        self.release(key);
        result
    }

    fn abort_locked(&self, id: ProcessId) -> Result<ProcessStatus, EngineError> {
        let mut cursor = self.cursor(id)?;
        let process = self.settle(&self.processes.load_process(id)?, &cursor)?;
        if let Some(status) = Self::abort_precheck(&process)? {
            return Ok(status);
        }
        self.finish_abort(&process, &mut cursor)
    }

    fn finish_abort(
        &self,
        process: &Process,
        cursor: &mut Replay,
    ) -> Result<ProcessStatus, EngineError> {
        let record = StepRecord::aborted(process.id, cursor.next_seq(), cursor.state.clone());
        self.record(cursor, record)?;
        self.set_status(process, ProcessStatus::Aborted)?;
        info!("Process {} aborted", process.id);
        self.emit(ProcessEvent::new(
            process.id,
            &process.workflow,
            ProcessStatus::Aborted,
        ));
        Ok(ProcessStatus::Aborted)
    }

    fn fail(
        &self,
        process: &Process,
        cursor: &mut Replay,
        step: &str,
        index: usize,
        payload: ErrorPayload,
    ) -> Result<ProcessStatus, EngineError> {
        let message = payload.message.clone();
        let record = StepRecord::errored(
            process.id,
            cursor.next_seq(),
            step,
            index,
            OutcomeKind::Failed,
            cursor.state.clone(),
            payload,
        );
        self.record(cursor, record)?;
        self.set_status(process, ProcessStatus::Failed)?;
        error!("Step '{}' of process {} failed: {}", step, process.id, message);
        self.emit(
            ProcessEvent::new(process.id, &process.workflow, ProcessStatus::Failed)
                .with_step(step)
                .with_error(message),
        );
        Ok(ProcessStatus::Failed)
    }

    /// The step loop. The caller holds the lock.
    fn drive(
        &self,
        process: &Process,
        definition: &WorkflowDefinition,
    ) -> Result<ProcessStatus, EngineError> {
        let key = process.lock_key();
        let mut cursor = self.cursor(process.id)?;
        let process = &self.settle(&self.processes.load_process(process.id)?, &cursor)?;

        loop {
            let current = self.processes.load_process(process.id)?;
            if current.status != ProcessStatus::Running {
                return Ok(current.status);
            }
            if current.abort_requested {
                return self.finish_abort(&current, &mut cursor);
            }
            if self.is_paused() {
                info!(
                    "Engine paused, process {} stops before step {}",
                    process.id, cursor.next_index
                );
                return Ok(ProcessStatus::Running);
            }

            let index = cursor.next_index;
            let Some(name) = definition.steps.get(index) else {
                self.set_status(process, ProcessStatus::Completed)?;
                info!("Process {} completed", process.id);
                self.emit(ProcessEvent::new(
                    process.id,
                    &process.workflow,
                    ProcessStatus::Completed,
                ));
                return Ok(ProcessStatus::Completed);
            };
            let step = self
                .registry
                .step(name)
                .ok_or_else(|| EngineError::step_not_found(name))?;

            if let Err(err) = step.check_state(&cursor.state) {
                let detail = match err {
                    EngineError::SchemaDrift { detail, .. } => detail,
                    other => other.to_string(),
                };
                let payload = ErrorPayload::new(ErrorKind::SchemaDrift, detail);
                return self.fail(process, &mut cursor, name, index, payload);
            }

            let ctx = StepContext {
                process_id: process.id,
                workflow: process.workflow.clone(),
                step: name.clone(),
                index,
                attempt: cursor.attempts + 1,
            };
            info!("Starting step: {} (attempt {})", name, ctx.attempt);
            let outcome = self.invoke(step, &ctx, &cursor.state, &key);

            if !self.locks.heartbeat(&key)? {
                warn!(
                    "Lost lock '{}' while running step '{}' of process {}",
                    key, name, process.id
                );
                return Err(self.contention(&key));
            }

            match outcome {
                StepOutcome::Success(next) => {
                    self.advance(process, &mut cursor, name, index, OutcomeKind::Success, next)?;
                }
                StepOutcome::Skipped(next) => {
                    self.advance(process, &mut cursor, name, index, OutcomeKind::Skipped, next)?;
                }
                StepOutcome::Suspend {
                    state,
                    schema,
                    wait,
                } => {
                    let record = StepRecord::suspended(
                        process.id,
                        cursor.next_seq(),
                        name,
                        index,
                        cursor.state.clone(),
                        state,
                        schema.clone(),
                        wait,
                    );
                    self.record(&mut cursor, record)?;
                    let waiting = self.set_status(process, ProcessStatus::Waiting)?;
                    if waiting.abort_requested {
                        return self.finish_abort(&waiting, &mut cursor);
                    }

                    info!("Process {} waiting for input at step '{}'", process.id, name);
                    self.emit(
                        ProcessEvent::new(process.id, &process.workflow, ProcessStatus::Waiting)
                            .with_step(name.as_str())
                            .with_required_input(schema, wait.kind),
                    );
                    return Ok(ProcessStatus::Waiting);
                }
                StepOutcome::Retryable(err) => {
                    let attempts = cursor.attempts + 1;
                    let cause = err.to_payload(ErrorKind::RetryableStep);

                    if self.retry.exhausted(attempts) {
                        let payload = ErrorPayload::new(
                            ErrorKind::FatalStep,
                            format!(
                                "retry limit of {} attempts exhausted: {}",
                                attempts, err.message
                            ),
                        )
                        .caused_by(cause);
                        return self.fail(process, &mut cursor, name, index, payload);
                    }

                    let record = StepRecord::errored(
                        process.id,
                        cursor.next_seq(),
                        name,
                        index,
                        OutcomeKind::Retry,
                        cursor.state.clone(),
                        cause,
                    );
                    self.record(&mut cursor, record)?;

                    let delay = self.retry.delay_for(attempts);
                    warn!(
                        "Step '{}' failed transiently (attempt {}/{}): {}. Retrying in {:?}",
                        name, attempts, self.retry.max_attempts, err, delay
                    );
                    self.sleep_with_heartbeat(delay, &key);
                }
                StepOutcome::Fatal(err) => {
                    let payload = err.to_payload(ErrorKind::FatalStep);
                    return self.fail(process, &mut cursor, name, index, payload);
                }
            }
        }
    }

    fn advance(
        &self,
        process: &Process,
        cursor: &mut Replay,
        name: &str,
        index: usize,
        kind: OutcomeKind,
        next: StateEnvelope,
    ) -> Result<(), EngineError> {
        let changed = cursor.state.changed_keys(&next);
        if !changed.is_empty() {
            debug!("Step '{}' changed: {}", name, changed.join(", "));
        }

        let record = StepRecord::advanced(
            process.id,
            cursor.next_seq(),
            name,
            index,
            kind,
            cursor.state.clone(),
            next,
        );
        self.record(cursor, record)?;

        match kind {
            OutcomeKind::Skipped => info!("Step '{}' skipped", name),
            _ => info!("Step '{}' completed successfully", name),
        }
        self.emit(
            ProcessEvent::new(process.id, &process.workflow, ProcessStatus::Running)
                .with_step(name),
        );
        Ok(())
    }

    /// Runs one step while a helper thread keeps the lock heartbeat fresh.
    /// A panicking step is treated as a fatal failure.
    fn invoke(
        &self,
        step: &Step,
        ctx: &StepContext,
        state: &StateEnvelope,
        key: &str,
    ) -> StepOutcome {
        let interval = self.locks.settings().heartbeat_interval;
        let (done_tx, done_rx) = channel::<()>();

        thread::scope(|scope| {
            scope.spawn(move || loop {
                match done_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = self.locks.heartbeat(key) {
                            warn!("Heartbeat for lock '{}' failed: {}", key, e);
                        }
                    }
                    _ => break,
                }
            });

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| step.execute(ctx, state)))
                .unwrap_or_else(|payload| {
                    StepOutcome::Fatal(StepError::new(format!(
                        "step panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            let _ = done_tx.send(());
            outcome
        })
    }

    fn sleep_with_heartbeat(&self, delay: Duration, key: &str) {
        let interval = self
            .locks
            .settings()
            .heartbeat_interval
            .max(Duration::from_millis(1));
        let deadline = Instant::now() + delay;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(interval.min(deadline - now));
            if let Err(e) = self.locks.heartbeat(key) {
                warn!("Heartbeat for lock '{}' failed: {}", key, e);
            }
        }
    }
}
