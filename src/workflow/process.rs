//! Process Data Model
//!
//! Persisted rows of the engine: the process itself and the step records
//! that make up its append-only log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::schema::InputSchema;
use super::state::StateEnvelope;

/// Unique identifier of a process.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ProcessId(Uuid);

impl ProcessId {
    /// Generates a new random process id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ProcessId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a process.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Created,
    Running,
    /// Suspended, waiting for external input
    Waiting,
    Completed,
    Failed,
    Aborted,
}

impl ProcessStatus {
    /// Terminal processes never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One execution instance of a workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Process {
    pub id: ProcessId,
    pub workflow: String,

    /// Resource this process acts on; `None` for creation workflows
    pub target: Option<String>,

    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,

    /// Set by `abort` while another executor is running the process
    #[serde(default)]
    pub abort_requested: bool,
}

impl Process {
    /// Creates a process row in `Created` status.
    pub fn new(id: ProcessId, workflow: impl Into<String>, target: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow: workflow.into(),
            target,
            status: ProcessStatus::Created,
            created_at: now,
            modified_at: now,
            abort_requested: false,
        }
    }

    /// Key of the resource lock guarding this process.
    ///
    /// Processes without a target lock on their own id so they still have
    /// a single executor.
    pub fn lock_key(&self) -> String {
        match &self.target {
            Some(target) => target.clone(),
            None => format!("process:{}", self.id),
        }
    }
}

/// Kind of a step record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Engine marker written when the process is created
    Created,
    Success,
    Skipped,
    Suspend,
    /// External input was accepted for a suspended step
    Resumed,
    /// A transient failure; the step will be invoked again
    Retry,
    Failed,
    /// Engine marker written when the process is aborted
    Aborted,
}

/// What a suspended process is waiting for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    /// Input from a person, collected by a form layer
    #[default]
    Input,
    /// A call back from an external system
    Callback,
}

/// How a step suspended.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Wait {
    #[serde(default)]
    pub kind: WaitKind,

    /// Invoke the suspended step again after the resume instead of moving
    /// on to the next one. Set by step groups that suspend part way.
    #[serde(default)]
    pub reenter: bool,
}

impl Wait {
    pub fn input() -> Self {
        Self::default()
    }

    pub fn callback() -> Self {
        Self {
            kind: WaitKind::Callback,
            reenter: false,
        }
    }

    pub fn reentering(mut self) -> Self {
        self.reenter = true;
        self
    }

    /// Index of the step to run after a resume of step `index`.
    pub fn continue_at(&self, index: usize) -> usize {
        if self.reenter {
            index
        } else {
            index + 1
        }
    }
}

/// Category of a recorded step error.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RetryableStep,
    FatalStep,
    SchemaDrift,
}

/// Serializable error stored in a step record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Error this one wraps, e.g. the last transient failure before the
    /// retry budget ran out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorPayload>>,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            cause: None,
        }
    }

    pub fn with_details(mut self, details: Option<serde_json::Value>) -> Self {
        self.details = details;
        self
    }

    pub fn caused_by(mut self, cause: ErrorPayload) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// One entry of a process's persistence log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub process_id: ProcessId,

    /// Contiguous, starting at 0
    pub seq: u64,

    pub step: String,

    /// Position of the step in the workflow; `None` for engine markers
    pub index: Option<usize>,

    pub kind: OutcomeKind,
    pub input: StateEnvelope,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StateEnvelope>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,

    /// Input a suspended process needs before it can continue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_input: Option<InputSchema>,

    /// Set on `suspend` and `resumed` records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<Wait>,

    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    fn base(
        process_id: ProcessId,
        seq: u64,
        step: &str,
        index: Option<usize>,
        kind: OutcomeKind,
        input: StateEnvelope,
    ) -> Self {
        Self {
            process_id,
            seq,
            step: step.to_string(),
            index,
            kind,
            input,
            output: None,
            error: None,
            required_input: None,
            wait: None,
            timestamp: Utc::now(),
        }
    }

    /// Marker opening the log of a new process.
    pub fn created(process_id: ProcessId, initial: StateEnvelope) -> Self {
        let mut record = Self::base(
            process_id,
            0,
            "Start",
            None,
            OutcomeKind::Created,
            initial.clone(),
        );
        record.output = Some(initial);
        record
    }

    /// A step that produced a new state (`Success`, `Skipped` or `Resumed`).
    pub fn advanced(
        process_id: ProcessId,
        seq: u64,
        step: &str,
        index: usize,
        kind: OutcomeKind,
        input: StateEnvelope,
        output: StateEnvelope,
    ) -> Self {
        let mut record = Self::base(process_id, seq, step, Some(index), kind, input);
        record.output = Some(output);
        record
    }

    /// A step that suspended the process.
    pub fn suspended(
        process_id: ProcessId,
        seq: u64,
        step: &str,
        index: usize,
        input: StateEnvelope,
        output: StateEnvelope,
        required_input: InputSchema,
        wait: Wait,
    ) -> Self {
        let mut record =
            Self::base(process_id, seq, step, Some(index), OutcomeKind::Suspend, input);
        record.output = Some(output);
        record.required_input = Some(required_input);
        record.wait = Some(wait);
        record
    }

    /// External input accepted for a step that suspended with `wait`.
    pub fn resumed(
        process_id: ProcessId,
        seq: u64,
        step: &str,
        index: usize,
        input: StateEnvelope,
        output: StateEnvelope,
        wait: Wait,
    ) -> Self {
        let mut record = Self::advanced(
            process_id,
            seq,
            step,
            index,
            OutcomeKind::Resumed,
            input,
            output,
        );
        record.wait = Some(wait);
        record
    }

    /// A failed invocation; `kind` is `Retry` or `Failed`.
    pub fn errored(
        process_id: ProcessId,
        seq: u64,
        step: &str,
        index: usize,
        kind: OutcomeKind,
        input: StateEnvelope,
        error: ErrorPayload,
    ) -> Self {
        let mut record = Self::base(process_id, seq, step, Some(index), kind, input);
        record.error = Some(error);
        record
    }

    /// Marker closing the log of an aborted process.
    pub fn aborted(process_id: ProcessId, seq: u64, state: StateEnvelope) -> Self {
        let mut record = Self::base(
            process_id,
            seq,
            "User Aborted",
            None,
            OutcomeKind::Aborted,
            state.clone(),
        );
        record.output = Some(state);
        record
    }
}
