//! Workflow Steps
//!
//! A step is a named transformation of the process state into a
//! [`StepOutcome`]. Steps are registered once in the
//! [`Registry`](super::Registry) and referenced by name from workflow
//! definitions.
//!
//! The engine guarantees at-least-once invocation per retry budget, so
//! steps must be idempotent. Results of calls to external systems belong in
//! the returned state: replaying a process never invokes a step again.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::process::{ErrorKind, ErrorPayload, ProcessId, Wait};
use super::schema::InputSchema;
use super::state::StateEnvelope;
use crate::error::EngineError;

/// Schema version assumed for steps that don't declare one.
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// Error reported by a step function.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    pub details: Option<Value>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    /// Attaches structured diagnostics (e.g. an upstream API response).
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub(crate) fn to_payload(&self, kind: ErrorKind) -> ErrorPayload {
        ErrorPayload::new(kind, self.message.clone()).with_details(self.details.clone())
    }
}

impl From<&str> for StepError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Result of invoking a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Continue with the next step
    Success(StateEnvelope),
    /// The step chose not to run; continue with the next step
    Skipped(StateEnvelope),
    /// Pause until external input satisfying `schema` arrives
    Suspend {
        state: StateEnvelope,
        schema: InputSchema,
        wait: Wait,
    },
    /// Transient failure; the engine retries after a backoff
    Retryable(StepError),
    /// Permanent failure; the process fails
    Fatal(StepError),
}

impl StepOutcome {
    /// Waits for input from a person.
    pub fn suspend(state: StateEnvelope, schema: InputSchema) -> Self {
        Self::Suspend {
            state,
            schema,
            wait: Wait::input(),
        }
    }

    /// Waits for an external system to call back with data matching
    /// `schema`.
    pub fn await_callback(state: StateEnvelope, schema: InputSchema) -> Self {
        Self::Suspend {
            state,
            schema,
            wait: Wait::callback(),
        }
    }
}

/// Execution context handed to a step.
///
/// Contains no wall-clock value so steps stay deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct StepContext {
    pub process_id: ProcessId,
    pub workflow: String,
    pub step: String,
    pub index: usize,
    /// 1 on the first invocation, incremented per retry
    pub attempt: u32,
}

/// Signature of a step function.
pub type StepFn = dyn Fn(&StepContext, &StateEnvelope) -> StepOutcome + Send + Sync;

/// A named, registered unit of process logic.
///
/// # Example
///
/// ```
/// use procflow::workflow::{FieldKind, InputSchema, Step};
///
/// let allocate = Step::action("Allocate port", |_ctx, state| {
///     Ok(state.clone().with("port", "ge-0/0/1"))
/// });
///
/// let confirm = Step::input(
///     "Confirm patching",
///     InputSchema::new().required("confirmed", FieldKind::Bool),
/// );
///
/// assert_eq!(allocate.name(), "Allocate port");
/// assert_eq!(confirm.schema_version(), 1);
/// ```
#[derive(Clone)]
pub struct Step {
    name: String,
    schema_version: u32,
    requires: Option<InputSchema>,
    func: Arc<StepFn>,
}

impl Step {
    /// Creates a step from a function returning a raw outcome.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StepContext, &StateEnvelope) -> StepOutcome + Send + Sync + 'static,
    {
        Self {
            name: name.into().trim().to_string(),
            schema_version: DEFAULT_SCHEMA_VERSION,
            requires: None,
            func: Arc::new(func),
        }
    }

    /// Creates a step whose errors are fatal.
    pub fn action<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StepContext, &StateEnvelope) -> Result<StateEnvelope, StepError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, move |ctx, state| match func(ctx, state) {
            Ok(next) => StepOutcome::Success(next),
            Err(err) => StepOutcome::Fatal(err),
        })
    }

    /// Creates a step whose errors are transient and retried.
    pub fn retryable<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StepContext, &StateEnvelope) -> Result<StateEnvelope, StepError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, move |ctx, state| match func(ctx, state) {
            Ok(next) => StepOutcome::Success(next),
            Err(err) => StepOutcome::Retryable(err),
        })
    }

    /// Creates a step that suspends the process until input matching
    /// `schema` is supplied. The input is merged into the state on resume.
    pub fn input(name: impl Into<String>, schema: InputSchema) -> Self {
        Self::new(name, move |_ctx, state| {
            StepOutcome::suspend(state.clone(), schema.clone())
        })
    }

    /// Declares the state schema version this step was written against.
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Declares fields that must be present in the incoming state.
    pub fn requires(mut self, schema: InputSchema) -> Self {
        self.requires = Some(schema);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Returns a copy of this step running `func` instead.
    pub(crate) fn with_func<F>(&self, func: F) -> Self
    where
        F: Fn(&StepContext, &StateEnvelope) -> StepOutcome + Send + Sync + 'static,
    {
        Self {
            name: self.name.clone(),
            schema_version: self.schema_version,
            requires: self.requires.clone(),
            func: Arc::new(func),
        }
    }

    pub(crate) fn func(&self) -> Arc<StepFn> {
        Arc::clone(&self.func)
    }

    /// Checks that `state` has the shape this step expects.
    pub fn check_state(&self, state: &StateEnvelope) -> Result<(), EngineError> {
        if state.schema_version() != self.schema_version {
            return Err(EngineError::SchemaDrift {
                step: self.name.clone(),
                detail: format!(
                    "state has schema version {}, step expects {}",
                    state.schema_version(),
                    self.schema_version
                ),
            });
        }

        if let Some(requires) = &self.requires {
            requires
                .validate(state.fields())
                .map_err(|e| EngineError::SchemaDrift {
                    step: self.name.clone(),
                    detail: e.to_string(),
                })?;
        }

        Ok(())
    }

    /// Invokes the step function.
    pub fn execute(&self, ctx: &StepContext, state: &StateEnvelope) -> StepOutcome {
        (self.func)(ctx, state)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("schema_version", &self.schema_version)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}
