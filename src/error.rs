//! Engine Error Taxonomy
//!
//! Every failure the engine can surface to a trigger caller, plus the
//! conversion from recorded step-error payloads back into typed errors.

use crate::store::StoreError;
use crate::workflow::process::{ErrorKind, ErrorPayload, ProcessId, ProcessStatus};
use crate::workflow::registry::RegistryError;
use crate::workflow::schema::ValidationErrors;

/// Errors returned by [`Engine`](crate::execution::Engine) operations.
///
/// Validation and lock errors are returned synchronously. Step-level
/// failures are recorded in the process log and reflected in the process
/// status; [`Engine::failure`](crate::execution::Engine::failure) rebuilds
/// them from the log.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Initial or resume input does not satisfy its schema.
    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationErrors),

    /// A step failed transiently.
    #[error("Step '{step}' failed transiently: {message}")]
    RetryableStep { step: String, message: String },

    /// A step failed permanently, or exhausted its retry budget.
    #[error("Step '{step}' failed: {message}")]
    FatalStep { step: String, message: String },

    /// The state no longer matches what the consuming step was written for.
    #[error("Schema drift before step '{step}': {detail}")]
    SchemaDrift { step: String, detail: String },

    /// The target resource is already owned by another process or executor.
    #[error("Resource '{resource}' is locked{}", by_holder(.holder))]
    LockContention {
        resource: String,
        holder: Option<ProcessId>,
    },

    /// Unknown process, workflow or step.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// The requested operation is not legal in the current status.
    #[error("Cannot {action} process {process_id} while it is {status}")]
    InvalidTransition {
        process_id: ProcessId,
        action: &'static str,
        status: ProcessStatus,
    },

    /// A call back did not match what the process is waiting for.
    #[error("Callback for process {process_id} rejected: {reason}")]
    CallbackRejected {
        process_id: ProcessId,
        reason: String,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(StoreError),
}

fn by_holder(holder: &Option<ProcessId>) -> String {
    holder
        .map(|h| format!(" by process {}", h))
        .unwrap_or_default()
}

impl EngineError {
    /// Rebuilds a typed error from a payload recorded for `step`.
    pub fn from_payload(step: &str, payload: &ErrorPayload) -> Self {
        let step = step.to_string();
        let message = payload.message.clone();
        match payload.kind {
            ErrorKind::RetryableStep => Self::RetryableStep { step, message },
            ErrorKind::FatalStep => Self::FatalStep { step, message },
            ErrorKind::SchemaDrift => Self::SchemaDrift {
                step,
                detail: message,
            },
        }
    }

    pub(crate) fn workflow_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "Workflow",
            id: name.to_string(),
        }
    }

    pub(crate) fn step_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "Step",
            id: name.to_string(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ProcessNotFound(id) => Self::NotFound {
                kind: "Process",
                id: id.to_string(),
            },
            StoreError::ResourceBusy { resource, holder } => Self::LockContention {
                resource,
                holder: Some(holder),
            },
            other => Self::Store(other),
        }
    }
}
