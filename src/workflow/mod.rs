//! Workflow Definition Module
//!
//! Data structures for describing workflows and the processes that run them.
//!
//! # Structure
//!
//! - [`state`]: Versioned process state and field values
//! - [`schema`]: Input schemas and validation
//! - [`step`]: Steps and step outcomes
//! - [`combinators`]: Conditional, focused, grouped and callback steps
//! - [`definition`]: Workflow definitions and YAML loading
//! - [`registry`]: Registry of steps and workflows
//! - [`process`]: Persisted process rows and step records

pub mod combinators;
pub mod definition;
pub mod process;
pub mod registry;
pub mod schema;
pub mod state;
pub mod step;

pub use combinators::{callback, conditional, focus, group, CALLBACK_TOKEN_KEY};
pub use definition::{load_definitions, Target, WorkflowDefinition};
pub use process::{
    ErrorKind, ErrorPayload, OutcomeKind, Process, ProcessId, ProcessStatus, StepRecord, Wait,
    WaitKind,
};
pub use registry::{DefinitionProblem, Registry, RegistryError};
pub use schema::{FieldKind, FieldSpec, FieldViolation, InputSchema, ValidationErrors};
pub use state::{FieldValue, Fields, StateEnvelope};
pub use step::{Step, StepContext, StepError, StepOutcome};
