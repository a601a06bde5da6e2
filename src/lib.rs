//! Procflow - Resumable Workflow Execution Engine
//!
//! Runs long-lived, multi-step provisioning processes (create, modify or
//! terminate a subscription, a node, a port) as deterministic state
//! machines. Every step outcome is written to an append-only log before the
//! engine moves on, so processes survive restarts and crashes, and at most
//! one process acts on a resource at any time.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Steps, state, schemas, definitions and the registry
//! - [`execution`]: The engine, replay, retries, locks, recovery and workers
//! - [`store`]: Persistence of processes, step logs and locks
//! - [`events`]: Notifications published on every transition
//! - [`config`]: YAML configuration
//! - [`error`]: The engine error taxonomy
//! - [`logging`]: Default logger setup
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use procflow::workflow::state::fields;
//! use procflow::workflow::{FieldKind, InputSchema, ProcessStatus, Target};
//! use procflow::{Engine, Registry, Step, WorkflowDefinition};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Register steps and workflows once at startup
//!     let mut registry = Registry::new();
//!     registry.register_step(Step::action("Allocate port", |_, s| {
//!         Ok(s.clone().with("port", "ge-0/0/1"))
//!     }))?;
//!     registry.register_step(Step::input(
//!         "Confirm patching",
//!         InputSchema::new().required("confirmed", FieldKind::Bool),
//!     ))?;
//!     registry.register_workflow(
//!         WorkflowDefinition::new("create-port", Target::Create)
//!             .steps(["Allocate port", "Confirm patching"])
//!             .input(InputSchema::new().required("node_id", FieldKind::Text)),
//!     )?;
//!
//!     // Start a process; it runs until it needs input
//!     let engine = Engine::in_memory(Arc::new(registry));
//!     let id = engine.start("create-port", fields([("node_id", "node-7".into())]))?;
//!     assert_eq!(engine.process(id)?.status, ProcessStatus::Waiting);
//!
//!     // Supply the input and finish
//!     engine.resume(id, fields([("confirmed", true.into())]))?;
//!     assert_eq!(engine.process(id)?.status, ProcessStatus::Completed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod logging;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::EngineError;
pub use execution::engine::Engine;
pub use execution::worker::WorkerPool;
pub use workflow::definition::{load_definitions, WorkflowDefinition};
pub use workflow::registry::Registry;
pub use workflow::state::StateEnvelope;
pub use workflow::step::{Step, StepOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "procflow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "procflow");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::action("test", |_, s| Ok(s.clone()));
        assert_eq!(step.name(), "test");
        assert_eq!(step.schema_version(), 1);
    }

    #[test]
    fn test_module_exports_registry() {
        let registry = Registry::new();
        assert_eq!(registry.step_count(), 0);
        assert!(registry.workflow_names().is_empty());
    }

    #[test]
    fn test_module_exports_engine() {
        let engine = Engine::in_memory(std::sync::Arc::new(Registry::new()));
        assert!(engine.instance_id().starts_with("engine-"));
        assert!(engine.list(None).unwrap().is_empty());
    }
}
