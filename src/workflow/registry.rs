//! Workflow Registry
//!
//! Holds every step and workflow definition known to the engine. The
//! registry is built once at startup, validated on each registration, and
//! then shared read-only behind an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use super::definition::{load_definitions, Target, WorkflowDefinition};
use super::step::Step;

/// A single reason a workflow definition was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionProblem {
    EmptyName,
    NoSteps,
    UnknownStep(String),
    /// Modify and terminate workflows must say which input field holds the target
    MissingTargetField,
    /// The target field is not a required field of the initial input
    UndeclaredTargetField(String),
}

impl fmt::Display for DefinitionProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "Workflow has an empty name"),
            Self::NoSteps => write!(f, "Workflow has no steps"),
            Self::UnknownStep(step) => write!(f, "Workflow references unknown step '{}'", step),
            Self::MissingTargetField => {
                write!(f, "Workflow acts on an existing resource but has no target field")
            }
            Self::UndeclaredTargetField(field) => write!(
                f,
                "Target field '{}' is not a required field of the initial input",
                field
            ),
        }
    }
}

fn join_problems(problems: &[DefinitionProblem]) -> String {
    let messages: Vec<String> = problems.iter().map(|p| p.to_string()).collect();
    messages.join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Step '{0}' is already registered")]
    DuplicateStep(String),

    #[error("Workflow '{0}' is already registered")]
    DuplicateWorkflow(String),

    #[error("Invalid workflow '{workflow}': {}", join_problems(.problems))]
    InvalidWorkflow {
        workflow: String,
        problems: Vec<DefinitionProblem>,
    },

    #[error("Failed to read workflow file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse workflow file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Steps and workflow definitions by name.
///
/// # Example
///
/// ```
/// use procflow::workflow::{Registry, Step, Target, WorkflowDefinition};
///
/// let mut registry = Registry::new();
/// registry
///     .register_step(Step::action("Say hello", |_, s| Ok(s.clone().with("greeted", true))))
///     .unwrap();
/// registry
///     .register_workflow(WorkflowDefinition::new("hello", Target::System).step("Say hello"))
///     .unwrap();
///
/// assert!(registry.workflow("hello").is_some());
/// ```
#[derive(Debug, Default)]
pub struct Registry {
    steps: HashMap<String, Step>,
    workflows: HashMap<String, Arc<WorkflowDefinition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a step. Names must be unique.
    pub fn register_step(&mut self, step: Step) -> Result<(), RegistryError> {
        if self.steps.contains_key(step.name()) {
            return Err(RegistryError::DuplicateStep(step.name().to_string()));
        }
        debug!("Registered step '{}'", step.name());
        self.steps.insert(step.name().to_string(), step);
        Ok(())
    }

    /// Validates and registers a workflow definition.
    ///
    /// All referenced steps must already be registered.
    pub fn register_workflow(
        &mut self,
        definition: WorkflowDefinition,
    ) -> Result<(), RegistryError> {
        if self.workflows.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateWorkflow(definition.name));
        }

        let problems = self.check(&definition);
        if !problems.is_empty() {
            return Err(RegistryError::InvalidWorkflow {
                workflow: definition.name,
                problems,
            });
        }

        for name in &definition.steps {
            if let Some(step) = self.steps.get(name) {
                if step.schema_version() != definition.schema_version {
                    warn!(
                        "Workflow '{}': step '{}' expects schema version {}, workflow produces {}",
                        definition.name,
                        name,
                        step.schema_version(),
                        definition.schema_version
                    );
                }
            }
        }

        info!(
            "Registered workflow '{}' with {} steps",
            definition.name,
            definition.steps.len()
        );
        self.workflows
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Loads definitions from a YAML file and registers each of them.
    ///
    /// Returns the number of workflows registered.
    pub fn load_workflows(&mut self, path: impl AsRef<Path>) -> Result<usize, RegistryError> {
        let definitions = load_definitions(path)?;
        let count = definitions.len();
        for definition in definitions {
            self.register_workflow(definition)?;
        }
        Ok(count)
    }

    fn check(&self, definition: &WorkflowDefinition) -> Vec<DefinitionProblem> {
        let mut problems = Vec::new();

        if definition.name.trim().is_empty() {
            problems.push(DefinitionProblem::EmptyName);
        }

        if definition.steps.is_empty() {
            problems.push(DefinitionProblem::NoSteps);
        }

        for name in &definition.steps {
            if !self.steps.contains_key(name) {
                problems.push(DefinitionProblem::UnknownStep(name.clone()));
            }
        }

        match (&definition.target_field, definition.target) {
            (None, Target::Modify | Target::Terminate) => {
                problems.push(DefinitionProblem::MissingTargetField);
            }
            (Some(field), _) => {
                let declared = definition
                    .initial_input
                    .field(field)
                    .map(|spec| spec.required)
                    .unwrap_or(false);
                if !declared {
                    problems.push(DefinitionProblem::UndeclaredTargetField(field.clone()));
                }
            }
            (None, _) => {}
        }

        problems
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.get(name).cloned()
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.get(name)
    }

    /// Registered workflow names, sorted.
    pub fn workflow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::{FieldKind, InputSchema};

    fn noop(name: &str) -> Step {
        Step::action(name, |_, s| Ok(s.clone()))
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_step(noop("a")).unwrap();
        registry.register_step(noop("b")).unwrap();
        registry
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = registry();
        registry
            .register_workflow(WorkflowDefinition::new("wf", Target::Create).steps(["a", "b"]))
            .unwrap();

        assert_eq!(registry.workflow("wf").unwrap().steps.len(), 2);
        assert!(registry.workflow("other").is_none());
        assert_eq!(registry.step("a").unwrap().name(), "a");
        assert_eq!(registry.workflow_names(), vec!["wf"]);
        assert_eq!(registry.step_count(), 2);
    }

    #[test]
    fn test_duplicate_step() {
        let mut registry = registry();
        let err = registry.register_step(noop("a")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateStep(ref name) if name == "a"));
    }

    #[test]
    fn test_duplicate_workflow() {
        let mut registry = registry();
        let def = WorkflowDefinition::new("wf", Target::System).step("a");
        registry.register_workflow(def.clone()).unwrap();

        let err = registry.register_workflow(def).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateWorkflow(_)));
    }

    #[test]
    fn test_collects_all_problems() {
        let mut registry = registry();
        let def = WorkflowDefinition::new(" ", Target::Modify).steps(["a", "missing", "gone"]);

        match registry.register_workflow(def).unwrap_err() {
            RegistryError::InvalidWorkflow { problems, .. } => {
                assert_eq!(
                    problems,
                    vec![
                        DefinitionProblem::EmptyName,
                        DefinitionProblem::UnknownStep("missing".to_string()),
                        DefinitionProblem::UnknownStep("gone".to_string()),
                        DefinitionProblem::MissingTargetField,
                    ]
                );
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let mut registry = registry();
        let err = registry
            .register_workflow(WorkflowDefinition::new("empty", Target::System))
            .unwrap_err();
        assert!(err.to_string().contains("Workflow has no steps"));
    }

    #[test]
    fn test_target_field_must_be_required_input() {
        let mut registry = registry();
        let def = WorkflowDefinition::new("modify", Target::Modify)
            .step("a")
            .target_field("node")
            .input(InputSchema::new().optional("node", FieldKind::Text));

        let err = registry.register_workflow(def).unwrap_err();
        assert!(err.to_string().contains("Target field 'node'"));

        let def = WorkflowDefinition::new("modify", Target::Modify)
            .step("a")
            .target_field("node")
            .input(InputSchema::new().required("node", FieldKind::Text));
        assert!(registry.register_workflow(def).is_ok());
    }
}
