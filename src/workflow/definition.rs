//! Workflow Definitions
//!
//! A workflow definition names an ordered list of registered steps, the kind
//! of resource it acts on and the schema its initial input must satisfy.
//! Definitions are immutable once registered.
//!
//! # Example YAML Format
//!
//! ```yaml
//! workflows:
//!   - name: modify-node
//!     description: Change the port count of a node
//!     target: modify
//!     target_field: node
//!     schema_version: 1
//!     initial_input:
//!       fields:
//!         - name: node
//!           kind: entity_ref
//!           required: true
//!         - name: port_count
//!           kind: int
//!           required: true
//!     steps:
//!       - Load node
//!       - Update port count
//! ```

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::registry::RegistryError;
use super::schema::InputSchema;
use super::state::{FieldValue, Fields, StateEnvelope};
use super::step::DEFAULT_SCHEMA_VERSION;

/// Lifecycle action a workflow performs on its target.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Create,
    Modify,
    Terminate,
    /// Maintenance tasks not tied to a customer-facing entity
    System,
}

fn default_schema_version() -> u32 {
    DEFAULT_SCHEMA_VERSION
}

/// Static description of a workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub target: Target,

    /// Names of registered steps, in execution order
    pub steps: Vec<String>,

    #[serde(default)]
    pub initial_input: InputSchema,

    /// Schema version of the states this workflow produces
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Initial-input field holding the id of the resource to lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_field: Option<String>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, target: Target) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            target,
            steps: Vec::new(),
            initial_input: InputSchema::new(),
            schema_version: DEFAULT_SCHEMA_VERSION,
            target_field: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Appends a step by name.
    pub fn step(mut self, name: impl Into<String>) -> Self {
        self.steps.push(name.into());
        self
    }

    pub fn steps<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, schema: InputSchema) -> Self {
        self.initial_input = schema;
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Names the initial-input field identifying the target resource.
    pub fn target_field(mut self, field: impl Into<String>) -> Self {
        self.target_field = Some(field.into());
        self
    }

    /// Builds the first state of a new process from validated input.
    pub fn initial_state(&self, input: &Fields) -> StateEnvelope {
        StateEnvelope::from_fields(self.schema_version, input.clone())
    }

    /// Resolves the id of the resource a process started with `input` acts on.
    ///
    /// Text fields are used as-is; entity references become `type:id`.
    pub fn resource_id(&self, input: &Fields) -> Option<String> {
        let field = self.target_field.as_ref()?;
        match input.get(field)? {
            FieldValue::Text(id) => Some(id.clone()),
            FieldValue::Int(id) => Some(id.to_string()),
            FieldValue::EntityRef { entity_type, id } => Some(format!("{}:{}", entity_type, id)),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct DefinitionFile {
    #[serde(default)]
    workflows: Vec<WorkflowDefinition>,
}

/// Loads workflow definitions from a YAML file.
///
/// Step names are resolved later, when the definitions are registered.
pub fn load_definitions(path: impl AsRef<Path>) -> Result<Vec<WorkflowDefinition>, RegistryError> {
    let path = path.as_ref();
    info!("Loading workflow definitions from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| RegistryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("YAML content loaded ({} bytes)", content.len());

    let file: DefinitionFile =
        serde_yaml::from_str(&content).map_err(|source| RegistryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    info!("Parsed {} workflow definitions", file.workflows.len());
    Ok(file.workflows)
}
