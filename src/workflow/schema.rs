//! Input Schemas
//!
//! Describes the shape of input the engine accepts: the initial input of a
//! workflow, the input required to resume a suspended process, and the
//! fields a step requires in its incoming state.
//!
//! Validation collects every violation before failing so a caller can
//! correct all of them in one go.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::state::{FieldValue, Fields};

/// Expected kind of a field value.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Any,
    Bool,
    Int,
    /// Accepts integers as well
    Float,
    Text,
    List,
    Record,
    EntityRef,
}

impl FieldKind {
    fn accepts(&self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (Self::Any, _)
                | (Self::Bool, FieldValue::Bool(_))
                | (Self::Int, FieldValue::Int(_))
                | (Self::Float, FieldValue::Float(_) | FieldValue::Int(_))
                | (Self::Text, FieldValue::Text(_))
                | (Self::List, FieldValue::List(_))
                | (Self::Record, FieldValue::Record(_))
                | (Self::EntityRef, FieldValue::EntityRef { .. })
        )
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::List => "list",
            Self::Record => "record",
            Self::EntityRef => "entity_ref",
        };
        f.write_str(name)
    }
}

/// A single field in an [`InputSchema`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,

    /// Label shown by the form-rendering layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Schema a set of input fields must satisfy.
///
/// When a process suspends, the schema is persisted with the suspension
/// record and published so the input-collection layer can render it.
///
/// # Example
///
/// ```
/// use procflow::workflow::{FieldKind, InputSchema};
/// use procflow::workflow::state::fields;
///
/// let schema = InputSchema::new()
///     .required("confirmed", FieldKind::Bool)
///     .optional("remark", FieldKind::Text);
///
/// assert!(schema.validate(&fields([("confirmed", true.into())])).is_ok());
/// assert!(schema.validate(&fields([("remark", "ok".into())])).is_err());
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct InputSchema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl InputSchema {
    /// Creates an empty schema that accepts any input.
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Adds a required field.
    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
            description: None,
        });
        self
    }

    /// Adds an optional field. `null` is accepted for optional fields.
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
            description: None,
        });
        self
    }

    /// Attaches a description to the most recently added field.
    pub fn described(mut self, description: impl Into<String>) -> Self {
        if let Some(last) = self.fields.last_mut() {
            last.description = Some(description.into());
        }
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validates `input` against this schema.
    ///
    /// Fields not mentioned in the schema are allowed and left untouched.
    pub fn validate(&self, input: &Fields) -> Result<(), ValidationErrors> {
        let mut violations = Vec::new();

        for spec in &self.fields {
            match input.get(&spec.name) {
                None | Some(FieldValue::Null) if spec.required => {
                    violations.push(FieldViolation::Missing(spec.name.clone()));
                }
                None | Some(FieldValue::Null) => {}
                Some(value) if !spec.kind.accepts(value) => {
                    violations.push(FieldViolation::WrongKind {
                        field: spec.name.clone(),
                        expected: spec.kind,
                        found: value.kind_name(),
                    });
                }
                Some(_) => {}
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(violations))
        }
    }
}

/// A single reason why input was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldViolation {
    Missing(String),
    WrongKind {
        field: String,
        expected: FieldKind,
        found: &'static str,
    },
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(field) => write!(f, "field '{}' is required", field),
            Self::WrongKind {
                field,
                expected,
                found,
            } => write!(f, "field '{}' must be {}, got {}", field, expected, found),
        }
    }
}

/// All violations found while validating one input.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationErrors(pub Vec<FieldViolation>);

impl ValidationErrors {
    pub fn violations(&self) -> &[FieldViolation] {
        &self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        f.write_str(&messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::fields;

    fn node_schema() -> InputSchema {
        InputSchema::new()
            .required("node_name", FieldKind::Text)
            .required("port_count", FieldKind::Int)
            .optional("bandwidth", FieldKind::Float)
    }

    #[test]
    fn test_valid_input() {
        let input = fields([
            ("node_name", "edge-1".into()),
            ("port_count", 48.into()),
            ("extra", true.into()),
        ]);
        assert!(node_schema().validate(&input).is_ok());
    }

    #[test]
    fn test_collects_all_violations() {
        let input = fields([("port_count", "many".into())]);
        let err = node_schema().validate(&input).unwrap_err();

        assert_eq!(err.violations().len(), 2);
        assert_eq!(
            err.violations()[0],
            FieldViolation::Missing("node_name".to_string())
        );
        assert!(matches!(
            err.violations()[1],
            FieldViolation::WrongKind { expected: FieldKind::Int, found: "text", .. }
        ));
        assert!(err.to_string().contains("field 'node_name' is required"));
    }

    #[test]
    fn test_null_is_missing_for_required_fields() {
        let input = fields([
            ("node_name", FieldValue::Null),
            ("port_count", 1.into()),
            ("bandwidth", FieldValue::Null),
        ]);
        let err = node_schema().validate(&input).unwrap_err();
        assert_eq!(err.violations().len(), 1);
    }

    #[test]
    fn test_float_accepts_int() {
        let schema = InputSchema::new().required("bandwidth", FieldKind::Float);
        assert!(schema.validate(&fields([("bandwidth", 10.into())])).is_ok());
        assert!(schema.validate(&fields([("bandwidth", 2.5.into())])).is_ok());
    }

    #[test]
    fn test_empty_schema_accepts_anything() {
        let schema = InputSchema::new();
        assert!(schema.is_empty());
        assert!(schema.validate(&Fields::new()).is_ok());
    }

    #[test]
    fn test_described_and_lookup() {
        let schema = InputSchema::new()
            .required("confirmed", FieldKind::Bool)
            .described("Confirm the port is patched");

        let spec = schema.field("confirmed").unwrap();
        assert_eq!(spec.description.as_deref(), Some("Confirm the port is patched"));
        assert!(schema.field("unknown").is_none());
    }

    #[test]
    fn test_schema_serializes() {
        let schema = InputSchema::new().required("confirmed", FieldKind::Bool);
        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(json["fields"][0]["kind"], "bool");
        assert_eq!(json["fields"][0]["required"], true);
    }
}
