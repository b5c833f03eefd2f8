//! Document descriptions: the kind tag and field schema a service declares.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::Action;
use crate::document::{Document, SYSTEM_FIELDS};

/// JSON type a declared field must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }
}

/// Single field definition within a description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Name of the field.
    pub name: String,
    pub field_type: FieldType,
    /// Whether the field must be present in every full document.
    pub required: bool,
}

impl FieldDef {
    #[must_use]
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    #[must_use]
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }
}

/// Configuration errors in a description, reported when a service starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptionError {
    #[error("description has an empty kind")]
    EmptyKind,
    #[error("illegal field '{field}': fields ending in 'Link' must be strings")]
    IllegalLinkField { field: String },
    #[error("illegal field '{field}': name is reserved for system fields")]
    ReservedField { field: String },
    #[error("field '{field}' is declared more than once")]
    DuplicateField { field: String },
}

/// Result of validating a document against a description.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// The document conforms to the description.
    Valid,
    /// The document violates one or more constraints.
    Invalid {
        /// Human-readable descriptions of each validation failure.
        errors: Vec<String>,
    },
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Folds the result into a `Result`, joining the messages with `"; "`.
    ///
    /// # Errors
    ///
    /// Returns the joined messages when invalid.
    pub fn into_result(self) -> Result<(), String> {
        match self {
            Self::Valid => Ok(()),
            Self::Invalid { errors } => Err(errors.join("; ")),
        }
    }
}

/// Kind tag plus field schema of a stateful service's document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDescription {
    pub kind: String,
    pub fields: Vec<FieldDef>,
}

impl DocumentDescription {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    /// Description whose kind is derived from a Rust state type.
    #[must_use]
    pub fn for_type<T: ?Sized>() -> Self {
        Self::new(crate::document::build_kind::<T>())
    }

    #[must_use]
    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    /// Checks the description itself.
    ///
    /// # Errors
    ///
    /// Returns the first [`DescriptionError`] found, naming the field.
    pub fn check(&self) -> Result<(), DescriptionError> {
        if self.kind.is_empty() {
            return Err(DescriptionError::EmptyKind);
        }
        for (idx, def) in self.fields.iter().enumerate() {
            if SYSTEM_FIELDS.contains(&def.name.as_str()) {
                return Err(DescriptionError::ReservedField {
                    field: def.name.clone(),
                });
            }
            if def.name.ends_with("Link") && def.field_type != FieldType::String {
                return Err(DescriptionError::IllegalLinkField {
                    field: def.name.clone(),
                });
            }
            if self.fields[..idx].iter().any(|other| other.name == def.name) {
                return Err(DescriptionError::DuplicateField {
                    field: def.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validates a document body. `partial` bodies (merges) skip the
    /// required-field check; types are always checked.
    #[must_use]
    pub fn validate(&self, doc: &Document, partial: bool) -> ValidationResult {
        let mut errors = Vec::new();
        if !doc.kind.is_empty() && doc.kind != self.kind {
            errors.push(format!(
                "document kind '{}' does not match '{}'",
                doc.kind, self.kind
            ));
        }
        for def in &self.fields {
            match doc.fields.get(&def.name) {
                None | Some(Value::Null) => {
                    if def.required && !partial {
                        errors.push(format!("missing required field '{}'", def.name));
                    }
                }
                Some(value) if !def.field_type.matches(value) => {
                    errors.push(format!(
                        "field '{}' must be {}",
                        def.name,
                        def.field_type.name()
                    ));
                }
                Some(_) => {}
            }
        }
        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { errors }
        }
    }
}

/// Body of a DISCOVER response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCapabilities {
    pub document_self_link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_kind: Option<String>,
    pub options: Vec<String>,
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<DocumentDescription>,
}
