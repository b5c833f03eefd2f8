//! The versioned document owned by a stateful service.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::Action;

pub const FIELD_SELF_LINK: &str = "documentSelfLink";
pub const FIELD_VERSION: &str = "documentVersion";
pub const FIELD_KIND: &str = "documentKind";
pub const FIELD_EXPIRATION: &str = "documentExpirationTimeMicros";
pub const FIELD_SOURCE_LINK: &str = "documentSourceLink";
pub const FIELD_UPDATE_TIME: &str = "documentUpdateTimeMicros";
pub const FIELD_UPDATE_ACTION: &str = "documentUpdateAction";

/// System field names, in wire order.
pub const SYSTEM_FIELDS: [&str; 7] = [
    FIELD_SELF_LINK,
    FIELD_VERSION,
    FIELD_KIND,
    FIELD_EXPIRATION,
    FIELD_SOURCE_LINK,
    FIELD_UPDATE_TIME,
    FIELD_UPDATE_ACTION,
];

/// Version assigned by the first successful create of a link.
pub const INITIAL_VERSION: u64 = 1;

/// Builds the kind tag of a Rust state type: `my_crate::ExampleState`
/// becomes `my_crate:ExampleState`.
#[must_use]
pub fn build_kind<T: ?Sized>() -> String {
    std::any::type_name::<T>().replace("::", ":")
}

/// A JSON document: system fields plus the service's own state in `fields`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "documentSelfLink", default)]
    pub self_link: String,
    #[serde(rename = "documentVersion", default)]
    pub version: u64,
    #[serde(rename = "documentKind", default)]
    pub kind: String,
    /// Absolute deadline in microseconds since the Unix epoch; 0 never expires.
    #[serde(rename = "documentExpirationTimeMicros", default)]
    pub expiration_time_micros: u64,
    /// Present only on clone requests.
    #[serde(
        rename = "documentSourceLink",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_link: Option<String>,
    #[serde(rename = "documentUpdateTimeMicros", default)]
    pub update_time_micros: u64,
    #[serde(
        rename = "documentUpdateAction",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub update_action: Option<Action>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Decodes a document from an arbitrary JSON value.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the value is not an object or a system
    /// field has the wrong type.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Builds a document from a typed state struct.
    ///
    /// # Errors
    ///
    /// Returns the serde error when `state` does not serialize to an object.
    pub fn from_state<T: Serialize>(state: &T) -> Result<Self, serde_json::Error> {
        Self::from_value(serde_json::to_value(state)?)
    }

    /// Decodes the document into a typed state struct.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the fields do not match `T`.
    pub fn state<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_value())
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Sets a state field. System field names are ignored.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if !SYSTEM_FIELDS.contains(&name.as_str()) {
            self.fields.insert(name, value);
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set_field(name, value);
        self
    }

    #[must_use]
    pub fn with_self_link(mut self, link: impl Into<String>) -> Self {
        self.self_link = link.into();
        self
    }

    /// Overlays a partial update: non-null fields of `patch` replace ours,
    /// and a non-zero expiration replaces the current deadline.
    pub fn merge_from(&mut self, patch: &Document) {
        for (name, value) in &patch.fields {
            if !value.is_null() {
                self.fields.insert(name.clone(), value.clone());
            }
        }
        if patch.expiration_time_micros != 0 {
            self.expiration_time_micros = patch.expiration_time_micros;
        }
    }

    /// State equality used for not-modified detection: state fields and the
    /// expiration deadline compare equal. Other system fields are ignored.
    #[must_use]
    pub fn state_equals(&self, other: &Document) -> bool {
        self.expiration_time_micros == other.expiration_time_micros && self.fields == other.fields
    }

    /// Returns `true` once a non-zero deadline is at or before `now_micros`.
    #[must_use]
    pub fn is_expired_at(&self, now_micros: u64) -> bool {
        self.expiration_time_micros != 0 && self.expiration_time_micros <= now_micros
    }
}

/// Result of a READ against a factory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentQueryResult {
    pub document_links: Vec<String>,
    pub document_count: u64,
    /// Present only when the query was expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents: Option<BTreeMap<String, Document>>,
}
