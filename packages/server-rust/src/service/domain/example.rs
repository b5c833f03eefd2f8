//! Example service: a named counter with a string map.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use docket_core::{Document, DocumentDescription, FieldDef, FieldType, ServiceOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::service::factory::FactoryService;
use crate::service::operation::{Operation, OperationError};
use crate::service::stateful::{ServiceContext, StatefulService};

pub const EXAMPLE_FACTORY_LINK: &str = "/core/examples";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExampleState {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub counter: i64,
    #[serde(default)]
    pub key_values: BTreeMap<String, String>,
}

pub struct ExampleService {
    description: DocumentDescription,
}

impl ExampleService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            description: DocumentDescription::for_type::<ExampleState>()
                .field(FieldDef::required("name", FieldType::String))
                .field(FieldDef::optional("counter", FieldType::Integer))
                .field(FieldDef::optional("keyValues", FieldType::Object)),
        }
    }
}

impl Default for ExampleService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatefulService for ExampleService {
    fn description(&self) -> &DocumentDescription {
        &self.description
    }

    async fn handle_start(
        &self,
        _ctx: &ServiceContext,
        initial: &Document,
    ) -> Result<(), OperationError> {
        match initial.field("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => Ok(()),
            _ => Err(OperationError::validation("name must not be empty")),
        }
    }

    /// Merges `keyValues` entry by entry; other fields overlay as usual.
    async fn handle_update_merge(
        &self,
        _ctx: &ServiceContext,
        _op: &Operation,
        current: &Document,
        body: Document,
    ) -> Result<Document, OperationError> {
        let mut next = current.clone();
        let mut patch = body;
        if let Some(Value::Object(incoming)) = patch.fields.remove("keyValues") {
            let mut merged = match current.field("keyValues") {
                Some(Value::Object(existing)) => existing.clone(),
                _ => Map::new(),
            };
            merged.extend(incoming);
            next.set_field("keyValues", Value::Object(merged));
        }
        next.merge_from(&patch);
        Ok(next)
    }
}

/// Factory at [`EXAMPLE_FACTORY_LINK`] with persistent, idempotent,
/// instrumented children.
#[must_use]
pub fn example_factory() -> FactoryService {
    FactoryService::new(ExampleService::new().description().clone(), || {
        Arc::new(ExampleService::new())
    })
    .with_options(ServiceOptions::IDEMPOTENT_CREATE | ServiceOptions::INSTRUMENTATION)
    .with_child_options(
        ServiceOptions::PERSISTENCE
            | ServiceOptions::IDEMPOTENT_CREATE
            | ServiceOptions::INSTRUMENTATION,
    )
    .with_cloning()
}
