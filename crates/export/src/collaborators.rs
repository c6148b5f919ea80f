//! Interfaces to the systems the export pipeline drives
//!
//! The template system, the tracking-service store, folder creation, context
//! resolution and the background job queue all live outside this crate. The
//! pipeline only talks to them through the traits below.

use crate::jobs::{JobId, JobSpec};
use crate::model::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// A tracking-service record as returned by the store
pub type Record = serde_json::Map<String, Value>;

/// Template field map
pub type Fields = BTreeMap<String, FieldValue>;

/// Value of a single template field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(i64),
    Text(String),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Number(_) => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template '{0}' is not defined")]
    UnknownTemplate(String),
    #[error("template '{template}' needs a value for '{field}'")]
    MissingField { template: String, field: String },
    #[error("path '{path}' does not match template '{template}'")]
    NoMatch { template: String, path: String },
}

/// Maps semantic fields to paths and back
pub trait TemplateSystem {
    fn fields(&self, template: &str, path: &str) -> Result<Fields, TemplateError>;

    fn apply(&self, template: &str, fields: &Fields) -> Result<String, TemplateError>;

    fn validate(&self, template: &str, path: &str) -> bool {
        self.fields(template, path).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("connection failed: {0}")]
    Transport(String),
}

/// Store query filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Is(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    pub fn is(field: &str, value: impl Into<Value>) -> Self {
        Filter::Is(field.to_string(), value.into())
    }

    pub fn is_in(field: &str, values: Vec<Value>) -> Self {
        Filter::In(field.to_string(), values)
    }

    /// Whether `record` satisfies this filter.
    ///
    /// Entity links compare on type and id only, so a hydrated link with a
    /// name still matches a bare `{type, id}` filter value.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::Is(field, expected) => record
                .get(field)
                .map(|actual| values_match(actual, expected))
                .unwrap_or(false),
            Filter::In(field, candidates) => record
                .get(field)
                .map(|actual| candidates.iter().any(|c| values_match(actual, c)))
                .unwrap_or(false),
        }
    }
}

fn values_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(a), Value::Object(b)) if a.contains_key("id") && b.contains_key("id") => {
            a.get("id") == b.get("id") && a.get("type") == b.get("type")
        }
        _ => actual == expected,
    }
}

/// One entry of a combined batch call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum BatchRequest {
    Create {
        entity_type: String,
        data: Record,
    },
    Update {
        entity_type: String,
        entity_id: i64,
        data: Record,
    },
}

impl BatchRequest {
    pub fn entity_type(&self) -> &str {
        match self {
            BatchRequest::Create { entity_type, .. } | BatchRequest::Update { entity_type, .. } => {
                entity_type
            }
        }
    }
}

/// Remote entity store of the tracking service
pub trait TrackingStore {
    fn find_one(&self, entity_type: &str, filters: &[Filter]) -> Result<Option<Record>, StoreError>;

    fn find(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[&str],
    ) -> Result<Vec<Record>, StoreError>;

    fn create(&mut self, entity_type: &str, data: Record) -> Result<Record, StoreError>;

    /// Run all requests as one transaction; results come back in request order
    fn batch(&mut self, requests: &[BatchRequest]) -> Result<Vec<Record>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{entity_type} {id}: {reason}")]
pub struct StructureError {
    pub entity_type: String,
    pub id: i64,
    pub reason: String,
}

/// Creates the on-disk folder structure for a tracking entity
pub trait StructureCreator {
    fn create_structure(&mut self, entity_type: &str, id: i64) -> Result<(), StructureError>;
}

/// Computes the context of a tracking entity
pub trait ContextResolver {
    fn context_for(&self, entity_type: &str, id: i64) -> Result<Context, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job queue rejected '{title}': {reason}")]
pub struct QueueError {
    pub title: String,
    pub reason: String,
}

/// Background job queue owned by the host
///
/// A job with a predecessor must not start before the predecessor finishes.
pub trait JobQueue {
    fn enqueue(&mut self, job: &JobSpec) -> Result<JobId, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_matches_links_on_type_and_id() {
        let shot = record(json!({
            "code": "sh_10",
            "sg_sequence": {"type": "Sequence", "id": 4, "name": "SEQ01"}
        }));

        assert!(Filter::is("sg_sequence", json!({"type": "Sequence", "id": 4})).matches(&shot));
        assert!(!Filter::is("sg_sequence", json!({"type": "Sequence", "id": 5})).matches(&shot));
        assert!(!Filter::is("sg_sequence", json!({"type": "Scene", "id": 4})).matches(&shot));
    }

    #[test]
    fn test_filter_in_and_missing_field() {
        let shot = record(json!({"code": "sh_20"}));

        assert!(Filter::is_in("code", vec![json!("sh_10"), json!("sh_20")]).matches(&shot));
        assert!(!Filter::is_in("code", vec![json!("sh_30")]).matches(&shot));
        assert!(!Filter::is("sg_cut_in", 10).matches(&shot));
    }

    #[test]
    fn test_batch_request_wire_format() {
        let req = BatchRequest::Update {
            entity_type: "Shot".to_string(),
            entity_id: 12,
            data: record(json!({"sg_cut_in": 1})),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["request_type"], "update");
        assert_eq!(value["entity_id"], 12);
        assert_eq!(req.entity_type(), "Shot");
    }

    #[test]
    fn test_field_value_untagged() {
        let fields: Fields = serde_json::from_value(json!({"Shot": "sh_10", "version": 3})).unwrap();
        assert_eq!(fields["Shot"], FieldValue::Text("sh_10".to_string()));
        assert_eq!(fields["version"], FieldValue::Number(3));
        assert_eq!(fields["version"].to_string(), "3");
    }
}
