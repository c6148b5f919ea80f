//! In-memory collaborators
//!
//! Stand-ins for the tracking service, folder creation, context resolution,
//! the job queue and the template system. They back the offline replay tool
//! and the tests. Handles are cheap clones sharing one state, so a caller can
//! keep inspecting a store after boxing it into a controller.

use crate::collaborators::{
    BatchRequest, ContextResolver, FieldValue, Fields, Filter, JobQueue, QueueError, Record,
    StoreError, StructureCreator, StructureError, TemplateError, TemplateSystem, TrackingStore,
};
use crate::jobs::{JobId, JobSpec};
use crate::model::{Context, EntityRef};
use serde_json::Value;
use shot_export_config::Config;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Default)]
struct StoreState {
    next_id: i64,
    entities: BTreeMap<String, Vec<Record>>,
    batch_calls: usize,
    fail_next_batch: Option<String>,
    user: Option<EntityRef>,
}

impl StoreState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert(&mut self, entity_type: &str, mut data: Record) -> Record {
        let id = match data.get("id").and_then(Value::as_i64) {
            Some(id) => {
                self.next_id = self.next_id.max(id);
                id
            }
            None => self.allocate_id(),
        };
        data.insert("type".to_string(), Value::from(entity_type));
        data.insert("id".to_string(), Value::from(id));
        self.entities
            .entry(entity_type.to_string())
            .or_default()
            .push(data.clone());
        data
    }

    fn get(&self, entity_type: &str, id: i64) -> Option<&Record> {
        self.entities
            .get(entity_type)?
            .iter()
            .find(|r| r.get("id").and_then(Value::as_i64) == Some(id))
    }

    fn get_mut(&mut self, entity_type: &str, id: i64) -> Option<&mut Record> {
        self.entities
            .get_mut(entity_type)?
            .iter_mut()
            .find(|r| r.get("id").and_then(Value::as_i64) == Some(id))
    }

    fn matching<'s>(
        &'s self,
        entity_type: &str,
        filters: &'s [Filter],
    ) -> impl Iterator<Item = &'s Record> + 's {
        self.entities
            .get(entity_type)
            .into_iter()
            .flatten()
            .filter(move |r| filters.iter().all(|f| f.matches(r)))
    }
}

/// Tracking store held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Rc<RefCell<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a JSON object of `entity type -> [records]`
    pub fn from_fixture(fixture: &Value) -> Result<Self, StoreError> {
        let store = Self::new();
        let types = fixture
            .as_object()
            .ok_or_else(|| StoreError::Rejected("fixture must be a JSON object".to_string()))?;
        for (entity_type, records) in types {
            let records = records.as_array().ok_or_else(|| {
                StoreError::Rejected(format!("fixture entry '{}' must be a list", entity_type))
            })?;
            for record in records {
                let data = record.as_object().cloned().ok_or_else(|| {
                    StoreError::Rejected(format!("'{}' records must be objects", entity_type))
                })?;
                store.state.borrow_mut().insert(entity_type, data);
            }
        }
        Ok(store)
    }

    /// Insert a record directly and return its id
    pub fn insert(&self, entity_type: &str, data: Value) -> i64 {
        let data = data.as_object().cloned().unwrap_or_default();
        let record = self.state.borrow_mut().insert(entity_type, data);
        record.get("id").and_then(Value::as_i64).unwrap_or_default()
    }

    pub fn records(&self, entity_type: &str) -> Vec<Record> {
        self.state
            .borrow()
            .entities
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn batch_calls(&self) -> usize {
        self.state.borrow().batch_calls
    }

    /// Make the next batch call fail without applying anything
    pub fn fail_next_batch(&self, reason: &str) {
        self.state.borrow_mut().fail_next_batch = Some(reason.to_string());
    }

    /// User attached to every context
    pub fn set_user(&self, user: EntityRef) {
        self.state.borrow_mut().user = Some(user);
    }

    /// Context resolver reading from this store
    pub fn contexts(&self) -> MemoryContexts {
        MemoryContexts {
            state: Rc::clone(&self.state),
        }
    }
}

impl TrackingStore for MemoryStore {
    fn find_one(&self, entity_type: &str, filters: &[Filter]) -> Result<Option<Record>, StoreError> {
        Ok(self
            .state
            .borrow()
            .matching(entity_type, filters)
            .next()
            .cloned())
    }

    fn find(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[&str],
    ) -> Result<Vec<Record>, StoreError> {
        let state = self.state.borrow();
        Ok(state
            .matching(entity_type, filters)
            .map(|record| {
                let mut projected = Record::new();
                for key in ["type", "id"].iter().chain(fields.iter()) {
                    let value = record.get(*key).cloned().unwrap_or(Value::Null);
                    projected.insert(key.to_string(), value);
                }
                projected
            })
            .collect())
    }

    fn create(&mut self, entity_type: &str, data: Record) -> Result<Record, StoreError> {
        Ok(self.state.borrow_mut().insert(entity_type, data))
    }

    fn batch(&mut self, requests: &[BatchRequest]) -> Result<Vec<Record>, StoreError> {
        let mut state = self.state.borrow_mut();
        state.batch_calls += 1;
        if let Some(reason) = state.fail_next_batch.take() {
            return Err(StoreError::Rejected(reason));
        }

        // all or nothing: check updates before applying anything
        for request in requests {
            if let BatchRequest::Update {
                entity_type,
                entity_id,
                ..
            } = request
            {
                if state.get(entity_type, *entity_id).is_none() {
                    return Err(StoreError::Rejected(format!(
                        "{} {} does not exist",
                        entity_type, entity_id
                    )));
                }
            }
        }

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            match request {
                BatchRequest::Create { entity_type, data } => {
                    results.push(state.insert(entity_type, data.clone()));
                }
                BatchRequest::Update {
                    entity_type,
                    entity_id,
                    data,
                } => {
                    if let Some(record) = state.get_mut(entity_type, *entity_id) {
                        for (key, value) in data {
                            record.insert(key.clone(), value.clone());
                        }
                        results.push(record.clone());
                    }
                }
            }
        }
        debug!(requests = requests.len(), "Applied batch");
        Ok(results)
    }
}

/// Contexts computed from the records of a [`MemoryStore`].
///
/// An entity's template fields are its own code under its type name plus the
/// code of every entity it links to (a shot linked to `SEQ01` yields
/// `Sequence = SEQ01`).
#[derive(Debug, Clone)]
pub struct MemoryContexts {
    state: Rc<RefCell<StoreState>>,
}

impl ContextResolver for MemoryContexts {
    fn context_for(&self, entity_type: &str, id: i64) -> Result<Context, StoreError> {
        let state = self.state.borrow();
        let mut context = Context {
            user: state.user.clone(),
            ..Default::default()
        };

        if entity_type == "Project" {
            let mut project = EntityRef::new("Project", id);
            project.name = state
                .get("Project", id)
                .and_then(|r| r.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string);
            context.project = Some(project.clone());
            context.entity = Some(project);
            return Ok(context);
        }

        let record = state.get(entity_type, id).ok_or_else(|| {
            StoreError::Rejected(format!("{} {} does not exist", entity_type, id))
        })?;
        let code = record.get("code").and_then(Value::as_str).map(str::to_string);

        let mut entity = EntityRef::new(entity_type, id);
        entity.name = code.clone();
        context.entity = Some(entity);
        if let Some(code) = code {
            context.fields.insert(entity_type.to_string(), FieldValue::Text(code));
        }

        for value in record.values() {
            let Ok(link) = serde_json::from_value::<EntityRef>(value.clone()) else {
                continue;
            };
            if link.entity_type == "Project" {
                context.project = Some(link);
                continue;
            }
            if link.entity_type == "TaskTemplate" {
                continue;
            }
            let linked_code = state
                .get(&link.entity_type, link.id)
                .and_then(|r| r.get("code"))
                .and_then(Value::as_str);
            if let Some(linked_code) = linked_code {
                context
                    .fields
                    .insert(link.entity_type.clone(), FieldValue::Text(linked_code.to_string()));
            }
        }
        Ok(context)
    }
}

/// Records every folder-creation request
#[derive(Debug, Clone, Default)]
pub struct MemoryStructure {
    created: Rc<RefCell<Vec<(String, i64)>>>,
}

impl MemoryStructure {
    pub fn created(&self) -> Vec<(String, i64)> {
        self.created.borrow().clone()
    }
}

impl StructureCreator for MemoryStructure {
    fn create_structure(&mut self, entity_type: &str, id: i64) -> Result<(), StructureError> {
        self.created.borrow_mut().push((entity_type.to_string(), id));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    last_id: JobId,
    jobs: Vec<(JobId, JobSpec)>,
    reject_next: Option<String>,
}

/// Job queue that records jobs and hands out increasing ids
#[derive(Debug, Clone, Default)]
pub struct RecordingQueue {
    state: Rc<RefCell<QueueState>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start numbering after `last_id` (e.g. after the host's render jobs)
    pub fn starting_after(last_id: JobId) -> Self {
        let queue = Self::default();
        queue.state.borrow_mut().last_id = last_id;
        queue
    }

    pub fn jobs(&self) -> Vec<(JobId, JobSpec)> {
        self.state.borrow().jobs.clone()
    }

    pub fn reject_next(&self, reason: &str) {
        self.state.borrow_mut().reject_next = Some(reason.to_string());
    }
}

impl JobQueue for RecordingQueue {
    fn enqueue(&mut self, job: &JobSpec) -> Result<JobId, QueueError> {
        let mut state = self.state.borrow_mut();
        if let Some(reason) = state.reject_next.take() {
            return Err(QueueError {
                title: job.title.clone(),
                reason,
            });
        }
        state.last_id += 1;
        let id = state.last_id;
        state.jobs.push((id, job.clone()));
        Ok(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Key { name: String, width: Option<usize> },
}

/// Template engine for `{key}` / `{key:0N}` definitions.
///
/// Definitions are relative to a root directory. Keys with a width are
/// numeric and zero padded; all other keys are text. A key never spans a
/// path separator.
#[derive(Debug, Clone)]
pub struct BasicTemplates {
    root: PathBuf,
    definitions: BTreeMap<String, Vec<Part>>,
}

impl BasicTemplates {
    pub fn new(root: impl Into<PathBuf>, definitions: &BTreeMap<String, String>) -> Self {
        Self {
            root: root.into(),
            definitions: definitions
                .iter()
                .map(|(id, def)| (id.clone(), parse_definition(def)))
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.export.destination_path.clone(),
            &config.template_definitions,
        )
    }

    fn parts(&self, template: &str) -> Result<&[Part], TemplateError> {
        self.definitions
            .get(template)
            .map(Vec::as_slice)
            .ok_or_else(|| TemplateError::UnknownTemplate(template.to_string()))
    }
}

fn parse_definition(def: &str) -> Vec<Part> {
    let mut parts = Vec::new();
    let mut rest = def;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|c| open + c) else {
            break;
        };
        if open > 0 {
            parts.push(Part::Literal(rest[..open].to_string()));
        }
        let token = &rest[open + 1..close];
        let part = match token.split_once(':') {
            Some((name, spec)) => Part::Key {
                name: name.to_string(),
                width: spec.parse().ok(),
            },
            None => Part::Key {
                name: token.to_string(),
                width: None,
            },
        };
        parts.push(part);
        rest = &rest[close + 1..];
    }
    if !rest.is_empty() {
        parts.push(Part::Literal(rest.to_string()));
    }
    parts
}

fn match_parts(parts: &[Part], text: &str, fields: &mut Fields) -> bool {
    let Some((first, rest)) = parts.split_first() else {
        return text.is_empty();
    };
    match first {
        Part::Literal(literal) => text
            .strip_prefix(literal.as_str())
            .map_or(false, |remaining| match_parts(rest, remaining, fields)),
        Part::Key { name, width } => {
            let limit = text.find('/').unwrap_or(text.len());
            for (index, ch) in text[..limit].char_indices() {
                let end = index + ch.len_utf8();
                let candidate = &text[..end];
                let value = match width {
                    Some(_) => match candidate.parse::<i64>() {
                        Ok(n) if candidate.bytes().all(|b| b.is_ascii_digit()) => {
                            FieldValue::Number(n)
                        }
                        _ => continue,
                    },
                    None => FieldValue::Text(candidate.to_string()),
                };
                let inserted = match fields.get(name) {
                    Some(existing) if *existing != value => continue,
                    Some(_) => false,
                    None => {
                        fields.insert(name.clone(), value);
                        true
                    }
                };
                if match_parts(rest, &text[end..], fields) {
                    return true;
                }
                if inserted {
                    fields.remove(name);
                }
            }
            false
        }
    }
}

impl TemplateSystem for BasicTemplates {
    fn fields(&self, template: &str, path: &str) -> Result<Fields, TemplateError> {
        let parts = self.parts(template)?;
        let no_match = || TemplateError::NoMatch {
            template: template.to_string(),
            path: path.to_string(),
        };
        let relative = Path::new(path).strip_prefix(&self.root).map_err(|_| no_match())?;
        let relative = relative.to_string_lossy();

        let mut fields = Fields::new();
        if match_parts(parts, &relative, &mut fields) {
            Ok(fields)
        } else {
            Err(no_match())
        }
    }

    fn apply(&self, template: &str, fields: &Fields) -> Result<String, TemplateError> {
        let mut out = String::new();
        for part in self.parts(template)? {
            match part {
                Part::Literal(literal) => out.push_str(literal),
                Part::Key { name, width } => {
                    let value = fields.get(name).ok_or_else(|| TemplateError::MissingField {
                        template: template.to_string(),
                        field: name.clone(),
                    })?;
                    match (value, width) {
                        (FieldValue::Number(n), Some(w)) => out.push_str(&format!("{:0w$}", n, w = *w)),
                        (other, _) => out.push_str(&other.to_string()),
                    }
                }
            }
        }
        Ok(self.root.join(out).to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PLATE: &str = "{Sequence}/{Shot}/plates/{segment_name}_{Shot}.v{version:03}.{SEQ}.dpx";

    fn templates() -> BasicTemplates {
        let mut defs = BTreeMap::new();
        defs.insert("plate".to_string(), PLATE.to_string());
        BasicTemplates::new("/mnt/projects", &defs)
    }

    fn plate_fields() -> Fields {
        let mut fields = Fields::new();
        fields.insert("Sequence".to_string(), "SEQ01".into());
        fields.insert("Shot".to_string(), "sh_10".into());
        fields.insert("segment_name".to_string(), "seg_a".into());
        fields.insert("version".to_string(), FieldValue::Number(3));
        fields.insert("SEQ".to_string(), "[0001-0010]".into());
        fields
    }

    #[test]
    fn test_apply_pads_numeric_keys() {
        let path = templates().apply("plate", &plate_fields()).unwrap();
        assert_eq!(
            path,
            "/mnt/projects/SEQ01/sh_10/plates/seg_a_sh_10.v003.[0001-0010].dpx"
        );
    }

    #[test]
    fn test_fields_inverts_apply() {
        let t = templates();
        let path = t.apply("plate", &plate_fields()).unwrap();
        assert_eq!(t.fields("plate", &path).unwrap(), plate_fields());
        assert!(t.validate("plate", &path));
    }

    #[test]
    fn test_fields_rejects_inconsistent_repeats_and_foreign_roots() {
        let t = templates();
        assert!(!t.validate(
            "plate",
            "/mnt/projects/SEQ01/sh_10/plates/seg_a_sh_20.v003.[0001-0010].dpx"
        ));
        assert!(!t.validate("plate", "/elsewhere/SEQ01/sh_10/plates/a_sh_10.v003.x.dpx"));
    }

    #[test]
    fn test_missing_field_and_unknown_template() {
        let t = templates();
        let mut fields = plate_fields();
        fields.remove("SEQ");
        assert!(matches!(
            t.apply("plate", &fields),
            Err(TemplateError::MissingField { .. })
        ));
        assert!(matches!(
            t.apply("nope", &fields),
            Err(TemplateError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn test_store_find_projects_requested_fields() {
        let store = MemoryStore::new();
        store.insert("Shot", json!({"code": "sh_10", "sg_cut_in": 5, "secret": true}));

        let found = store
            .find("Shot", &[Filter::is("code", "sh_10")], &["code", "sg_cut_out"])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["sg_cut_out"], Value::Null);
        assert!(found[0].get("secret").is_none());
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let mut store = MemoryStore::new();
        let requests = vec![
            BatchRequest::Create {
                entity_type: "Version".to_string(),
                data: Record::new(),
            },
            BatchRequest::Update {
                entity_type: "Shot".to_string(),
                entity_id: 404,
                data: Record::new(),
            },
        ];

        assert!(store.batch(&requests).is_err());
        assert!(store.records("Version").is_empty());
    }

    #[test]
    fn test_fixture_keeps_ids_and_allocates_after_them() {
        let store = MemoryStore::from_fixture(&json!({
            "Sequence": [{"id": 40, "code": "SEQ01"}]
        }))
        .unwrap();
        let next = store.insert("Shot", json!({"code": "sh_10"}));
        assert_eq!(next, 41);
    }

    #[test]
    fn test_contexts_collect_linked_codes() {
        let store = MemoryStore::new();
        let seq = store.insert("Sequence", json!({"code": "SEQ01", "project": {"type": "Project", "id": 1}}));
        let shot = store.insert(
            "Shot",
            json!({"code": "sh_10", "sg_sequence": {"type": "Sequence", "id": seq}, "project": {"type": "Project", "id": 1}}),
        );

        let ctx = store.contexts().context_for("Shot", shot).unwrap();
        assert_eq!(ctx.fields["Shot"], FieldValue::Text("sh_10".to_string()));
        assert_eq!(ctx.fields["Sequence"], FieldValue::Text("SEQ01".to_string()));
        assert_eq!(ctx.project.map(|p| p.id), Some(1));
    }

    #[test]
    fn test_queue_ids_increase() {
        let mut queue = RecordingQueue::starting_after(100);
        let spec = JobSpec::new(
            "t",
            "d",
            None,
            "target",
            crate::jobs::JobTask::UploadThumbnails { sources: Vec::new() },
        );
        assert_eq!(queue.enqueue(&spec).unwrap(), 101);
        assert_eq!(queue.enqueue(&spec).unwrap(), 102);

        queue.reject_next("offline");
        assert!(queue.enqueue(&spec).is_err());
        assert_eq!(queue.jobs().len(), 2);
    }
}
