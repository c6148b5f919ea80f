//! Create-or-find resolution of containers and their items
//!
//! A sequence export names one container and the items it contains. Existing
//! entities are reused; missing items are created in one batch call. Every
//! resolved item gets a cached context, and new entities get their folder
//! structure on disk.

use crate::collaborators::{
    BatchRequest, ContextResolver, Filter, Record, StoreError, StructureCreator, TrackingStore,
};
use crate::error::ExportError;
use crate::model::{Container, CutInfo, EntityRef, Item};
use serde_json::{json, Value};
use shot_export_config::TrackingConfig;
use std::collections::HashMap;
use tracing::{debug, info};

const CREATED_DESCRIPTION: &str = "Created by the Shotgun Flame exporter.";
const ITEM_FIELDS: [&str; 4] = ["code", "sg_cut_in", "sg_cut_out", "sg_cut_order"];

pub struct EntityResolver<'a> {
    tracking: &'a TrackingConfig,
    store: &'a mut dyn TrackingStore,
    structure: &'a mut dyn StructureCreator,
    contexts: &'a dyn ContextResolver,
}

impl<'a> EntityResolver<'a> {
    pub fn new(
        tracking: &'a TrackingConfig,
        store: &'a mut dyn TrackingStore,
        structure: &'a mut dyn StructureCreator,
        contexts: &'a dyn ContextResolver,
    ) -> Self {
        Self {
            tracking,
            store,
            structure,
            contexts,
        }
    }

    fn project(&self) -> EntityRef {
        EntityRef::new("Project", self.tracking.project_id)
    }

    /// Resolve a container and the named items under it.
    ///
    /// Duplicate names are resolved once; the returned items keep the order in
    /// which names first appear. The returned container carries no items.
    pub fn resolve(
        &mut self,
        container_name: &str,
        item_names: &[String],
    ) -> Result<(Container, Vec<Item>), ExportError> {
        let container = self.resolve_container(container_name)?;

        let mut names: Vec<&str> = Vec::new();
        for name in item_names {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }

        let items = self.resolve_items(&container, &names)?;
        Ok((container, items))
    }

    fn resolve_container(&mut self, name: &str) -> Result<Container, ExportError> {
        let entity_type = self.tracking.container_entity_type.as_str();
        let filters = [
            Filter::is("code", name),
            Filter::is("project", self.project().to_link()),
        ];
        let existing = self
            .store
            .find_one(entity_type, &filters)
            .map_err(|e| ExportError::remote("container lookup", e))?;

        let (record, created) = match existing {
            Some(record) => (record, false),
            None => {
                let mut data = Record::new();
                data.insert("code".to_string(), json!(name));
                data.insert("description".to_string(), json!(CREATED_DESCRIPTION));
                data.insert("project".to_string(), self.project().to_link());
                if let Some(template) = self.task_template(&self.tracking.container_task_template)? {
                    data.insert("task_template".to_string(), template);
                }
                info!(entity_type, name, "Creating container");
                let record = self
                    .store
                    .create(entity_type, data)
                    .map_err(|e| ExportError::remote("container creation", e))?;
                (record, true)
            }
        };

        let id = record_id(&record, "container lookup")?;
        if created {
            self.structure.create_structure(entity_type, id)?;
        }
        let context = self
            .contexts
            .context_for(entity_type, id)
            .map_err(|e| ExportError::remote("context resolution", e))?;

        Ok(Container {
            name: name.to_string(),
            remote_id: id,
            created_this_session: created,
            context,
            items: Vec::new(),
        })
    }

    fn resolve_items(
        &mut self,
        container: &Container,
        names: &[&str],
    ) -> Result<Vec<Item>, ExportError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let entity_type = self.tracking.item_entity_type.as_str();
        let container_link = EntityRef::new(&self.tracking.container_entity_type, container.remote_id);
        let filters = [
            Filter::is(&self.tracking.parent_link_field, container_link.to_link()),
            Filter::is_in("code", names.iter().map(|n| json!(n)).collect()),
        ];
        let found = self
            .store
            .find(entity_type, &filters, &ITEM_FIELDS)
            .map_err(|e| ExportError::remote("item lookup", e))?;

        let mut by_name: HashMap<String, (Record, bool)> = HashMap::new();
        for record in found {
            if let Some(code) = record.get("code").and_then(Value::as_str).map(str::to_string) {
                by_name.insert(code, (record, false));
            }
        }

        let missing: Vec<&str> = names
            .iter()
            .copied()
            .filter(|n| !by_name.contains_key(*n))
            .collect();

        if !missing.is_empty() {
            let template = self.task_template(&self.tracking.item_task_template)?;
            let requests: Vec<BatchRequest> = missing
                .iter()
                .map(|name| {
                    let mut data = Record::new();
                    data.insert("code".to_string(), json!(name));
                    data.insert("description".to_string(), json!(CREATED_DESCRIPTION));
                    data.insert(self.tracking.parent_link_field.clone(), container_link.to_link());
                    data.insert("project".to_string(), self.project().to_link());
                    if let Some(template) = &template {
                        data.insert("task_template".to_string(), template.clone());
                    }
                    BatchRequest::Create {
                        entity_type: entity_type.to_string(),
                        data,
                    }
                })
                .collect();

            info!(
                container = container.name.as_str(),
                count = requests.len(),
                "Creating new items in one batch"
            );
            let created = self
                .store
                .batch(&requests)
                .map_err(|e| ExportError::remote("item creation", e))?;
            if created.len() != missing.len() {
                return Err(ExportError::remote(
                    "item creation",
                    StoreError::Rejected(format!(
                        "expected {} created records, got {}",
                        missing.len(),
                        created.len()
                    )),
                ));
            }
            for (name, record) in missing.iter().zip(created) {
                by_name.insert(name.to_string(), (record, true));
            }
        }

        let mut items = Vec::with_capacity(names.len());
        for name in names {
            let Some((record, created)) = by_name.remove(*name) else {
                continue;
            };
            let id = record_id(&record, "item lookup")?;
            if created {
                self.structure.create_structure(entity_type, id)?;
            }
            let context = self
                .contexts
                .context_for(entity_type, id)
                .map_err(|e| ExportError::remote("context resolution", e))?;

            let mut item = Item::new(name, &container.name, id, context);
            item.created_this_session = created;
            if !created {
                item.stored = CutInfo {
                    cut_in: record.get("sg_cut_in").and_then(Value::as_i64),
                    cut_out: record.get("sg_cut_out").and_then(Value::as_i64),
                    cut_order: record.get("sg_cut_order").and_then(Value::as_i64),
                };
            }
            debug!(item = *name, id, created, "Resolved item");
            items.push(item);
        }
        Ok(items)
    }

    /// Look up a configured task template; an empty name means none
    fn task_template(&self, name: &str) -> Result<Option<Value>, ExportError> {
        if name.trim().is_empty() {
            return Ok(None);
        }
        let record = self
            .store
            .find_one("TaskTemplate", &[Filter::is("code", name)])
            .map_err(|e| ExportError::remote("task template lookup", e))?
            .ok_or_else(|| {
                ExportError::Configuration(format!(
                    "task template '{}' does not exist in Shotgun",
                    name
                ))
            })?;
        let id = record_id(&record, "task template lookup")?;
        Ok(Some(EntityRef::new("TaskTemplate", id).to_link()))
    }
}

pub(crate) fn record_id(record: &Record, stage: &str) -> Result<i64, ExportError> {
    record.get("id").and_then(Value::as_i64).ok_or_else(|| {
        ExportError::remote(stage, StoreError::Rejected("record without id".to_string()))
    })
}
