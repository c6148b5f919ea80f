//! Session data model: containers, items, segments and their records.

use crate::collaborators::Fields;
use crate::jobs::JobId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Link to a tracking-service entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EntityRef {
    pub fn new(entity_type: &str, id: i64) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            id,
            name: None,
        }
    }

    /// Bare `{type, id}` link as the store expects it in filters and data
    pub fn to_link(&self) -> Value {
        json!({"type": self.entity_type, "id": self.id})
    }

    /// Link value, or JSON null for an absent link
    pub fn link_or_null(entity: Option<&EntityRef>) -> Value {
        entity.map(EntityRef::to_link).unwrap_or(Value::Null)
    }
}

/// Context handle of an entity.
///
/// Crosses into background jobs as a serialized string; jobs run in a
/// separate process and never see the live session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub project: Option<EntityRef>,
    #[serde(default)]
    pub entity: Option<EntityRef>,
    #[serde(default)]
    pub task: Option<EntityRef>,
    #[serde(default)]
    pub user: Option<EntityRef>,
    /// Template fields this context supplies (e.g. `Sequence`, `Shot`)
    #[serde(default)]
    pub fields: Fields,
}

impl Context {
    pub fn to_handle(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_handle(handle: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(handle)
    }
}

/// Cut in/out/order triple; `None` until known
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutInfo {
    pub cut_in: Option<i64>,
    pub cut_out: Option<i64>,
    pub cut_order: Option<i64>,
}

impl CutInfo {
    pub fn is_complete_range(&self) -> bool {
        self.cut_in.is_some() && self.cut_out.is_some()
    }
}

/// A finished video render of one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRecord {
    /// Full path with the host's `[first-last]` frame token
    pub path: String,
    pub version_number: i64,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub fps: f64,
    pub record_in: i64,
    pub record_out: i64,
    pub handle_in: i64,
    pub track: i64,
    /// Host job that writes the frames, when rendered in the background
    pub background_job_id: Option<JobId>,
}

/// A batch setup file written for an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub path: String,
    pub version_number: i64,
}

/// An open clip written for an item or one of its segments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipRecord {
    pub path: String,
    pub version_number: i64,
    /// Set for segment clips, empty for shot clips
    pub segment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    /// Absent when the host skipped the render (e.g. declined overwrite)
    pub render: Option<RenderRecord>,
    pub batch_is_shared_with_item: bool,
    pub remote_version_id: Option<i64>,
}

impl Segment {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            render: None,
            batch_is_shared_with_item: false,
            remote_version_id: None,
        }
    }

    /// Job id the render ran under, if it ran in the background
    pub fn render_job_id(&self) -> Option<JobId> {
        self.render.as_ref().and_then(|r| r.background_job_id)
    }
}

/// A resolved tracking item (shot).
///
/// Items only exist once the resolver has found or created them, so every
/// item carries its remote id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub container: String,
    pub remote_id: i64,
    pub created_this_session: bool,
    /// Last values known to the tracking service
    pub stored: CutInfo,
    /// Values accumulated from this export
    pub computed: CutInfo,
    pub context: Context,
    pub thumbnail_uploaded: bool,
    pub batch: Option<BatchRecord>,
    pub clips: Vec<ClipRecord>,
    pub segments: BTreeMap<String, Segment>,
}

impl Item {
    pub fn new(name: &str, container: &str, remote_id: i64, context: Context) -> Self {
        Self {
            name: name.to_string(),
            container: container.to_string(),
            remote_id,
            created_this_session: false,
            stored: CutInfo::default(),
            computed: CutInfo::default(),
            context,
            thumbnail_uploaded: false,
            batch: None,
            clips: Vec::new(),
            segments: BTreeMap::new(),
        }
    }

    /// Segment by name, registering it on first reference
    pub fn segment_mut(&mut self, name: &str) -> &mut Segment {
        self.segments
            .entry(name.to_string())
            .or_insert_with(|| Segment::new(name))
    }
}

/// A resolved container (sequence) and its items in host order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub remote_id: i64,
    pub created_this_session: bool,
    pub context: Context,
    pub items: Vec<Item>,
}

impl Container {
    pub fn item(&self, name: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.name == name)
    }

    pub fn item_mut(&mut self, name: &str) -> Option<&mut Item> {
        self.items.iter_mut().find(|i| i.name == name)
    }

    /// Add items not already present, keeping first-seen order
    pub fn merge_items(&mut self, items: Vec<Item>) {
        for item in items {
            if self.item(&item.name).is_none() {
                self.items.push(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_handle_round_trip_keeps_links() {
        let mut ctx = Context {
            project: Some(EntityRef::new("Project", 1)),
            entity: Some(EntityRef::new("Shot", 7)),
            ..Default::default()
        };
        ctx.fields.insert("Shot".to_string(), "sh_10".into());

        let handle = ctx.to_handle().unwrap();
        assert!(handle.contains("\"type\":\"Shot\""));
        assert_eq!(Context::from_handle(&handle).unwrap(), ctx);
    }

    #[test]
    fn test_merge_items_keeps_first_seen_order() {
        let mut container = Container {
            name: "SEQ01".to_string(),
            remote_id: 1,
            created_this_session: false,
            context: Context::default(),
            items: vec![Item::new("sh_20", "SEQ01", 3, Context::default())],
        };
        container.merge_items(vec![
            Item::new("sh_10", "SEQ01", 2, Context::default()),
            Item::new("sh_20", "SEQ01", 99, Context::default()),
        ]);

        let names: Vec<_> = container.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["sh_20", "sh_10"]);
        assert_eq!(container.item("sh_20").map(|i| i.remote_id), Some(3));
    }

    #[test]
    fn test_segment_mut_registers_once() {
        let mut item = Item::new("sh_10", "SEQ01", 2, Context::default());
        item.segment_mut("seg_a").batch_is_shared_with_item = true;
        item.segment_mut("seg_a");

        assert_eq!(item.segments.len(), 1);
        assert!(item.segments["seg_a"].batch_is_shared_with_item);
    }
}
