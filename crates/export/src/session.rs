//! In-memory aggregate of one export session
//!
//! Holds every resolved container and item of the running export and owns the
//! cut-range accumulation that collates segments into shots.

use crate::error::Anomaly;
use crate::model::{Container, Context, Item};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

/// Phase of the export lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No export running.
    Idle,
    /// Export began; no sequence resolved yet.
    AwaitingPresetChoice,
    /// At least one sequence resolved against the tracking service.
    StructureResolved,
    /// At least one asset finished exporting.
    AssetsObserved,
    /// Submission ran; the session is about to be discarded.
    Submitted,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::AwaitingPresetChoice => write!(f, "awaiting_preset_choice"),
            SessionState::StructureResolved => write!(f, "structure_resolved"),
            SessionState::AssetsObserved => write!(f, "assets_observed"),
            SessionState::Submitted => write!(f, "submitted"),
        }
    }
}

/// Root aggregate of a running export
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub comment: String,
    pub preset: Option<String>,
    pub state: SessionState,
    pub reached_terminal_phase: bool,
    /// Context used for assets outside any resolved sequence
    pub project_context: Context,
    pub containers: BTreeMap<String, Container>,
    pub anomalies: Vec<Anomaly>,
}

impl Session {
    pub fn new(comment: &str, preset: Option<String>, project_context: Context) -> Self {
        Self {
            id: Uuid::new_v4(),
            comment: comment.to_string(),
            preset,
            state: SessionState::AwaitingPresetChoice,
            reached_terminal_phase: false,
            project_context,
            containers: BTreeMap::new(),
            anomalies: Vec::new(),
        }
    }

    /// Add a resolved container, merging into one already known by name
    pub fn insert_container(&mut self, container: Container) {
        match self.containers.get_mut(&container.name) {
            Some(existing) => existing.merge_items(container.items),
            None => {
                self.containers.insert(container.name.clone(), container);
            }
        }
    }

    pub fn item(&self, container: &str, item: &str) -> Option<&Item> {
        self.containers.get(container)?.item(item)
    }

    pub fn item_mut(&mut self, container: &str, item: &str) -> Option<&mut Item> {
        self.containers.get_mut(container)?.item_mut(item)
    }

    /// Context for an asset: its item's, else its container's, else the project's
    pub fn context_for(&self, container: &str, item: &str) -> &Context {
        if let Some(found) = self.item(container, item) {
            return &found.context;
        }
        match self.containers.get(container) {
            Some(c) => &c.context,
            None => &self.project_context,
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.containers.values().flat_map(|c| c.items.iter())
    }

    pub fn new_item_count(&self) -> usize {
        self.items().filter(|i| i.created_this_session).count()
    }

    /// Record a non-fatal anomaly
    pub fn note(&mut self, anomaly: Anomaly) {
        warn!(session = %self.id, "{}", anomaly);
        self.anomalies.push(anomaly);
    }
}

/// Grow an item's computed cut range by one segment's record range.
///
/// `record_out` is exclusive on the host side and is stored inclusive. The
/// result is the union of all contributions, independent of their order.
/// Empty or inverted ranges are ignored and reported.
pub fn accumulate_cut(item: &mut Item, record_in: i64, record_out: i64) -> Option<Anomaly> {
    if record_out <= record_in {
        return Some(Anomaly::InvalidCutRange {
            item: item.name.clone(),
            record_in,
            record_out,
        });
    }
    let last = record_out - 1;

    item.computed.cut_in = Some(item.computed.cut_in.map_or(record_in, |v| v.min(record_in)));
    item.computed.cut_out = Some(item.computed.cut_out.map_or(last, |v| v.max(last)));
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityRef;
    use proptest::prelude::*;

    fn item(name: &str) -> Item {
        Item::new(name, "SEQ01", 1, Context::default())
    }

    #[test]
    fn test_half_open_ranges_become_inclusive_union() {
        let mut shot = item("sh_10");
        assert!(accumulate_cut(&mut shot, 0, 6).is_none());
        assert!(accumulate_cut(&mut shot, 2, 4).is_none());

        assert_eq!(shot.computed.cut_in, Some(0));
        assert_eq!(shot.computed.cut_out, Some(5));
    }

    #[test]
    fn test_disjoint_segments_collate() {
        let mut shot = item("sh_10");
        accumulate_cut(&mut shot, 0, 11);
        accumulate_cut(&mut shot, 5, 16);

        assert_eq!(shot.computed.cut_in, Some(0));
        assert_eq!(shot.computed.cut_out, Some(15));
    }

    #[test]
    fn test_empty_range_is_reported_and_ignored() {
        let mut shot = item("sh_10");
        let anomaly = accumulate_cut(&mut shot, 10, 10);

        assert!(matches!(anomaly, Some(Anomaly::InvalidCutRange { .. })));
        assert_eq!(shot.computed.cut_in, None);
        assert_eq!(shot.computed.cut_out, None);
    }

    #[test]
    fn test_context_fallback_order() {
        let project = Context {
            project: Some(EntityRef::new("Project", 1)),
            ..Default::default()
        };
        let mut session = Session::new("", None, project.clone());
        let seq_ctx = Context {
            entity: Some(EntityRef::new("Sequence", 2)),
            ..Default::default()
        };
        let shot_ctx = Context {
            entity: Some(EntityRef::new("Shot", 3)),
            ..Default::default()
        };
        session.insert_container(Container {
            name: "SEQ01".to_string(),
            remote_id: 2,
            created_this_session: false,
            context: seq_ctx.clone(),
            items: vec![Item::new("sh_10", "SEQ01", 3, shot_ctx.clone())],
        });

        assert_eq!(session.context_for("SEQ01", "sh_10"), &shot_ctx);
        assert_eq!(session.context_for("SEQ01", "sh_99"), &seq_ctx);
        assert_eq!(session.context_for("SEQ02", "sh_10"), &project);
    }

    #[test]
    fn test_new_session_awaits_structure() {
        let session = Session::new("first pass", Some("dpx".to_string()), Context::default());
        assert_eq!(session.state, SessionState::AwaitingPresetChoice);
        assert!(!session.reached_terminal_phase);
        assert_eq!(session.new_item_count(), 0);
    }

    fn ranges() -> impl Strategy<Value = Vec<(i64, i64)>> {
        proptest::collection::vec((0i64..10_000, 1i64..500), 1..12)
            .prop_map(|v| v.into_iter().map(|(start, len)| (start, start + len)).collect())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_accumulation_is_order_independent(
            (contributions, shuffled) in ranges().prop_flat_map(|v| {
                let original = Just(v.clone());
                (original, Just(v).prop_shuffle())
            })
        ) {
            let mut a = item("sh_a");
            let mut b = item("sh_b");
            for (i, o) in &contributions {
                accumulate_cut(&mut a, *i, *o);
            }
            for (i, o) in &shuffled {
                accumulate_cut(&mut b, *i, *o);
            }

            prop_assert_eq!(a.computed, b.computed);

            let min_in = contributions.iter().map(|(i, _)| *i).min();
            let max_out = contributions.iter().map(|(_, o)| *o - 1).max();
            prop_assert_eq!(a.computed.cut_in, min_in);
            prop_assert_eq!(a.computed.cut_out, max_out);
            prop_assert!(a.computed.cut_in <= a.computed.cut_out);
        }

        #[test]
        fn prop_repeated_contribution_is_idempotent(start in 0i64..1000, len in 1i64..100) {
            let mut once = item("sh_once");
            let mut twice = item("sh_twice");
            accumulate_cut(&mut once, start, start + len);
            accumulate_cut(&mut twice, start, start + len);
            accumulate_cut(&mut twice, start, start + len);

            prop_assert_eq!(once.computed, twice.computed);
        }
    }
}
