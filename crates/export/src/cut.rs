//! Cut order assignment and cut change detection

use crate::collaborators::{BatchRequest, Record};
use crate::error::Anomaly;
use crate::model::Container;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;

/// New cut values for one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CutUpdate {
    pub container: String,
    pub item: String,
    pub item_id: i64,
    pub cut_in: i64,
    pub cut_out: i64,
    pub cut_order: i64,
}

impl CutUpdate {
    /// Inclusive length of the cut
    pub fn duration(&self) -> i64 {
        self.cut_out - self.cut_in + 1
    }

    pub fn to_request(&self, entity_type: &str) -> BatchRequest {
        let mut data = Record::new();
        data.insert("sg_cut_in".to_string(), json!(self.cut_in));
        data.insert("sg_cut_out".to_string(), json!(self.cut_out));
        data.insert("sg_cut_duration".to_string(), json!(self.duration()));
        data.insert("sg_cut_order".to_string(), json!(self.cut_order));
        BatchRequest::Update {
            entity_type: entity_type.to_string(),
            entity_id: self.item_id,
            data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CutPlan {
    pub updates: Vec<CutUpdate>,
    pub anomalies: Vec<Anomaly>,
}

/// Rank the items of a container by cut in.
///
/// Items with equal cut in keep their relative order. Items without cut data
/// get no rank.
pub fn assign_cut_order(container: &mut Container) {
    let mut ranked: Vec<(usize, i64)> = container
        .items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            if item.computed.is_complete_range() {
                item.computed.cut_in.map(|cut_in| (index, cut_in))
            } else {
                None
            }
        })
        .collect();
    ranked.sort_by_key(|&(_, cut_in)| cut_in);

    for item in container.items.iter_mut() {
        item.computed.cut_order = None;
    }
    for (rank, (index, _)) in ranked.into_iter().enumerate() {
        container.items[index].computed.cut_order = Some(rank as i64 + 1);
    }
}

/// Assign cut order in every container and collect the items whose cut
/// differs from what the tracking service holds.
pub fn plan_cut_updates(containers: &mut BTreeMap<String, Container>) -> CutPlan {
    let mut plan = CutPlan::default();

    for container in containers.values_mut() {
        assign_cut_order(container);

        for item in &container.items {
            let computed = item.computed;
            let (Some(cut_in), Some(cut_out), Some(cut_order)) =
                (computed.cut_in, computed.cut_out, computed.cut_order)
            else {
                plan.anomalies.push(Anomaly::MissingCutData {
                    container: container.name.clone(),
                    item: item.name.clone(),
                });
                continue;
            };

            if item.stored == computed {
                continue;
            }
            plan.updates.push(CutUpdate {
                container: container.name.clone(),
                item: item.name.clone(),
                item_id: item.remote_id,
                cut_in,
                cut_out,
                cut_order,
            });
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Context, CutInfo, Item};
    use crate::session::accumulate_cut;
    use proptest::prelude::*;

    fn container(items: Vec<Item>) -> Container {
        Container {
            name: "SEQ01".to_string(),
            remote_id: 1,
            created_this_session: false,
            context: Context::default(),
            items,
        }
    }

    fn item_with_cut(name: &str, id: i64, cut_in: i64, cut_out: i64) -> Item {
        let mut item = Item::new(name, "SEQ01", id, Context::default());
        accumulate_cut(&mut item, cut_in, cut_out + 1);
        item
    }

    #[test]
    fn test_equal_cut_in_keeps_original_order() {
        let mut seq = container(vec![
            item_with_cut("a", 1, 5, 9),
            item_with_cut("b", 2, 5, 7),
            item_with_cut("c", 3, 2, 4),
        ]);
        assign_cut_order(&mut seq);

        let orders: Vec<_> = seq.items.iter().map(|i| i.computed.cut_order).collect();
        assert_eq!(orders, vec![Some(2), Some(3), Some(1)]);
    }

    #[test]
    fn test_unchanged_cut_is_not_resubmitted() {
        let mut shot = item_with_cut("sh_10", 7, 10, 20);
        shot.stored = CutInfo {
            cut_in: Some(10),
            cut_out: Some(20),
            cut_order: Some(1),
        };
        let mut containers = BTreeMap::new();
        containers.insert("SEQ01".to_string(), container(vec![shot]));

        let plan = plan_cut_updates(&mut containers);
        assert!(plan.updates.is_empty());
        assert!(plan.anomalies.is_empty());
    }

    #[test]
    fn test_order_change_alone_triggers_update() {
        let mut shot = item_with_cut("sh_10", 7, 10, 20);
        shot.stored = CutInfo {
            cut_in: Some(10),
            cut_out: Some(20),
            cut_order: Some(3),
        };
        let mut containers = BTreeMap::new();
        containers.insert("SEQ01".to_string(), container(vec![shot]));

        let plan = plan_cut_updates(&mut containers);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].cut_order, 1);
    }

    #[test]
    fn test_items_without_cut_are_flagged_not_ranked() {
        let mut containers = BTreeMap::new();
        containers.insert(
            "SEQ01".to_string(),
            container(vec![
                Item::new("sh_00", "SEQ01", 1, Context::default()),
                item_with_cut("sh_10", 2, 30, 40),
            ]),
        );

        let plan = plan_cut_updates(&mut containers);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].item, "sh_10");
        assert_eq!(plan.updates[0].cut_order, 1);
        assert_eq!(
            plan.anomalies,
            vec![Anomaly::MissingCutData {
                container: "SEQ01".to_string(),
                item: "sh_00".to_string()
            }]
        );
    }

    #[test]
    fn test_update_request_carries_duration() {
        let update = CutUpdate {
            container: "SEQ01".to_string(),
            item: "sh_10".to_string(),
            item_id: 9,
            cut_in: 0,
            cut_out: 15,
            cut_order: 1,
        };
        let BatchRequest::Update {
            entity_id, data, ..
        } = update.to_request("Shot")
        else {
            panic!("expected an update");
        };
        assert_eq!(entity_id, 9);
        assert_eq!(data["sg_cut_duration"], 16);
        assert_eq!(data["sg_cut_order"], 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_cut_order_is_a_stable_ranking(cut_ins in proptest::collection::vec(0i64..20, 1..15)) {
            let items = cut_ins
                .iter()
                .enumerate()
                .map(|(i, c)| item_with_cut(&format!("sh_{}", i), i as i64, *c, *c + 5))
                .collect();
            let mut seq = container(items);
            assign_cut_order(&mut seq);

            let mut orders: Vec<i64> = seq.items.iter().filter_map(|i| i.computed.cut_order).collect();
            prop_assert_eq!(orders.len(), cut_ins.len());

            for a in 0..cut_ins.len() {
                for b in (a + 1)..cut_ins.len() {
                    let (oa, ob) = (orders[a], orders[b]);
                    if cut_ins[a] <= cut_ins[b] {
                        prop_assert!(oa < ob);
                    } else {
                        prop_assert!(oa > ob);
                    }
                }
            }

            orders.sort_unstable();
            prop_assert_eq!(orders, (1..=cut_ins.len() as i64).collect::<Vec<_>>());
        }
    }
}
