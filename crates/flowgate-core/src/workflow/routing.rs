//! Routing for branch, fork and split nodes.
//!
//! These nodes do no work of their own: they pass their input items through,
//! re-paired to their source, and decide which outgoing edges fire.

use flowgate_types::item::Item;
use flowgate_types::workflow::{BranchRule, SplitMode, SplitRoute};
use serde_json::Value;

use super::expression::evaluate_condition;

/// Flatten input ports (lowest first), pairing each item to its source.
pub fn pass_through(inputs: &[Vec<Item>]) -> Vec<Item> {
    inputs
        .iter()
        .enumerate()
        .flat_map(|(port, items)| {
            items
                .iter()
                .enumerate()
                .map(move |(i, item)| item.clone().paired_with(i, port))
        })
        .collect()
}

/// Pick the label of the first rule whose condition holds for `snapshot`,
/// falling back to `default_label`. `None` means no branch matched.
pub fn select_branch<'a>(
    rules: &'a [BranchRule],
    default_label: Option<&'a str>,
    snapshot: &Value,
) -> Option<&'a str> {
    rules
        .iter()
        .find(|rule| evaluate_condition(&rule.condition, snapshot))
        .map(|rule| rule.label.as_str())
        .or(default_label)
}

/// Distribute items over `port_count` output ports.
///
/// For `filter`, port `i` receives the items matching `routes[i]`; the port
/// count is the number of routes.
pub fn split(mode: &SplitMode, items: Vec<Item>, port_count: usize) -> Vec<Vec<Item>> {
    match mode {
        SplitMode::Clone => vec![items; port_count.max(1)],
        SplitMode::Distribute => {
            let ports = port_count.max(1);
            let mut out = vec![Vec::new(); ports];
            for (i, item) in items.into_iter().enumerate() {
                out[i % ports].push(item);
            }
            out
        }
        SplitMode::Filter { routes } => routes
            .iter()
            .map(|route| {
                items
                    .iter()
                    .filter(|item| !item.is_error() && evaluate_condition(&route.condition, item.json()))
                    .cloned()
                    .collect()
            })
            .collect(),
    }
}

/// Output port of the filter route named `label`.
pub fn route_port(routes: &[SplitRoute], label: &str) -> Option<usize> {
    routes.iter().position(|route| route.label == label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_types::condition::Condition;
    use flowgate_types::item::PairedItem;
    use serde_json::json;

    fn items(values: &[Value]) -> Vec<Item> {
        values.iter().cloned().map(Item::new).collect()
    }

    #[test]
    fn test_pass_through_repairs() {
        let out = pass_through(&[items(&[json!(1)]), items(&[json!(2), json!(3)])]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].paired(), &[PairedItem::new(1, 1)]);
    }

    #[test]
    fn test_select_branch_first_match_then_default() {
        let rules = vec![
            BranchRule {
                label: "create".to_string(),
                condition: Condition::parse(&json!({"$and": [{"op": "create"}, {"adv": true}]})).unwrap(),
            },
            BranchRule {
                label: "any-create".to_string(),
                condition: Condition::equals("op", json!("create")),
            },
        ];
        assert_eq!(
            select_branch(&rules, None, &json!({"op": "create", "adv": true})),
            Some("create")
        );
        assert_eq!(
            select_branch(&rules, None, &json!({"op": "create", "adv": false})),
            Some("any-create")
        );
        assert_eq!(select_branch(&rules, Some("other"), &json!({"op": "delete"})), Some("other"));
        assert_eq!(select_branch(&rules, None, &json!({"op": "delete"})), None);
    }

    #[test]
    fn test_split_modes() {
        let input = items(&[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);

        let cloned = split(&SplitMode::Clone, input.clone(), 2);
        assert_eq!(cloned[0].len(), 3);
        assert_eq!(cloned[1].len(), 3);

        let distributed = split(&SplitMode::Distribute, input.clone(), 2);
        assert_eq!(distributed[0].len(), 2);
        assert_eq!(distributed[1].len(), 1);
        assert_eq!(distributed[1][0].json(), &json!({"n": 2}));

        let routes = vec![
            SplitRoute {
                label: "odd".to_string(),
                condition: Condition::parse(&json!({"n": {"$in": [1, 3]}})).unwrap(),
            },
            SplitRoute {
                label: "two".to_string(),
                condition: Condition::equals("n", json!(2)),
            },
        ];
        assert_eq!(route_port(&routes, "two"), Some(1));
        assert_eq!(route_port(&routes, "even"), None);
        let filtered = split(&SplitMode::Filter { routes }, input, 0);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].len(), 2);
        assert_eq!(filtered[1].len(), 1);
    }
}
