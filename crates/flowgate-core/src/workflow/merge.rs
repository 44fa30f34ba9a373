//! Merge strategies for join nodes.
//!
//! Inputs arrive partitioned by input port (lowest port first, several edges
//! into one port already concatenated in declaration order), so the output
//! order never depends on which branch finished first.
//!
//! Combining strategies work on object payloads; any other payload is wrapped
//! as `{"value": <payload>}` first. Items carrying an error are not combined:
//! they are forwarded after the combined items, paired to their source.

use flowgate_types::item::{BinaryRef, Item, PairedItem};
use flowgate_types::workflow::MergeStrategy;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::expression::lookup_path;

/// Combine the inputs of a merge node.
pub fn merge(strategy: &MergeStrategy, inputs: &[Vec<Item>]) -> Vec<Item> {
    match strategy {
        MergeStrategy::Append | MergeStrategy::WaitAll => append(inputs),
        MergeStrategy::CombineByIndex => {
            let (ports, errors) = partition_errors(inputs);
            let mut out = combine_by_index(&ports);
            out.extend(errors);
            out
        }
        MergeStrategy::CombineByKey { key, keep_unmatched } => {
            let (ports, errors) = partition_errors(inputs);
            let mut out = combine_by_key(&ports, key, *keep_unmatched);
            out.extend(errors);
            out
        }
        MergeStrategy::Multiplex => {
            let (ports, errors) = partition_errors(inputs);
            let mut out = multiplex(&ports);
            out.extend(errors);
            out
        }
    }
}

/// A source item together with its pairing coordinates.
type Sourced<'a> = (PairedItem, &'a Item);

fn append(inputs: &[Vec<Item>]) -> Vec<Item> {
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

fn partition_errors(inputs: &[Vec<Item>]) -> (Vec<Vec<Sourced<'_>>>, Vec<Item>) {
    let mut errors = Vec::new();
    let ports = inputs
        .iter()
        .enumerate()
        .map(|(port, items)| {
            items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| {
                    if item.is_error() {
                        errors.push(item.clone().paired_with(i, port));
                        None
                    } else {
                        Some((PairedItem::new(i, port), item))
                    }
                })
                .collect()
        })
        .collect();
    (ports, errors)
}

/// Zip items at equal index; a port that ran out contributes nothing.
fn combine_by_index(ports: &[Vec<Sourced<'_>>]) -> Vec<Item> {
    let len = ports.iter().map(Vec::len).max().unwrap_or(0);
    (0..len)
        .map(|i| combine(ports.iter().filter_map(|p| p.get(i).copied())))
        .collect()
}

/// Group by `key` across ports and merge groups present in every port.
fn combine_by_key(ports: &[Vec<Sourced<'_>>], key: &str, keep_unmatched: bool) -> Vec<Item> {
    // Keys in order of first appearance, lowest port first.
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<Vec<Sourced<'_>>>> = BTreeMap::new();
    let mut keyless = Vec::new();

    for (port, items) in ports.iter().enumerate() {
        for &sourced in items {
            let Some(value) = lookup_path(sourced.1.json(), key) else {
                keyless.push(sourced);
                continue;
            };
            let group_key = value.to_string();
            let group = groups.entry(group_key.clone()).or_insert_with(|| {
                order.push(group_key);
                vec![Vec::new(); ports.len()]
            });
            group[port].push(sourced);
        }
    }

    let mut out = Vec::new();
    for group_key in order {
        let Some(group) = groups.remove(&group_key) else {
            continue;
        };
        let matched = group.iter().all(|members| !members.is_empty());
        if matched {
            out.extend(product(&group));
        } else if keep_unmatched {
            let present: Vec<Vec<Sourced<'_>>> = group.into_iter().filter(|m| !m.is_empty()).collect();
            out.extend(product(&present));
        }
    }
    if keep_unmatched {
        out.extend(keyless.into_iter().map(|s| combine(std::iter::once(s))));
    }
    out
}

/// Cartesian product of all ports, in lexical order.
fn multiplex(ports: &[Vec<Sourced<'_>>]) -> Vec<Item> {
    if ports.iter().any(Vec::is_empty) {
        return Vec::new();
    }
    product(ports)
}

fn product(ports: &[Vec<Sourced<'_>>]) -> Vec<Item> {
    let mut combos: Vec<Vec<Sourced<'_>>> = vec![Vec::new()];
    for members in ports {
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                members.iter().map(move |&m| {
                    let mut next = prefix.clone();
                    next.push(m);
                    next
                })
            })
            .collect();
    }
    combos.into_iter().map(|c| combine(c.into_iter())).collect()
}

/// Shallow-merge payloads (later ports win) and union binaries and pairings.
fn combine<'a>(sources: impl Iterator<Item = Sourced<'a>>) -> Item {
    let mut payload = Map::new();
    let mut binaries: BTreeMap<String, BinaryRef> = BTreeMap::new();
    let mut pairing = Vec::new();
    for (paired, item) in sources {
        match item.json() {
            Value::Object(map) => payload.extend(map.iter().map(|(k, v)| (k.clone(), v.clone()))),
            other => {
                payload.insert("value".to_string(), other.clone());
            }
        }
        binaries.extend(item.binary().iter().map(|(k, v)| (k.clone(), v.clone())));
        pairing.push(paired);
    }
    Item::new(Value::Object(payload))
        .with_binaries(binaries)
        .with_pairing(pairing)
}
