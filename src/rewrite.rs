//! Step identifier regeneration.
//!
//! Step ids only mean something inside one flow instance, so a clone into an
//! environment that already holds the original needs fresh ones. Shared
//! objects (scripts, themes, ...) keep their ids.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    bundle::FlowBundle,
    model::{StepDoc, is_terminal},
    step_kind::StepKind,
};

const INNER_NODES_FIELD: &str = "nodes";

/// Old step id to new step id, for outer and inner steps alike.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapTable {
    map: HashMap<String, String>,
}

impl RemapTable {
    pub fn get(&self, old: &str) -> Option<&str> {
        self.map.get(old).map(String::as_str)
    }

    /// The new id for `old`, or `old` itself when it was not remapped.
    pub fn resolve<'a>(&'a self, old: &'a str) -> &'a str {
        self.get(old).unwrap_or(old)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn assign(&mut self, old: &str, generate: &mut dyn FnMut() -> String) {
        if is_terminal(old) || self.map.contains_key(old) {
            return;
        }
        let mut fresh = generate();
        while self.map.values().any(|v| v == &fresh) {
            fresh = generate();
        }
        self.map.insert(old.to_string(), fresh);
    }
}

/// Regenerate every step and inner step id with random UUIDs.
pub fn rewrite(bundle: &FlowBundle) -> (FlowBundle, RemapTable) {
    rewrite_with(bundle, || Uuid::new_v4().to_string())
}

/// Regenerate ids with a caller-supplied generator. The input is never
/// modified; the result is built from a full copy.
pub fn rewrite_with(
    bundle: &FlowBundle,
    mut generate: impl FnMut() -> String,
) -> (FlowBundle, RemapTable) {
    let types = bundle.step_types();
    let table = build_table(bundle, &types, &mut generate);
    let mut out = bundle.clone();

    if let Some(entry) = &bundle.tree.entry_node_id {
        out.tree.entry_node_id = Some(table.resolve(entry).to_string());
    }
    out.tree.nodes = bundle
        .tree
        .nodes
        .iter()
        .map(|(id, entry)| {
            let mut entry = entry.clone();
            for target in entry.connections.values_mut() {
                *target = table.resolve(target).to_string();
            }
            (table.resolve(id).to_string(), entry)
        })
        .collect();
    out.nodes = rewrite_steps(&bundle.nodes, &types, &table);
    out.inner_nodes = rewrite_steps(&bundle.inner_nodes, &types, &table);
    (out, table)
}

fn build_table(
    bundle: &FlowBundle,
    types: &HashMap<String, String>,
    generate: &mut dyn FnMut() -> String,
) -> RemapTable {
    let mut table = RemapTable::default();
    if let Some(entry) = &bundle.tree.entry_node_id {
        table.assign(entry, generate);
    }
    for (id, entry) in &bundle.tree.nodes {
        table.assign(id, generate);
        for target in entry.connections.values() {
            table.assign(target, generate);
        }
    }
    for (id, step) in bundle.nodes.iter().chain(bundle.inner_nodes.iter()) {
        table.assign(id, generate);
        for inner in container_refs(step, node_type(types, id)) {
            table.assign(inner, generate);
        }
    }
    table
}

fn node_type<'a>(types: &'a HashMap<String, String>, id: &str) -> &'a str {
    types.get(id).map(String::as_str).unwrap_or_default()
}

fn container_refs<'a>(step: &'a StepDoc, node_type: &str) -> impl Iterator<Item = &'a str> {
    let is_container = StepKind::parse(node_type, &step.config).is_container();
    step.config
        .get(INNER_NODES_FIELD)
        .filter(|_| is_container)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("_id").and_then(Value::as_str))
}

fn rewrite_steps(
    steps: &IndexMap<String, StepDoc>,
    types: &HashMap<String, String>,
    table: &RemapTable,
) -> IndexMap<String, StepDoc> {
    steps
        .iter()
        .map(|(id, step)| {
            let is_container = StepKind::parse(node_type(types, id), &step.config).is_container();
            let mut step = step.clone();
            step.id = table.resolve(&step.id).to_string();
            if is_container
                && let Some(Value::Array(items)) = step.config.get_mut(INNER_NODES_FIELD)
            {
                for item in items {
                    if let Some(Value::String(inner)) = item.get_mut("_id") {
                        *inner = table.resolve(inner).to_string();
                    }
                }
            }
            (table.resolve(id).to_string(), step)
        })
        .collect()
}
