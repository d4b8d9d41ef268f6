//! Delta and snapshot serialization.
//!
//! A delta holds the dirty fields of every dirty node, keyed by wire path and
//! wire field name. Only subtrees listed in `dirty_children` are visited.
//! Backend-only fields are never included.

use crate::error::Result;
use crate::state::{StateNode, StateTree};
use crate::types::{Delta, FieldDelta};
use std::sync::Arc;

/// Collect the dirty fields of `tree` and clean it.
pub fn collect_delta(tree: &StateTree) -> Result<Delta> {
    let mut delta = Delta::new();
    collect_node(tree.root(), &mut delta)?;
    tree.root().clean();
    Ok(delta)
}

fn collect_node(node: &Arc<StateNode>, delta: &mut Delta) -> Result<()> {
    let dirty_fields = node.dirty_fields();
    if !dirty_fields.is_empty() {
        let fields = serialize_fields(node, dirty_fields.iter().map(String::as_str))?;
        if !fields.is_empty() {
            delta.insert(node.wire_path().to_string(), fields);
        }
    }
    let dirty_children = node.dirty_children();
    for child in node
        .children()
        .iter()
        .filter(|c| dirty_children.contains(c.name()))
    {
        collect_node(child, delta)?;
    }
    Ok(())
}

/// Every UI-visible field of every node, including computed fields. Used for
/// first paint; does not touch dirty state.
pub fn full_snapshot(tree: &StateTree) -> Result<Delta> {
    let schema = tree.schema();
    let mut delta = Delta::new();
    for node in tree.nodes() {
        let ty = schema.registry().get(node.type_index());
        let names = ty
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .chain(ty.computed.iter().map(|c| c.name.as_str()));
        let fields = serialize_fields(&node, names)?;
        delta.insert(node.wire_path().to_string(), fields);
    }
    Ok(delta)
}

fn serialize_fields<'a>(node: &StateNode, names: impl Iterator<Item = &'a str>) -> Result<FieldDelta> {
    let schema = node.schema();
    let ty = schema.registry().get(node.type_index());
    let mut fields = FieldDelta::new();
    for name in names {
        if ty.field(name).is_some_and(|f| f.backend) {
            continue;
        }
        // Marked names that are not fields of this node (or were invalidated
        // and no longer exist) are skipped.
        if ty.field(name).is_none() && ty.computed_field(name).is_none() {
            continue;
        }
        let value = node.get(name)?;
        fields.insert(
            schema.field_wire(node.type_index(), name).to_string(),
            value.to_json(),
        );
    }
    Ok(fields)
}
