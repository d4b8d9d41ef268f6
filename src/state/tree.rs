//! A client's state tree: resolution, copies and persistence.

use crate::error::{Result, SyncError};
use crate::minify::Schema;
use crate::state::registry::HandlerDef;
use crate::state::StateNode;
use crate::value::wire::{Decoder, Encoder, WireValue};
use crate::value::CopyMemo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Current persisted tree format version.
const TREE_FORMAT_VERSION: u8 = 1;

/// How path resolution treats sibling states sharing a wire id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionPolicy {
    /// Try candidates in registration order and take the first whose
    /// remaining path resolves.
    #[default]
    Backtrack,
    /// Fail when two siblings share the segment being resolved.
    Strict,
}

/// Persisted form: declared node path -> field -> value.
#[derive(Serialize, Deserialize)]
struct PersistedTree {
    version: u8,
    nodes: BTreeMap<String, BTreeMap<String, WireValue>>,
}

/// Handle to one client's tree. Cloning the handle shares the tree.
#[derive(Clone)]
pub struct StateTree {
    schema: Arc<Schema>,
    root: Arc<StateNode>,
    access: Arc<AtomicBool>,
}

impl StateTree {
    /// Fresh writable tree with default field values.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self::with_access(schema, true)
    }

    fn with_access(schema: Arc<Schema>, writable: bool) -> Self {
        let access = Arc::new(AtomicBool::new(writable));
        let root = StateNode::instantiate(&schema, 0, Weak::new(), &access);
        Self { schema, root, access }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn root(&self) -> &Arc<StateNode> {
        &self.root
    }

    pub fn is_writable(&self) -> bool {
        self.access.load(Ordering::Acquire)
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.access.store(writable, Ordering::Release);
    }

    /// All nodes, parents before children.
    pub fn nodes(&self) -> Vec<Arc<StateNode>> {
        let mut out = Vec::new();
        let mut stack = vec![Arc::clone(&self.root)];
        while let Some(node) = stack.pop() {
            stack.extend(node.children().iter().rev().cloned());
            out.push(node);
        }
        out
    }

    // ---- resolution ----

    /// Resolve a path of wire ids, starting with the root's.
    pub fn get_substate(&self, path: &[&str]) -> Result<Arc<StateNode>> {
        self.resolve(path, &|_| true)
    }

    /// Resolve a dotted handler path (`<node path>.<handler>`) to the node
    /// and the handler declared on it.
    pub fn resolve_handler(&self, handler_path: &str) -> Result<(Arc<StateNode>, HandlerDef)> {
        let segments: Vec<&str> = handler_path.split('.').collect();
        let Some((handler_wire, node_path)) = segments.split_last() else {
            return Err(SyncError::StateResolution(handler_path.to_string()));
        };
        let schema = &self.schema;
        let declares = |node: &StateNode| {
            let name = schema.handler_name(node.type_index(), handler_wire);
            node.handler(name).is_some()
        };
        let node = self.resolve(node_path, &declares).map_err(|e| match e {
            SyncError::StateResolution(reason) => {
                SyncError::StateResolution(format!("handler {handler_path}: {reason}"))
            }
            other => other,
        })?;
        let name = self.schema.handler_name(node.type_index(), handler_wire);
        let handler = node
            .handler(name)
            .ok_or_else(|| SyncError::StateResolution(handler_path.to_string()))?;
        Ok((node, handler))
    }

    fn resolve(
        &self,
        path: &[&str],
        accept: &dyn Fn(&StateNode) -> bool,
    ) -> Result<Arc<StateNode>> {
        let Some((first, rest)) = path.split_first() else {
            return Err(SyncError::StateResolution("empty state path".into()));
        };
        if *first != self.root.wire_name() {
            return Err(SyncError::StateResolution(format!(
                "{} does not start at the root state",
                path.join(".")
            )));
        }
        match resolve_from(&self.root, rest, accept, self.schema.policy())? {
            Some(node) => Ok(node),
            None => {
                tracing::warn!(path = %path.join("."), "state path did not resolve");
                Err(SyncError::StateResolution(format!("{} not found", path.join("."))))
            }
        }
    }

    /// Node at a declared path such as `"state.todo"`.
    pub fn substate(&self, declared_path: &str) -> Result<Arc<StateNode>> {
        let mut segments = declared_path.split('.');
        if segments.next() != Some(self.root.name()) {
            return Err(SyncError::StateResolution(declared_path.to_string()));
        }
        let mut node = Arc::clone(&self.root);
        for segment in segments {
            let child = node
                .child(segment)
                .cloned()
                .ok_or_else(|| SyncError::StateResolution(declared_path.to_string()))?;
            node = child;
        }
        Ok(node)
    }

    // ---- copies ----

    /// Writable copy sharing no structure with this tree. Aliasing between
    /// field values is reproduced. The copy starts clean.
    pub fn deep_copy(&self) -> StateTree {
        self.copy_with_access(true)
    }

    /// Copy whose mutations fail with [`SyncError::ImmutableState`].
    pub fn read_only_copy(&self) -> StateTree {
        self.copy_with_access(false)
    }

    fn copy_with_access(&self, writable: bool) -> StateTree {
        let copy = StateTree::with_access(Arc::clone(&self.schema), writable);
        let mut memo = CopyMemo::new();
        for (source, target) in self.nodes().iter().zip(copy.nodes()) {
            for (name, value) in source.fields() {
                target.load_field(&name, value.deep_copy_with(&mut memo));
            }
        }
        copy
    }

    // ---- persistence ----

    /// Serialize field values with one identity table for the whole tree.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let ordered: BTreeMap<String, Arc<StateNode>> = self
            .nodes()
            .into_iter()
            .map(|n| (n.path().to_string(), n))
            .collect();
        let mut encoder = Encoder::new();
        let mut nodes = BTreeMap::new();
        for (path, node) in ordered {
            let fields: BTreeMap<String, WireValue> = node
                .fields()
                .iter()
                .map(|(name, value)| (name.clone(), encoder.encode(value)))
                .collect();
            nodes.insert(path, fields);
        }
        let persisted = PersistedTree {
            version: TREE_FORMAT_VERSION,
            nodes,
        };
        Ok(rmp_serde::to_vec(&persisted)?)
    }

    /// Rebuild a tree from [`StateTree::to_bytes`] output.
    ///
    /// Stored fields that the schema no longer declares are dropped; declared
    /// fields missing from the blob keep their defaults.
    pub fn from_bytes(schema: Arc<Schema>, bytes: &[u8]) -> Result<StateTree> {
        let persisted: PersistedTree = rmp_serde::from_slice(bytes)?;
        if persisted.version != TREE_FORMAT_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "unsupported tree format version {}",
                persisted.version
            )));
        }
        let tree = StateTree::new(schema);
        let mut decoder = Decoder::new();
        for (path, fields) in &persisted.nodes {
            let node = tree.substate(path).ok();
            if node.is_none() {
                tracing::debug!(%path, "dropping stored state no longer declared");
            }
            for (name, wire) in fields {
                // Decode everything, even dropped values, so later
                // references to objects defined here still resolve.
                let value = decoder.decode(wire)?;
                if let Some(node) = &node {
                    if !node.load_field(name, value) {
                        tracing::debug!(%path, field = %name, "dropping stored field no longer declared");
                    }
                }
            }
        }
        Ok(tree)
    }
}

/// Depth-first search below `node` for a node matching `rest` and `accept`.
fn resolve_from(
    node: &Arc<StateNode>,
    rest: &[&str],
    accept: &dyn Fn(&StateNode) -> bool,
    policy: ResolutionPolicy,
) -> Result<Option<Arc<StateNode>>> {
    let Some((segment, remainder)) = rest.split_first() else {
        return Ok(accept(node).then(|| Arc::clone(node)));
    };
    let candidates: Vec<&Arc<StateNode>> = node
        .children()
        .iter()
        .filter(|c| c.wire_name() == *segment)
        .collect();
    if policy == ResolutionPolicy::Strict && candidates.len() > 1 {
        return Err(SyncError::StateResolution(format!(
            "ambiguous id {segment:?} below {}",
            node.wire_path()
        )));
    }
    for candidate in candidates {
        if let Some(found) = resolve_from(candidate, remainder, accept, policy)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

impl std::fmt::Debug for StateTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTree")
            .field("writable", &self.is_writable())
            .field("root", &self.root)
            .finish()
    }
}
