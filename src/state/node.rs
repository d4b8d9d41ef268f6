//! One node of a client's state tree.

use crate::error::{Result, SyncError};
use crate::minify::Schema;
use crate::proxy::{unwrap_arg, Arg, Item, MutableProxy, MutationSink};
use crate::state::registry::{ComputedDef, HandlerDef, RegisteredType};
use crate::value::Value;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Mutable part of a node, behind one lock.
#[derive(Default)]
struct NodeData {
    fields: BTreeMap<String, Value>,
    /// Cached computed values; absent means stale.
    computed: HashMap<String, Value>,
    dirty_fields: BTreeSet<String>,
    dirty_children: BTreeSet<String>,
}

/// A state node: declared fields, cached computed fields and dirty tracking.
///
/// Nodes are owned by their parent (the root by its [`StateTree`]) and keep a
/// weak back-reference to the parent. All nodes of one tree share an access
/// flag; mutations fail with [`SyncError::ImmutableState`] while it is clear.
///
/// [`StateTree`]: crate::state::StateTree
pub struct StateNode {
    type_index: usize,
    schema: Arc<Schema>,
    parent: Weak<StateNode>,
    /// Children in registration order.
    children: Vec<Arc<StateNode>>,
    data: RwLock<NodeData>,
    access: Arc<AtomicBool>,
}

impl StateNode {
    /// Instantiate the type at `type_index` and all its descendants with
    /// default field values.
    pub(crate) fn instantiate(
        schema: &Arc<Schema>,
        type_index: usize,
        parent: Weak<StateNode>,
        access: &Arc<AtomicBool>,
    ) -> Arc<StateNode> {
        Arc::new_cyclic(|me| {
            let ty = schema.registry().get(type_index);
            let children = ty
                .children
                .iter()
                .map(|&child| StateNode::instantiate(schema, child, me.clone(), access))
                .collect();
            let fields = ty
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.default.deep_copy()))
                .collect();
            StateNode {
                type_index,
                schema: Arc::clone(schema),
                parent,
                children,
                data: RwLock::new(NodeData {
                    fields,
                    ..NodeData::default()
                }),
                access: Arc::clone(access),
            }
        })
    }

    fn ty(&self) -> &RegisteredType {
        self.schema.registry().get(self.type_index)
    }

    /// Declared type name.
    pub fn name(&self) -> &str {
        &self.ty().name
    }

    /// Declared path, e.g. `"state.todo"`.
    pub fn path(&self) -> &str {
        &self.ty().path
    }

    /// Identifier this node is addressed by on the wire.
    pub fn wire_name(&self) -> &str {
        self.schema.state_id(self.type_index)
    }

    /// Full wire path used as the delta key.
    pub fn wire_path(&self) -> &str {
        self.schema.wire_path(self.type_index)
    }

    pub fn type_index(&self) -> usize {
        self.type_index
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn parent(&self) -> Option<Arc<StateNode>> {
        self.parent.upgrade()
    }

    pub fn children(&self) -> &[Arc<StateNode>] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&Arc<StateNode>> {
        self.children.iter().find(|c| c.name() == name)
    }

    pub fn handler(&self, name: &str) -> Option<HandlerDef> {
        self.ty().handler(name).cloned()
    }

    /// Whether the tree this node belongs to accepts mutations.
    pub fn is_writable(&self) -> bool {
        self.access.load(Ordering::Acquire)
    }

    // ---- reads ----

    /// Read a field: own fields, then computed fields, then ancestors.
    ///
    /// Containers are returned as shared handles; edits made through them are
    /// not tracked. Use [`StateNode::item`] to edit in place.
    pub fn get(&self, field: &str) -> Result<Value> {
        if let Some(value) = self.data.read().fields.get(field) {
            return Ok(value.clone());
        }
        if let Some(def) = self.ty().computed_field(field) {
            return self.computed_value(def);
        }
        match self.parent.upgrade() {
            Some(parent) => parent.get(field),
            None => Err(SyncError::UnknownField {
                state: self.path().to_string(),
                field: field.to_string(),
            }),
        }
    }

    /// Read a field for in-place editing: containers come back wrapped in a
    /// proxy reporting to the node that declares the field.
    pub fn item(self: &Arc<Self>, field: &str) -> Result<Item> {
        let owner = self.owner_of(field).ok_or_else(|| SyncError::UnknownField {
            state: self.path().to_string(),
            field: field.to_string(),
        })?;
        let value = owner.get(field)?;
        if owner.ty().computed_field(field).is_some() {
            return Ok(Item::Value(value));
        }
        let sink: Arc<dyn MutationSink> = owner;
        Ok(match MutableProxy::new(value.clone(), sink, field) {
            Some(proxy) => Item::Proxy(proxy),
            None => Item::Value(value),
        })
    }

    fn computed_value(&self, def: &ComputedDef) -> Result<Value> {
        if let Some(cached) = self.data.read().computed.get(&def.name) {
            return Ok(cached.clone());
        }
        let value = (def.compute)(self)?;
        self.data
            .write()
            .computed
            .insert(def.name.clone(), value.clone());
        Ok(value)
    }

    /// Node (this one or an ancestor) declaring `field`.
    fn owner_of(self: &Arc<Self>, field: &str) -> Option<Arc<StateNode>> {
        let mut current = Some(Arc::clone(self));
        while let Some(node) = current {
            let ty = node.ty();
            if ty.field(field).is_some() || ty.computed_field(field).is_some() {
                return Some(node);
            }
            current = node.parent.upgrade();
        }
        None
    }

    /// Whether `field` may be written through `setvar`.
    pub fn is_settable(self: &Arc<Self>, field: &str) -> bool {
        self.owner_of(field)
            .and_then(|owner| owner.ty().field(field).map(|f| !f.backend && !f.builtin))
            .unwrap_or(false)
    }

    /// Snapshot of the declared field values (shared handles).
    pub fn fields(&self) -> BTreeMap<String, Value> {
        self.data.read().fields.clone()
    }

    // ---- writes ----

    /// Assign a field. Inherited fields are written on the declaring ancestor.
    pub fn set(self: &Arc<Self>, field: &str, value: impl Into<Arg>) -> Result<()> {
        self.ensure_mutable()?;
        let owner = self.owner_of(field).ok_or_else(|| SyncError::UnknownField {
            state: self.path().to_string(),
            field: field.to_string(),
        })?;
        if owner.ty().computed_field(field).is_some() {
            return Err(SyncError::InvalidOperation(format!(
                "computed field {field:?} on {} cannot be assigned",
                owner.path()
            )));
        }
        let value = unwrap_arg(value.into())?;
        owner.data.write().fields.insert(field.to_string(), value);
        owner.mark_dirty(field);
        Ok(())
    }

    /// Replace a field value without dirty tracking (used when loading).
    pub(crate) fn load_field(&self, field: &str, value: Value) -> bool {
        let mut data = self.data.write();
        match data.fields.get_mut(field) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    // ---- dirty tracking ----

    /// Record `field` as changed, invalidate computed fields depending on it
    /// and mark the path to the root.
    pub fn mark_dirty(&self, field: &str) {
        let mut changed = BTreeSet::from([field.to_string()]);
        {
            let mut data = self.data.write();
            data.dirty_fields.insert(field.to_string());
            let invalidated = invalidate_dependents(self.ty(), &mut data, &changed);
            changed.extend(invalidated);
        }
        self.invalidate_descendants(&changed);
        self.propagate_up();
    }

    /// Pass the names in `changed` that some descendant depends on down to
    /// the children.
    fn invalidate_descendants(&self, changed: &BTreeSet<String>) {
        let ty = self.ty();
        let relevant: BTreeSet<String> = changed
            .iter()
            .filter(|name| ty.descendant_deps.contains(*name))
            .cloned()
            .collect();
        if relevant.is_empty() {
            return;
        }
        for child in &self.children {
            child.invalidate_inherited(&relevant);
        }
    }

    /// Invalidate computed fields of this subtree that depend on changed
    /// ancestor fields, including ancestor computed fields.
    fn invalidate_inherited(&self, changed: &BTreeSet<String>) {
        let invalidated = {
            let mut data = self.data.write();
            invalidate_dependents(self.ty(), &mut data, changed)
        };
        if invalidated.is_empty() {
            self.invalidate_descendants(changed);
            return;
        }
        self.propagate_up();
        let mut next = changed.clone();
        next.extend(invalidated);
        self.invalidate_descendants(&next);
    }

    /// Record this node in the ancestors' `dirty_children`, stopping at the
    /// first ancestor that already has it.
    fn propagate_up(&self) {
        let mut child_name = self.name().to_string();
        let mut parent = self.parent.upgrade();
        while let Some(node) = parent {
            if !node.data.write().dirty_children.insert(child_name) {
                return;
            }
            child_name = node.name().to_string();
            parent = node.parent.upgrade();
        }
    }

    pub fn dirty_fields(&self) -> BTreeSet<String> {
        self.data.read().dirty_fields.clone()
    }

    pub fn dirty_children(&self) -> BTreeSet<String> {
        self.data.read().dirty_children.clone()
    }

    pub fn is_dirty(&self) -> bool {
        let data = self.data.read();
        !data.dirty_fields.is_empty() || !data.dirty_children.is_empty()
    }

    /// Clear dirty state of this subtree, and drop entries for it from the
    /// ancestors that become clean as a result.
    pub fn clean(&self) {
        self.clean_subtree();
        let mut child_name = self.name().to_string();
        let mut parent = self.parent.upgrade();
        while let Some(node) = parent {
            let now_clean = {
                let mut data = node.data.write();
                data.dirty_children.remove(&child_name);
                data.dirty_fields.is_empty() && data.dirty_children.is_empty()
            };
            if !now_clean {
                return;
            }
            child_name = node.name().to_string();
            parent = node.parent.upgrade();
        }
    }

    fn clean_subtree(&self) {
        let dirty_children = {
            let mut data = self.data.write();
            data.dirty_fields.clear();
            std::mem::take(&mut data.dirty_children)
        };
        for child in self.children.iter().filter(|c| dirty_children.contains(c.name())) {
            child.clean_subtree();
        }
    }
}

/// Drop cached computed fields depending (transitively) on any name in
/// `changed` and mark them dirty. Returns the invalidated names.
fn invalidate_dependents(
    ty: &RegisteredType,
    data: &mut NodeData,
    changed: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut pending: Vec<String> = changed.iter().cloned().collect();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    while let Some(name) = pending.pop() {
        for computed in ty.computed.iter().filter(|c| c.deps.contains(&name)) {
            if seen.insert(computed.name.clone()) {
                data.computed.remove(&computed.name);
                data.dirty_fields.insert(computed.name.clone());
                pending.push(computed.name.clone());
            }
        }
    }
    seen
}

impl MutationSink for StateNode {
    fn ensure_mutable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(SyncError::ImmutableState(format!(
                "{} is read-only; acquire exclusive access before mutating it",
                self.path()
            )))
        }
    }

    fn mark_dirty(&self, field: &str) {
        StateNode::mark_dirty(self, field);
    }
}

impl fmt::Debug for StateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read();
        f.debug_struct("StateNode")
            .field("path", &self.path())
            .field("fields", &data.fields)
            .field("dirty_fields", &data.dirty_fields)
            .field("dirty_children", &data.dirty_children)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StateRegistry, StateTree, StateType};

    fn schema() -> Arc<Schema> {
        let mut registry = StateRegistry::new(StateType::new("state").field("user", "ann")).unwrap();
        registry
            .register(
                "state",
                StateType::new("todo")
                    .field("items", Value::list([]))
                    .field("title", "")
                    .computed("count", &["items"], |node| {
                        Ok(Value::from(node.get("items")?.len().unwrap_or(0) as i64))
                    })
                    .computed("summary", &["count", "user"], |node| {
                        let count = node.get("count")?.as_int().unwrap_or(0);
                        let user = node.get("user")?;
                        Ok(Value::from(format!("{} has {count}", user.as_str().unwrap_or(""))))
                    }),
            )
            .unwrap();
        registry.register("state.todo", StateType::new("detail")).unwrap();
        Arc::new(Schema::plain(Arc::new(registry)))
    }

    fn tree() -> StateTree {
        StateTree::new(schema())
    }

    #[test]
    fn test_direct_set_marks_dirty_up_to_root() {
        let tree = tree();
        let todo = tree.substate("state.todo").unwrap();
        todo.set("title", "groceries").unwrap();

        assert!(todo.dirty_fields().contains("title"));
        assert!(tree.root().dirty_children().contains("todo"));
        assert_eq!(todo.get("title").unwrap(), Value::from("groceries"));
    }

    #[test]
    fn test_mutation_after_clean_marks_dirty() {
        let tree = tree();
        let todo = tree.substate("state.todo").unwrap();
        todo.set("items", Value::list([Value::record("Todo", [("done", Value::from(false))])]))
            .unwrap();
        tree.root().clean();
        assert!(!todo.is_dirty());
        assert!(!tree.root().is_dirty());

        let items = todo.item("items").unwrap().into_proxy().unwrap();
        let first = items.index(0).unwrap().into_proxy().unwrap();
        first.set_attr("done", true).unwrap();

        assert!(todo.dirty_fields().contains("items"));
        assert!(tree.root().dirty_children().contains("todo"));
    }

    #[test]
    fn test_computed_cache_invalidation_is_transitive() {
        let tree = tree();
        let todo = tree.substate("state.todo").unwrap();
        assert_eq!(todo.get("summary").unwrap(), Value::from("ann has 0"));
        tree.root().clean();

        let items = todo.item("items").unwrap().into_proxy().unwrap();
        items.push("milk").unwrap();

        let dirty = todo.dirty_fields();
        assert!(dirty.contains("count"));
        assert!(dirty.contains("summary"));
        assert_eq!(todo.get("summary").unwrap(), Value::from("ann has 1"));
    }

    #[test]
    fn test_ancestor_field_invalidates_descendant_computed() {
        let tree = tree();
        let todo = tree.substate("state.todo").unwrap();
        assert_eq!(todo.get("summary").unwrap(), Value::from("ann has 0"));
        tree.root().clean();

        tree.root().set("user", "bob").unwrap();

        assert!(todo.dirty_fields().contains("summary"));
        assert!(tree.root().dirty_children().contains("todo"));
        assert_eq!(todo.get("summary").unwrap(), Value::from("bob has 0"));
    }

    #[test]
    fn test_ancestor_computed_invalidates_descendant_computed() {
        let mut registry = StateRegistry::new(
            StateType::new("state")
                .field("user", "ann")
                .computed("upper", &["user"], |node| {
                    Ok(Value::from(node.get("user")?.as_str().unwrap_or("").to_uppercase()))
                }),
        )
        .unwrap();
        registry
            .register("state", StateType::new("greeting").computed("greet", &["upper"], |node| {
                Ok(Value::from(format!("hi {}", node.get("upper")?.as_str().unwrap_or(""))))
            }))
            .unwrap();
        registry
            .register("state.greeting", StateType::new("banner").computed("loud", &["greet"], |node| {
                Ok(Value::from(format!("{}!", node.get("greet")?.as_str().unwrap_or(""))))
            }))
            .unwrap();
        let tree = StateTree::new(Arc::new(Schema::plain(Arc::new(registry))));
        let greeting = tree.substate("state.greeting").unwrap();
        let banner = tree.substate("state.greeting.banner").unwrap();
        assert_eq!(greeting.get("greet").unwrap(), Value::from("hi ANN"));
        assert_eq!(banner.get("loud").unwrap(), Value::from("hi ANN!"));
        tree.root().clean();

        tree.root().set("user", "bob").unwrap();

        assert!(greeting.dirty_fields().contains("greet"));
        assert!(banner.dirty_fields().contains("loud"));
        assert!(tree.root().dirty_children().contains("greeting"));
        assert!(greeting.dirty_children().contains("banner"));
        assert_eq!(greeting.get("greet").unwrap(), Value::from("hi BOB"));
        assert_eq!(banner.get("loud").unwrap(), Value::from("hi BOB!"));
    }

    #[test]
    fn test_inherited_write_goes_to_declaring_ancestor() {
        let tree = tree();
        let detail = tree.substate("state.todo.detail").unwrap();
        detail.set("title", "from child").unwrap();

        let todo = tree.substate("state.todo").unwrap();
        assert_eq!(todo.get("title").unwrap(), Value::from("from child"));
        assert!(todo.dirty_fields().contains("title"));
        assert!(detail.dirty_fields().is_empty());
    }

    #[test]
    fn test_clean_child_clears_ancestor_entries() {
        let tree = tree();
        let detail = tree.substate("state.todo.detail").unwrap();
        detail.mark_dirty("anything");
        let todo = tree.substate("state.todo").unwrap();
        assert!(todo.dirty_children().contains("detail"));

        detail.clean();
        assert!(!todo.is_dirty());
        assert!(!tree.root().is_dirty());
    }

    #[test]
    fn test_clean_keeps_ancestor_with_other_dirt() {
        let tree = tree();
        let todo = tree.substate("state.todo").unwrap();
        let detail = tree.substate("state.todo.detail").unwrap();
        todo.set("title", "x").unwrap();
        detail.mark_dirty("anything");

        detail.clean();
        assert!(todo.dirty_fields().contains("title"));
        assert!(!todo.dirty_children().contains("detail"));
        assert!(tree.root().dirty_children().contains("todo"));
    }

    #[test]
    fn test_assignment_errors() {
        let tree = tree();
        let todo = tree.substate("state.todo").unwrap();
        assert!(matches!(todo.set("count", 3), Err(SyncError::InvalidOperation(_))));
        assert!(matches!(todo.set("nope", 3), Err(SyncError::UnknownField { .. })));
        assert!(todo.get("nope").is_err());
    }

    #[test]
    fn test_read_only_tree_rejects_writes() {
        let tree = tree().read_only_copy();
        let todo = tree.substate("state.todo").unwrap();
        assert!(matches!(todo.set("title", "x"), Err(SyncError::ImmutableState(_))));
        let items = todo.item("items").unwrap().into_proxy().unwrap();
        assert!(matches!(items.push(1), Err(SyncError::ImmutableState(_))));
        assert!(!todo.is_dirty());
    }

    #[test]
    fn test_defaults_are_not_shared_between_trees() {
        let schema = schema();
        let first = StateTree::new(Arc::clone(&schema));
        let second = StateTree::new(schema);
        let items = first.substate("state.todo").unwrap().item("items").unwrap().into_proxy().unwrap();
        items.push(1).unwrap();
        assert_eq!(second.substate("state.todo").unwrap().get("items").unwrap().len(), Some(0));
    }
}
