//! Mutation tracking for containers reachable from state fields.
//!
//! Reading a mutable field through a node yields a [`MutableProxy`]. The proxy
//! exposes the read surface of the wrapped container and a set of mutating
//! operations; every mutation checks the owner is writable, unwraps its
//! arguments, applies the change to the real container and reports the owning
//! field as dirty. Nested containers are handed out as fresh proxies on every
//! access, bound to the same owner and field.

pub mod unwrap;

pub use unwrap::{unwrap_arg, Arg};

use crate::error::{Result, SyncError};
use crate::value::{map_key, Shared, Value};
use std::fmt;
use std::sync::Arc;

/// Receiver of mutation notifications (a state node in practice).
pub trait MutationSink: Send + Sync {
    /// Fail with [`SyncError::ImmutableState`] if the owner cannot be written.
    fn ensure_mutable(&self) -> Result<()>;

    /// Record that `field` changed.
    fn mark_dirty(&self, field: &str);
}

/// Result of a read through a proxy.
#[derive(Clone, Debug)]
pub enum Item {
    /// Scalars, strings and tuples.
    Value(Value),
    /// Mutable containers, wrapped so edits are tracked.
    Proxy(MutableProxy),
}

impl Item {
    /// The raw value, unwrapping a proxy.
    pub fn value(&self) -> Value {
        match self {
            Item::Value(value) => value.clone(),
            Item::Proxy(proxy) => proxy.value(),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Item::Value(value) => value,
            Item::Proxy(proxy) => proxy.into_value(),
        }
    }

    pub fn as_proxy(&self) -> Option<&MutableProxy> {
        match self {
            Item::Proxy(proxy) => Some(proxy),
            Item::Value(_) => None,
        }
    }

    /// The proxy, or `InvalidOperation` for a plain value.
    pub fn into_proxy(self) -> Result<MutableProxy> {
        match self {
            Item::Proxy(proxy) => Ok(proxy),
            Item::Value(value) => Err(SyncError::InvalidOperation(format!(
                "{} is not a mutable container",
                value.kind_name()
            ))),
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, Item::Proxy(_))
    }
}

/// A transient wrapper around a container owned by a state field.
#[derive(Clone)]
pub struct MutableProxy {
    target: Value,
    owner: Arc<dyn MutationSink>,
    field: String,
}

impl MutableProxy {
    /// Wrap `target`, or `None` if it is not a mutable container.
    pub fn new(target: Value, owner: Arc<dyn MutationSink>, field: impl Into<String>) -> Option<Self> {
        if !target.is_mutable() {
            return None;
        }
        Some(Self {
            target,
            owner,
            field: field.into(),
        })
    }

    /// Wrap a value read from this proxy: containers get a fresh proxy bound
    /// to the same owner and field, everything else is returned as is.
    fn wrap(&self, value: Value) -> Item {
        if value.is_mutable() {
            Item::Proxy(Self {
                target: value,
                owner: Arc::clone(&self.owner),
                field: self.field.clone(),
            })
        } else {
            Item::Value(value)
        }
    }

    /// The wrapped object (same shared instance).
    pub fn value(&self) -> Value {
        self.target.clone()
    }

    pub fn into_value(self) -> Value {
        self.target
    }

    /// Name of the state field the proxy reports to.
    pub fn field(&self) -> &str {
        &self.field
    }

    // ---- read surface ----

    pub fn len(&self) -> usize {
        self.target.len().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence element; negative indices count from the end.
    pub fn index(&self, index: i64) -> Result<Item> {
        match &self.target {
            Value::List(items) => {
                let items = items.read();
                let at = resolve_index(index, items.len())?;
                Ok(self.wrap(items[at].clone()))
            }
            other => Err(unsupported("index", other)),
        }
    }

    /// Mapping entry.
    pub fn key(&self, key: &str) -> Result<Option<Item>> {
        match &self.target {
            Value::Map(entries) => Ok(entries.read().get(key).cloned().map(|v| self.wrap(v))),
            other => Err(unsupported("key lookup", other)),
        }
    }

    /// Record attribute.
    pub fn attr(&self, name: &str) -> Result<Item> {
        match &self.target {
            Value::Record(record) => {
                let record = record.read();
                match record.fields.get(name) {
                    Some(value) => Ok(self.wrap(value.clone())),
                    None => Err(SyncError::UnknownField {
                        state: record.type_name.clone(),
                        field: name.to_string(),
                    }),
                }
            }
            other => Err(unsupported("attribute access", other)),
        }
    }

    /// Snapshot of the elements (values, for a mapping).
    ///
    /// The snapshot is taken once; mutating the container while iterating
    /// it does not affect the returned items.
    pub fn items(&self) -> Vec<Item> {
        let values: Vec<Value> = match &self.target {
            Value::List(items) | Value::Set(items) => items.read().clone(),
            Value::Map(entries) => entries.read().values().cloned().collect(),
            Value::Record(record) => record.read().fields.values().cloned().collect(),
            _ => Vec::new(),
        };
        values.into_iter().map(|v| self.wrap(v)).collect()
    }

    /// Mapping keys or record attribute names.
    pub fn keys(&self) -> Vec<String> {
        match &self.target {
            Value::Map(entries) => entries.read().keys().cloned().collect(),
            Value::Record(record) => record.read().fields.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn entries(&self) -> Vec<(String, Item)> {
        let pairs: Vec<(String, Value)> = match &self.target {
            Value::Map(entries) => entries.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Value::Record(record) => record
                .read()
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => Vec::new(),
        };
        pairs.into_iter().map(|(k, v)| (k, self.wrap(v))).collect()
    }

    /// Membership: elements for sequences and sets, keys for mappings.
    pub fn contains(&self, needle: impl Into<Arg>) -> Result<bool> {
        let needle = unwrap_arg(needle.into())?;
        Ok(match &self.target {
            Value::List(items) | Value::Set(items) => items.read().contains(&needle),
            Value::Map(entries) => match map_key(&needle) {
                Ok(key) => entries.read().contains_key(&key),
                Err(_) => false,
            },
            Value::Record(record) => needle
                .as_str()
                .is_some_and(|name| record.read().fields.contains_key(name)),
            _ => false,
        })
    }

    // ---- mutating surface ----

    /// Run a mutation: check access, apply, then report the field dirty.
    fn mutate<R>(&self, apply: impl FnOnce(&Value) -> Result<R>) -> Result<R> {
        self.owner.ensure_mutable()?;
        let result = apply(&self.target)?;
        self.owner.mark_dirty(&self.field);
        Ok(result)
    }

    /// Append to a list.
    pub fn push(&self, item: impl Into<Arg>) -> Result<()> {
        let item = unwrap_arg(item.into())?;
        self.mutate(|target| match target {
            Value::List(items) => {
                items.write().push(item);
                Ok(())
            }
            other => Err(unsupported("push", other)),
        })
    }

    /// Insert into a list before `index` (clamped like slice insertion).
    pub fn insert(&self, index: i64, item: impl Into<Arg>) -> Result<()> {
        let item = unwrap_arg(item.into())?;
        self.mutate(|target| match target {
            Value::List(items) => {
                let mut items = items.write();
                let len = items.len() as i64;
                let at = if index < 0 { (len + index).max(0) } else { index.min(len) };
                items.insert(at as usize, item);
                Ok(())
            }
            other => Err(unsupported("insert", other)),
        })
    }

    /// Append every item to a list, or add every item to a set.
    pub fn extend<A: Into<Arg>>(&self, items: impl IntoIterator<Item = A>) -> Result<()> {
        // Unwrap (and so snapshot) the whole batch before taking the write
        // lock; the batch may come from this very container.
        let batch = items
            .into_iter()
            .map(|item| unwrap_arg(item.into()))
            .collect::<Result<Vec<_>>>()?;
        self.mutate(|target| match target {
            Value::List(items) => {
                items.write().extend(batch);
                Ok(())
            }
            Value::Set(items) => {
                add_unique(items, batch);
                Ok(())
            }
            other => Err(unsupported("extend", other)),
        })
    }

    /// Assign by list index, mapping key or record attribute name.
    pub fn set_item(&self, key: impl Into<Arg>, value: impl Into<Arg>) -> Result<()> {
        let key = unwrap_arg(key.into())?;
        let value = unwrap_arg(value.into())?;
        self.mutate(|target| match target {
            Value::List(items) => {
                let index = key.as_int().ok_or_else(|| {
                    SyncError::InvalidOperation(format!("list index must be int, not {}", key.kind_name()))
                })?;
                let mut items = items.write();
                let at = resolve_index(index, items.len())?;
                items[at] = value;
                Ok(())
            }
            Value::Map(entries) => {
                entries.write().insert(map_key(&key)?, value);
                Ok(())
            }
            Value::Record(record) => {
                record.write().fields.insert(map_key(&key)?, value);
                Ok(())
            }
            other => Err(unsupported("item assignment", other)),
        })
    }

    /// Delete by list index or mapping key, returning the removed value.
    pub fn remove_item(&self, key: impl Into<Arg>) -> Result<Value> {
        let key = unwrap_arg(key.into())?;
        self.mutate(|target| match target {
            Value::List(items) => {
                let index = key.as_int().ok_or_else(|| {
                    SyncError::InvalidOperation(format!("list index must be int, not {}", key.kind_name()))
                })?;
                let mut items = items.write();
                let at = resolve_index(index, items.len())?;
                Ok(items.remove(at))
            }
            Value::Map(entries) => {
                let key = map_key(&key)?;
                entries
                    .write()
                    .remove(&key)
                    .ok_or_else(|| SyncError::InvalidOperation(format!("key {key:?} not found")))
            }
            other => Err(unsupported("item deletion", other)),
        })
    }

    /// Remove and return the last list element.
    pub fn pop(&self) -> Result<Value> {
        self.mutate(|target| match target {
            Value::List(items) => items
                .write()
                .pop()
                .ok_or_else(|| SyncError::InvalidOperation("pop from empty list".into())),
            other => Err(unsupported("pop", other)),
        })
    }

    /// Empty the container.
    pub fn clear(&self) -> Result<()> {
        self.mutate(|target| match target {
            Value::List(items) | Value::Set(items) => {
                items.write().clear();
                Ok(())
            }
            Value::Map(entries) => {
                entries.write().clear();
                Ok(())
            }
            Value::Record(record) => {
                record.write().fields.clear();
                Ok(())
            }
            other => Err(unsupported("clear", other)),
        })
    }

    /// Add to a set.
    pub fn add(&self, item: impl Into<Arg>) -> Result<()> {
        let item = unwrap_arg(item.into())?;
        self.mutate(|target| match target {
            Value::Set(items) => {
                add_unique(items, [item]);
                Ok(())
            }
            other => Err(unsupported("add", other)),
        })
    }

    /// Remove from a set if present.
    pub fn discard(&self, item: impl Into<Arg>) -> Result<()> {
        let item = unwrap_arg(item.into())?;
        self.mutate(|target| match target {
            Value::Set(items) => {
                let kept: Vec<Value> = items.read().iter().filter(|e| *e != &item).cloned().collect();
                *items.write() = kept;
                Ok(())
            }
            other => Err(unsupported("discard", other)),
        })
    }

    /// Merge a mapping into a mapping, or a collection into a set.
    pub fn update(&self, other: impl Into<Arg>) -> Result<()> {
        let source = unwrap_arg(other.into())?;
        // Snapshot the source first: it may alias the target.
        let source_entries: Vec<(Value, Value)> = match &source {
            Value::Map(entries) => entries
                .read()
                .iter()
                .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
                .collect(),
            Value::List(items) | Value::Set(items) => {
                items.read().iter().map(|v| (v.clone(), Value::Null)).collect()
            }
            Value::Tuple(items) => items.iter().map(|v| (v.clone(), Value::Null)).collect(),
            other => return Err(unsupported("update from", other)),
        };
        self.mutate(|target| match (target, &source) {
            (Value::Map(entries), Value::Map(_)) => {
                let mut entries = entries.write();
                for (key, value) in source_entries {
                    entries.insert(map_key(&key)?, value);
                }
                Ok(())
            }
            (Value::Set(items), Value::List(_) | Value::Set(_) | Value::Tuple(_)) => {
                add_unique(items, source_entries.into_iter().map(|(item, _)| item));
                Ok(())
            }
            (other, _) => Err(unsupported("update", other)),
        })
    }

    /// Assign a record attribute.
    pub fn set_attr(&self, name: &str, value: impl Into<Arg>) -> Result<()> {
        let value = unwrap_arg(value.into())?;
        self.mutate(|target| match target {
            Value::Record(record) => {
                record.write().fields.insert(name.to_string(), value);
                Ok(())
            }
            other => Err(unsupported("attribute assignment", other)),
        })
    }
}

impl fmt::Debug for MutableProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableProxy")
            .field("field", &self.field)
            .field("target", &self.target)
            .finish()
    }
}

fn resolve_index(index: i64, len: usize) -> Result<usize> {
    let resolved = if index < 0 { len as i64 + index } else { index };
    if resolved < 0 || resolved >= len as i64 {
        return Err(SyncError::InvalidOperation(format!(
            "index {index} out of range for length {len}"
        )));
    }
    Ok(resolved as usize)
}

/// Add the items of `batch` missing from the set. Equality runs against a
/// snapshot: comparing may read containers that hold the set itself, which
/// must not happen under its write lock.
fn add_unique(items: &Shared<Vec<Value>>, batch: impl IntoIterator<Item = Value>) {
    let existing = items.read().clone();
    let mut fresh: Vec<Value> = Vec::new();
    for item in batch {
        if !existing.contains(&item) && !fresh.contains(&item) {
            fresh.push(item);
        }
    }
    items.write().extend(fresh);
}

fn unsupported(operation: &str, target: &Value) -> SyncError {
    SyncError::InvalidOperation(format!("{operation} not supported on {}", target.kind_name()))
}
