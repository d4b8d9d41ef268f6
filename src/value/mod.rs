//! Composite values held in state fields.
//!
//! Scalars and tuples are plain values. Lists, sets, mappings and records are
//! shared mutable containers: cloning a [`Value`] aliases the same object, so
//! two fields can reference one list just like two references to one object.
//! Use [`Value::deep_copy`] for an isolated copy.

pub mod wire;

use crate::error::{Result, SyncError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A shared, interior-mutable container.
pub type Shared<T> = Arc<RwLock<T>>;

/// A named bag of attributes (a plain data object).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    pub type_name: String,
    pub fields: BTreeMap<String, Value>,
}

/// A state field value.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Value>),
    List(Shared<Vec<Value>>),
    Set(Shared<Vec<Value>>),
    Map(Shared<BTreeMap<String, Value>>),
    Record(Shared<Record>),
}

/// Memo table for identity-preserving copies, keyed by object address.
pub(crate) type CopyMemo = HashMap<usize, Value>;

fn shared<T>(inner: T) -> Shared<T> {
    Arc::new(RwLock::new(inner))
}

pub(crate) fn object_key<T>(shared: &Shared<T>) -> usize {
    Arc::as_ptr(shared) as *const () as usize
}

impl Value {
    /// New shared list.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(shared(items.into_iter().collect()))
    }

    /// New shared set; duplicate items are dropped.
    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        let mut unique: Vec<Value> = Vec::new();
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Value::Set(shared(unique))
    }

    /// New shared mapping.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(shared(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// New shared record.
    pub fn record<K: Into<String>>(
        type_name: impl Into<String>,
        fields: impl IntoIterator<Item = (K, Value)>,
    ) -> Self {
        Value::Record(shared(Record {
            type_name: type_name.into(),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }))
    }

    /// New immutable tuple.
    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple(items.into_iter().collect())
    }

    /// Whether the value is a shared mutable container.
    pub fn is_mutable(&self) -> bool {
        matches!(
            self,
            Value::List(_) | Value::Set(_) | Value::Map(_) | Value::Record(_)
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "dict",
            Value::Record(_) => "record",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Number of items for containers, `None` for scalars.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Tuple(items) => Some(items.len()),
            Value::List(items) | Value::Set(items) => Some(items.read_recursive().len()),
            Value::Map(entries) => Some(entries.read_recursive().len()),
            Value::Record(record) => Some(record.read_recursive().fields.len()),
            _ => None,
        }
    }

    /// Whether both values are the very same shared object.
    pub fn same_object(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) | (Value::Set(a), Value::Set(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::Record(a), Value::Record(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Copy with no structure shared with `self`. Aliasing inside the value
    /// (the same object reachable twice, or cycles) is reproduced in the copy.
    pub fn deep_copy(&self) -> Value {
        self.deep_copy_with(&mut CopyMemo::new())
    }

    pub(crate) fn deep_copy_with(&self, memo: &mut CopyMemo) -> Value {
        match self {
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(*b),
            Value::Int(i) => Value::Int(*i),
            Value::Float(f) => Value::Float(*f),
            Value::Str(s) => Value::Str(s.clone()),
            Value::Tuple(items) => Value::Tuple(items.iter().map(|v| v.deep_copy_with(memo)).collect()),
            Value::List(items) => copy_shared(items, memo, Value::List, |items, memo| {
                items.iter().map(|v| v.deep_copy_with(memo)).collect()
            }),
            Value::Set(items) => copy_shared(items, memo, Value::Set, |items, memo| {
                items.iter().map(|v| v.deep_copy_with(memo)).collect()
            }),
            Value::Map(entries) => copy_shared(entries, memo, Value::Map, |entries, memo| {
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy_with(memo)))
                    .collect()
            }),
            Value::Record(record) => copy_shared(record, memo, Value::Record, |record, memo| Record {
                type_name: record.type_name.clone(),
                fields: record
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy_with(memo)))
                    .collect(),
            }),
        }
    }

    /// Convert to JSON for delivery to the UI.
    ///
    /// Sets and tuples become arrays, records become objects. Non-finite
    /// floats and cyclic references become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_inner(&mut Vec::new())
    }

    fn to_json_inner(&self, stack: &mut Vec<usize>) -> serde_json::Value {
        use serde_json::Value as Json;

        let key = match self {
            Value::List(s) | Value::Set(s) => Some(object_key(s)),
            Value::Map(s) => Some(object_key(s)),
            Value::Record(s) => Some(object_key(s)),
            _ => None,
        };
        if let Some(key) = key {
            if stack.contains(&key) {
                tracing::warn!("cyclic value replaced by null in JSON output");
                return Json::Null;
            }
            stack.push(key);
        }

        let json = match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::Tuple(items) => Json::Array(items.iter().map(|v| v.to_json_inner(stack)).collect()),
            Value::List(items) | Value::Set(items) => Json::Array(
                items
                    .read_recursive()
                    .iter()
                    .map(|v| v.to_json_inner(stack))
                    .collect(),
            ),
            Value::Map(entries) => Json::Object(
                entries
                    .read_recursive()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_inner(stack)))
                    .collect(),
            ),
            Value::Record(record) => Json::Object(
                record
                    .read_recursive()
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_inner(stack)))
                    .collect(),
            ),
        };

        if key.is_some() {
            stack.pop();
        }
        json
    }

    /// Build a value from JSON (arrays become lists, objects become mappings).
    pub fn from_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json)),
            Json::Object(entries) => {
                Value::map(entries.iter().map(|(k, v)| (k.clone(), Value::from_json(v))))
            }
        }
    }
}

fn copy_shared<T: Default>(
    source: &Shared<T>,
    memo: &mut CopyMemo,
    wrap: fn(Shared<T>) -> Value,
    copy: impl FnOnce(&T, &mut CopyMemo) -> T,
) -> Value {
    let key = object_key(source);
    if let Some(existing) = memo.get(&key) {
        return existing.clone();
    }

    // Register before descending so cycles land on the new object.
    let fresh: Shared<T> = shared(T::default());
    memo.insert(key, wrap(Arc::clone(&fresh)));

    let guard = source.read_recursive();
    let copied = copy(&*guard, memo);
    drop(guard);
    *fresh.write() = copied;
    wrap(fresh)
}

/// Map keys must be strings; ints and bools are rendered.
pub(crate) fn map_key(value: &Value) -> Result<String> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(SyncError::InvalidOperation(format!(
            "unhashable mapping key of type {}",
            other.kind_name()
        ))),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.same_object(other) {
            return true;
        }
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::List(a), Value::List(b)) => *a.read_recursive() == *b.read_recursive(),
            (Value::Set(a), Value::Set(b)) => {
                let a = a.read_recursive();
                let b = b.read_recursive();
                a.len() == b.len() && a.iter().all(|item| b.contains(item))
            }
            (Value::Map(a), Value::Map(b)) => *a.read_recursive() == *b.read_recursive(),
            (Value::Record(a), Value::Record(b)) => *a.read_recursive() == *b.read_recursive(),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "{b:?}"),
            Value::Int(i) => write!(f, "{i:?}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            _ => write!(f, "{}({})", self.kind_name(), self.to_json()),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(&json)
    }
}
