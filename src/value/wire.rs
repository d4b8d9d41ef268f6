//! Identity-preserving encoding of values for persistence.
//!
//! A container reachable twice (or through a cycle) is written once with an
//! object id; later occurrences become [`WireValue::Ref`]. Decoding rebuilds a
//! single shared object for every id, so aliasing survives a persist/load.

use super::{object_key, Record, Shared, Value};
use crate::error::{Result, SyncError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Serializable form of a [`Value`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<WireValue>),
    List {
        id: u32,
        items: Vec<WireValue>,
    },
    Set {
        id: u32,
        items: Vec<WireValue>,
    },
    Map {
        id: u32,
        entries: BTreeMap<String, WireValue>,
    },
    Record {
        id: u32,
        type_name: String,
        fields: BTreeMap<String, WireValue>,
    },
    /// Back-reference to an object already written in this encoding pass.
    Ref(u32),
}

/// Encoder with a memo table scoped to one serialization pass.
#[derive(Default)]
pub struct Encoder {
    seen: HashMap<usize, u32>,
    next_id: u32,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a value, sharing the memo with earlier calls on this encoder.
    pub fn encode(&mut self, value: &Value) -> WireValue {
        match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::Float(*f),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Tuple(items) => WireValue::Tuple(items.iter().map(|v| self.encode(v)).collect()),
            Value::List(items) => match self.register(object_key(items)) {
                Err(existing) => WireValue::Ref(existing),
                Ok(id) => WireValue::List {
                    id,
                    items: items.read_recursive().iter().map(|v| self.encode(v)).collect(),
                },
            },
            Value::Set(items) => match self.register(object_key(items)) {
                Err(existing) => WireValue::Ref(existing),
                Ok(id) => WireValue::Set {
                    id,
                    items: items.read_recursive().iter().map(|v| self.encode(v)).collect(),
                },
            },
            Value::Map(entries) => match self.register(object_key(entries)) {
                Err(existing) => WireValue::Ref(existing),
                Ok(id) => WireValue::Map {
                    id,
                    entries: entries
                        .read_recursive()
                        .iter()
                        .map(|(k, v)| (k.clone(), self.encode(v)))
                        .collect(),
                },
            },
            Value::Record(record) => match self.register(object_key(record)) {
                Err(existing) => WireValue::Ref(existing),
                Ok(id) => {
                    let record = record.read_recursive();
                    WireValue::Record {
                        id,
                        type_name: record.type_name.clone(),
                        fields: record
                            .fields
                            .iter()
                            .map(|(k, v)| (k.clone(), self.encode(v)))
                            .collect(),
                    }
                }
            },
        }
    }

    /// Assign an id to a new object, or return the existing id as `Err`.
    fn register(&mut self, key: usize) -> std::result::Result<u32, u32> {
        if let Some(&id) = self.seen.get(&key) {
            return Err(id);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.seen.insert(key, id);
        Ok(id)
    }
}

/// Decoder with an object table scoped to one deserialization pass.
#[derive(Default)]
pub struct Decoder {
    objects: HashMap<u32, Value>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, wire: &WireValue) -> Result<Value> {
        Ok(match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(*b),
            WireValue::Int(i) => Value::Int(*i),
            WireValue::Float(f) => Value::Float(*f),
            WireValue::Str(s) => Value::Str(s.clone()),
            WireValue::Tuple(items) => Value::Tuple(
                items
                    .iter()
                    .map(|w| self.decode(w))
                    .collect::<Result<Vec<_>>>()?,
            ),
            WireValue::List { id, items } => {
                let fresh = self.define(*id, Value::List)?;
                let decoded = items.iter().map(|w| self.decode(w)).collect::<Result<Vec<_>>>()?;
                *fresh.write() = decoded;
                Value::List(fresh)
            }
            WireValue::Set { id, items } => {
                let fresh = self.define(*id, Value::Set)?;
                let decoded = items.iter().map(|w| self.decode(w)).collect::<Result<Vec<_>>>()?;
                *fresh.write() = decoded;
                Value::Set(fresh)
            }
            WireValue::Map { id, entries } => {
                let fresh = self.define(*id, Value::Map)?;
                let mut decoded = BTreeMap::new();
                for (k, w) in entries {
                    decoded.insert(k.clone(), self.decode(w)?);
                }
                *fresh.write() = decoded;
                Value::Map(fresh)
            }
            WireValue::Record {
                id,
                type_name,
                fields,
            } => {
                let fresh = self.define(*id, Value::Record)?;
                let mut decoded = BTreeMap::new();
                for (k, w) in fields {
                    decoded.insert(k.clone(), self.decode(w)?);
                }
                *fresh.write() = Record {
                    type_name: type_name.clone(),
                    fields: decoded,
                };
                Value::Record(fresh)
            }
            WireValue::Ref(id) => self
                .objects
                .get(id)
                .cloned()
                .ok_or_else(|| SyncError::Deserialization(format!("dangling object reference {id}")))?,
        })
    }

    /// Create the empty shared object for `id` before its contents are decoded.
    fn define<T: Default>(&mut self, id: u32, wrap: fn(Shared<T>) -> Value) -> Result<Shared<T>> {
        if self.objects.contains_key(&id) {
            return Err(SyncError::Corruption(format!("object id {id} defined twice")));
        }
        let fresh: Shared<T> = Arc::new(RwLock::new(T::default()));
        self.objects.insert(id, wrap(Arc::clone(&fresh)));
        Ok(fresh)
    }
}
