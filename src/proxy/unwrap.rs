//! Arguments to mutating proxy operations and their unwrapping.

use super::MutableProxy;
use crate::error::Result;
use crate::value::{map_key, Value};

/// A value handed to a mutating operation.
///
/// Arguments may be raw values, proxies, or composites built from either.
/// [`unwrap_arg`] turns an argument into a concrete [`Value`] before anything
/// is written, so proxies never end up inside state.
#[derive(Clone)]
pub enum Arg {
    Value(Value),
    Proxy(MutableProxy),
    Tuple(Vec<Arg>),
    List(Vec<Arg>),
    Set(Vec<Arg>),
    Map(Vec<(Arg, Arg)>),
    Record {
        type_name: String,
        fields: Vec<(String, Arg)>,
    },
}

/// Recursively replace proxies by the objects they wrap.
///
/// A proxy unwraps to the very object it wraps (not a copy), so writing an
/// unwrapped element back into a container aliases the original.
pub fn unwrap_arg(arg: Arg) -> Result<Value> {
    Ok(match arg {
        Arg::Value(value) => value,
        Arg::Proxy(proxy) => proxy.into_value(),
        Arg::Tuple(items) => Value::Tuple(unwrap_all(items)?),
        Arg::List(items) => Value::list(unwrap_all(items)?),
        Arg::Set(items) => Value::set(unwrap_all(items)?),
        Arg::Map(entries) => {
            let mut unwrapped = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                let key = map_key(&unwrap_arg(key)?)?;
                unwrapped.push((key, unwrap_arg(value)?));
            }
            Value::map(unwrapped)
        }
        Arg::Record { type_name, fields } => {
            let mut unwrapped = Vec::with_capacity(fields.len());
            for (name, value) in fields {
                unwrapped.push((name, unwrap_arg(value)?));
            }
            Value::record(type_name, unwrapped)
        }
    })
}

fn unwrap_all(items: Vec<Arg>) -> Result<Vec<Value>> {
    items.into_iter().map(unwrap_arg).collect()
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<MutableProxy> for Arg {
    fn from(proxy: MutableProxy) -> Self {
        Arg::Proxy(proxy)
    }
}

impl From<&MutableProxy> for Arg {
    fn from(proxy: &MutableProxy) -> Self {
        Arg::Proxy(proxy.clone())
    }
}

impl From<super::Item> for Arg {
    fn from(item: super::Item) -> Self {
        match item {
            super::Item::Value(value) => Arg::Value(value),
            super::Item::Proxy(proxy) => Arg::Proxy(proxy),
        }
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Arg::Value(Value::Bool(b))
    }
}

impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Arg::Value(Value::Int(i))
    }
}

impl From<i32> for Arg {
    fn from(i: i32) -> Self {
        Arg::Value(Value::from(i))
    }
}

impl From<f64> for Arg {
    fn from(f: f64) -> Self {
        Arg::Value(Value::Float(f))
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Value(Value::from(s))
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Value(Value::Str(s))
    }
}

impl From<serde_json::Value> for Arg {
    fn from(json: serde_json::Value) -> Self {
        Arg::Value(Value::from_json(&json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::testing::RecordingSink;

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(unwrap_arg(Arg::from(42)).unwrap(), Value::Int(42));
        assert_eq!(unwrap_arg(Arg::from("hello")).unwrap(), Value::from("hello"));
        assert_eq!(unwrap_arg(Arg::Value(Value::Null)).unwrap(), Value::Null);
        assert_eq!(unwrap_arg(Arg::from(2.5)).unwrap(), Value::Float(2.5));
    }

    #[test]
    fn test_tuple_of_proxies() {
        let sink = RecordingSink::new();
        let obj1 = Value::map([("a", Value::from(1))]);
        let obj2 = Value::map([("b", Value::from(2))]);
        let p1 = MutableProxy::new(obj1.clone(), sink.clone(), "data").unwrap();
        let p2 = MutableProxy::new(obj2.clone(), sink.clone(), "data").unwrap();

        let result = unwrap_arg(Arg::Tuple(vec![p1.into(), p2.into()])).unwrap();
        let Value::Tuple(items) = result else { panic!("expected tuple") };
        assert!(items[0].same_object(&obj1));
        assert!(items[1].same_object(&obj2));
    }

    #[test]
    fn test_set_of_proxies() {
        let sink = RecordingSink::new();
        let a = Value::list([Value::from(1)]);
        let b = Value::list([Value::from(2)]);
        let pa = MutableProxy::new(a.clone(), sink.clone(), "data").unwrap();
        let pb = MutableProxy::new(b.clone(), sink, "data").unwrap();

        let result = unwrap_arg(Arg::Set(vec![pa.into(), pb.into(), Arg::from(3)])).unwrap();
        assert_eq!(result, Value::set([a, b, Value::from(3)]));
    }

    #[test]
    fn test_mapping_keys_and_values() {
        let sink = RecordingSink::new();
        let val = Value::map([("a", Value::from(1))]);
        let proxy = MutableProxy::new(val.clone(), sink, "data").unwrap();

        let result = unwrap_arg(Arg::Map(vec![(Arg::from("k"), proxy.into())])).unwrap();
        let Value::Map(entries) = result else { panic!("expected map") };
        assert!(entries.read()["k"].same_object(&val));
    }

    #[test]
    fn test_nested_composites() {
        let sink = RecordingSink::new();
        let inner = Value::list([]);
        let proxy = MutableProxy::new(inner.clone(), sink, "data").unwrap();

        let arg = Arg::List(vec![Arg::Record {
            type_name: "Box".into(),
            fields: vec![("content".into(), Arg::Tuple(vec![proxy.into()]))],
        }]);
        let result = unwrap_arg(arg).unwrap();

        let Value::List(items) = result else { panic!("expected list") };
        let Value::Record(record) = items.read()[0].clone() else { panic!("expected record") };
        let Value::Tuple(content) = record.read().fields["content"].clone() else {
            panic!("expected tuple")
        };
        assert!(content[0].same_object(&inner));
    }

    #[test]
    fn test_unhashable_key_rejected() {
        let arg = Arg::Map(vec![(Arg::Value(Value::list([])), Arg::from(1))]);
        assert!(unwrap_arg(arg).is_err());
    }
}
