//! Wire values.
//!
//! [`Value`] is what the codec sees: plain data plus two reference variants.
//! [`Value::Ref`] names an object owned by the *sender* (the receiver turns it
//! into a proxy); [`Value::LocalRef`] names an object owned by the *receiver*
//! that the sender only held a proxy for.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an exposed object within one connection. Never reused.
pub type ObjectId = u64;

/// Description of a remote object's type, carried with every reference marker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeInfo {
    pub name: String,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Reference marker: an object too complex (or policy-forced) to send by value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefMarker {
    pub object_id: ObjectId,
    pub type_info: TypeInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Map(Vec<(Value, Value)>),
    /// Object owned by the sender of the message
    Ref(RefMarker),
    /// Object owned by the receiver of the message
    LocalRef(ObjectId),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Every marker emitted by the sender inside this value, depth first
    pub fn markers(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        self.collect_markers(&mut out);
        out
    }

    fn collect_markers(&self, out: &mut Vec<ObjectId>) {
        match self {
            Value::Ref(marker) => out.push(marker.object_id),
            Value::List(items) | Value::Tuple(items) => {
                items.iter().for_each(|v| v.collect_markers(out))
            }
            Value::Map(pairs) => pairs.iter().for_each(|(k, v)| {
                k.collect_markers(out);
                v.collect_markers(out);
            }),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_collected_depth_first() {
        let marker = |id| {
            Value::Ref(RefMarker {
                object_id: id,
                type_info: TypeInfo::new("T"),
            })
        };
        let value = Value::List(vec![
            marker(1),
            Value::Map(vec![(Value::Str("k".into()), marker(2))]),
            Value::LocalRef(5),
            Value::Tuple(vec![marker(3)]),
        ]);
        assert_eq!(value.markers(), vec![1, 2, 3]);
    }
}
