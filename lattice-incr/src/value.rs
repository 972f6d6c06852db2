//! Dynamic Values
//!
//! Every node in the graph holds a [`Value`]. Scalars and strings compare by
//! value; lists and maps are shared, interior-mutable composites that carry
//! a reference identity.
//!
//! # Identity vs Structure
//!
//! The default change-detection policy uses [`Value::same_ref`]: a freshly
//! allocated composite is always a new value, even if it has the same
//! contents. `PartialEq` is structural (see [`crate::change::deep_equal`]),
//! which is what tests and callers usually want when comparing results.
//!
//! Mutating a composite in place keeps its identity, so neither policy can
//! observe the mutation.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};

/// Shared list storage.
pub type ListRef = Rc<RefCell<Vec<Value>>>;

/// Shared map storage. Keys keep insertion order.
pub type MapRef = Rc<RefCell<IndexMap<String, Value>>>;

/// A dynamically typed value stored in a node.
#[derive(Clone, Default)]
pub enum Value {
    /// Absence of a value.
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Immutable shared string. Compared by content.
    Str(Rc<str>),
    /// Shared list. Compared by identity under the default policy.
    List(ListRef),
    /// Shared map. Compared by identity under the default policy.
    Map(MapRef),
}

impl Value {
    /// Allocate a new list.
    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Value::List(Rc::new(RefCell::new(
            items.into_iter().map(Into::into).collect(),
        )))
    }

    /// Allocate a new map.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Map(Rc::new(RefCell::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness used by conditional producers.
    ///
    /// `Null`, `false`, zero, NaN and the empty string are falsy. Composites
    /// are always truthy, even when empty.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::List(_) | Value::Map(_) => true,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Length of a list, map or string.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.chars().count()),
            Value::List(items) => Some(items.borrow().len()),
            Value::Map(entries) => Some(entries.borrow().len()),
            _ => None,
        }
    }

    /// Clone the list element at `index`.
    pub fn index(&self, index: usize) -> Option<Value> {
        match self {
            Value::List(items) => items.borrow().get(index).cloned(),
            _ => None,
        }
    }

    /// Clone the map entry at `key`.
    pub fn key(&self, key: &str) -> Option<Value> {
        match self {
            Value::Map(entries) => entries.borrow().get(key).cloned(),
            _ => None,
        }
    }

    /// Append to a list in place. Returns `false` for non-lists.
    ///
    /// The list keeps its identity, so the change is invisible to change
    /// detection.
    pub fn push(&self, value: impl Into<Value>) -> bool {
        match self {
            Value::List(items) => {
                items.borrow_mut().push(value.into());
                true
            }
            _ => false,
        }
    }

    /// Insert into a map in place. Returns `false` for non-maps.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        match self {
            Value::Map(entries) => {
                entries.borrow_mut().insert(key.into(), value.into());
                true
            }
            _ => false,
        }
    }

    /// Reference/value equality.
    ///
    /// Scalars and strings compare by value (NaN equals NaN so a producer
    /// returning NaN settles). Composites compare by identity.
    pub fn same_ref(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Address of a composite's storage, used as an identity key.
    pub(crate) fn addr(&self) -> Option<usize> {
        match self {
            Value::List(items) => Some(Rc::as_ptr(items) as *const () as usize),
            Value::Map(entries) => Some(Rc::as_ptr(entries) as *const () as usize),
            _ => None,
        }
    }

    /// Render as JSON. Back-references on the current path become
    /// `"[Circular]"`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut path = HashSet::new();
        self.to_json_inner(&mut path)
    }

    fn to_json_inner(&self, path: &mut HashSet<usize>) -> serde_json::Value {
        use serde_json::Value as Json;

        if let Some(addr) = self.addr() {
            if !path.insert(addr) {
                return Json::String("[Circular]".to_string());
            }
        }

        let json = match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.to_string()),
            Value::List(items) => Json::Array(
                items
                    .borrow()
                    .iter()
                    .map(|item| item.to_json_inner(path))
                    .collect(),
            ),
            Value::Map(entries) => Json::Object(
                entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_inner(path)))
                    .collect(),
            ),
        };

        if let Some(addr) = self.addr() {
            path.remove(&addr);
        }
        json
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        crate::change::deep_equal(self, other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
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

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::from(s),
            Json::Array(items) => Value::list(items.into_iter().map(Value::from)),
            Json::Object(entries) => {
                Value::map(entries.into_iter().map(|(k, v)| (k, Value::from(v))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_compare_by_value() {
        assert!(Value::from(3).same_ref(&Value::from(3)));
        assert!(Value::from("a").same_ref(&Value::from("a")));
        assert!(Value::Float(f64::NAN).same_ref(&Value::Float(f64::NAN)));
        assert!(!Value::from(3).same_ref(&Value::from(3.0)));
    }

    #[test]
    fn fresh_composites_are_distinct_references() {
        let a = Value::list([1, 2, 3]);
        let b = Value::list([1, 2, 3]);

        assert!(!a.same_ref(&b));
        assert!(a.same_ref(&a.clone()));
        // Structural equality still holds.
        assert_eq!(a, b);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from(0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::list(Vec::<Value>::new()).is_truthy());
        assert!(Value::from(-1).is_truthy());
    }

    #[test]
    fn json_round_trip_preserves_shape() {
        let value = Value::from(json!({"a": [1, 2.5, "x"], "b": null}));

        assert_eq!(value.key("a").and_then(|a| a.len()), Some(3));
        assert_eq!(value.to_json(), json!({"a": [1, 2.5, "x"], "b": null}));
    }

    #[test]
    fn cyclic_values_render_without_recursing_forever() {
        let list = Value::list([1]);
        list.push(list.clone());

        assert_eq!(list.to_json(), json!([1, "[Circular]"]));
        // Debug goes through the same renderer.
        assert_eq!(format!("{list:?}"), r#"[1,"[Circular]"]"#);
    }

    #[test]
    fn in_place_mutation_keeps_identity() {
        let list = Value::list([1]);
        let alias = list.clone();
        list.push(2);

        assert!(list.same_ref(&alias));
        assert_eq!(alias.len(), Some(2));
    }
}
