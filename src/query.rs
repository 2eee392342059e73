use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::result::{DbResult, StoreError};

/// A sparse set of `field == value` conditions used by [`crate::RecordStore::find`].
///
/// Fields that are not mentioned are wildcards. Values are compared by their
/// serialized form, so strings compare case-sensitively and numbers compare by
/// value (`1` matches an `i32` or a `u64` field holding one, but not `1.0`).
///
/// ```
/// use recordbase::Example;
///
/// let example = Example::new().field("counter", 1).field("name", "xpto");
/// assert_eq!(example.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Example {
    fields: BTreeMap<String, Value>,
}

impl Example {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `name` to equal `value`.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Build an example from a partially populated value.
    ///
    /// Every field of `value` that serializes to something other than `null`
    /// becomes a condition, so `Option` fields left as `None` act as wildcards.
    pub fn from_partial<P: Serialize>(value: &P) -> DbResult<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self {
                fields: map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            }),
            other => Err(StoreError::serialization(format!(
                "an example must serialize to an object, got `{}`",
                other
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Translate into a predicate over stored values.
    pub fn into_predicate(self) -> Predicate {
        Predicate {
            conditions: self.fields.into_iter().collect(),
        }
    }
}

/// Equality conditions translated from an [`Example`].
#[derive(Debug, Clone)]
pub struct Predicate {
    conditions: Vec<(String, Value)>,
}

impl Predicate {
    /// Whether every condition holds for `value`.
    pub fn matches<T: Serialize>(&self, value: &T) -> DbResult<bool> {
        if self.conditions.is_empty() {
            return Ok(true);
        }

        let value = serde_json::to_value(value)?;
        let object = match value.as_object() {
            Some(object) => object,
            None => return Ok(false),
        };

        Ok(self
            .conditions
            .iter()
            .all(|(name, expected)| object.get(name) == Some(expected)))
    }
}
