use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{btree_map, BTreeMap, BTreeSet};

use crate::ItemId;

/// Marks an item as removed, or as not yet existing on the server.
pub const INVISIBLE: &str = "sync.invisible";

/// Id of the item that owns this one. Owned items form the dependent subtree.
pub const MASTER: &str = "sync.master";

/// Immutable-by-convention snapshot of one item's attribute values.
///
/// An absent key and an explicit "no value" are the same thing: setting
/// `None` removes the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeMap {
    values: BTreeMap<String, Value>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot used as the base of items that do not exist on the server.
    pub fn invisible() -> Self {
        let mut map = Self::new();
        map.insert(INVISIBLE, Value::Bool(true));
        map
    }

    pub fn with(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(attr, value);
        self
    }

    pub fn insert(&mut self, attr: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        let attr = attr.into();
        if value.is_null() {
            self.values.remove(&attr);
        } else {
            self.values.insert(attr, value);
        }
    }

    pub fn set(&mut self, attr: &str, value: Option<Value>) {
        match value {
            Some(value) => self.insert(attr, value),
            None => {
                self.values.remove(attr);
            }
        }
    }

    pub fn remove(&mut self, attr: &str) -> Option<Value> {
        self.values.remove(attr)
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.values.get(attr)
    }

    pub fn contains(&self, attr: &str) -> bool {
        self.values.contains_key(attr)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_invisible(&self) -> bool {
        matches!(self.values.get(INVISIBLE), Some(Value::Bool(true)))
    }

    pub fn master(&self) -> Option<ItemId> {
        self.values.get(MASTER).and_then(Value::as_i64).map(ItemId)
    }

    /// Attributes whose values differ between `self` and `other`, including
    /// keys present on one side only.
    pub fn changed_attributes(&self, other: &AttributeMap) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        for (attr, value) in &self.values {
            if other.values.get(attr) != Some(value) {
                changed.insert(attr.clone());
            }
        }
        for attr in other.values.keys() {
            if !self.values.contains_key(attr) {
                changed.insert(attr.clone());
            }
        }
        changed
    }

    /// Copies the given attributes (present or absent) from `source`.
    pub fn overlay<'a>(&mut self, source: &AttributeMap, attrs: impl IntoIterator<Item = &'a str>) {
        for attr in attrs {
            self.set(attr, source.get(attr).cloned());
        }
    }
}

impl FromIterator<(String, Value)> for AttributeMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut map = AttributeMap::new();
        for (attr, value) in iter {
            map.insert(attr, value);
        }
        map
    }
}

impl<'a> IntoIterator for &'a AttributeMap {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_removes_value() {
        let mut map = AttributeMap::new().with("title", "a");
        map.insert("title", Value::Null);
        assert!(map.is_empty());
    }

    #[test]
    fn test_changed_attributes_covers_both_sides() {
        let base = AttributeMap::new().with("title", "a").with("owner", "x");
        let trunk = AttributeMap::new().with("title", "b").with("status", "open");
        let changed = base.changed_attributes(&trunk);
        assert_eq!(
            changed.into_iter().collect::<Vec<_>>(),
            vec!["owner".to_string(), "status".to_string(), "title".to_string()]
        );
    }

    #[test]
    fn test_invisible_and_master() {
        assert!(AttributeMap::invisible().is_invisible());
        let map = AttributeMap::new().with(MASTER, json!(12)).with(INVISIBLE, false);
        assert!(!map.is_invisible());
        assert_eq!(map.master(), Some(ItemId(12)));
    }
}
