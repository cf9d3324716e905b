use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use items::{HistoryRecord, ItemDiff, ItemId, INVISIBLE};

use crate::ConflictPolicy;

/// Local and server changes of one item since their common base, with the
/// attributes both sides changed differently.
///
/// A conflict policy resolves the conflicting attributes, discards the local
/// edit, or resolves the item to be deleted.
#[derive(Debug, Clone)]
pub struct MergeData {
    local: ItemDiff,
    server: ItemDiff,
    conflicts: BTreeSet<String>,
    resolution: BTreeMap<String, Option<Value>>,
    history: Option<Vec<HistoryRecord>>,
    discard_edit: bool,
    delete: bool,
}

impl MergeData {
    pub fn new(local: ItemDiff, server: ItemDiff, policy: &dyn ConflictPolicy) -> Self {
        let mut conflicts: BTreeSet<String> = local
            .changed()
            .intersection(server.changed())
            .filter(|attr| !policy.values_equal(attr, local.new_value(attr), server.new_value(attr)))
            .cloned()
            .collect();

        let local_visibility = local.is_changed(INVISIBLE);
        let server_visibility = server.is_changed(INVISIBLE);
        let local_other = local.has_history() || local.changed().iter().any(|a| a != INVISIBLE);
        let server_other = server.changed().iter().any(|a| a != INVISIBLE);
        if (local_visibility && !server_visibility && server_other)
            || (server_visibility && !local_visibility && local_other)
        {
            conflicts.insert(INVISIBLE.to_string());
        }

        Self {
            local,
            server,
            conflicts,
            resolution: BTreeMap::new(),
            history: None,
            discard_edit: false,
            delete: false,
        }
    }

    pub fn item(&self) -> ItemId {
        self.local.item()
    }

    pub fn local(&self) -> &ItemDiff {
        &self.local
    }

    pub fn server(&self) -> &ItemDiff {
        &self.server
    }

    pub fn conflicts(&self) -> &BTreeSet<String> {
        &self.conflicts
    }

    /// Conflicting attributes without a resolution yet.
    pub fn unresolved(&self) -> BTreeSet<String> {
        self.conflicts
            .iter()
            .filter(|attr| !self.resolution.contains_key(*attr))
            .cloned()
            .collect()
    }

    pub fn is_conflict_resolved(&self) -> bool {
        self.discard_edit || self.delete || self.unresolved().is_empty()
    }

    pub fn resolve_to_local(&mut self, attr: &str) {
        let value = self.local.new_value(attr).cloned();
        self.resolution.insert(attr.to_string(), value);
    }

    pub fn resolve_to_server(&mut self, attr: &str) {
        let value = self.server.new_value(attr).cloned();
        self.resolution.insert(attr.to_string(), value);
    }

    pub fn resolve_to_value(&mut self, attr: &str, value: Option<Value>) {
        self.resolution.insert(attr.to_string(), value);
    }

    /// Set-merges an attribute holding a JSON array: the server elements,
    /// plus those added locally, minus those removed locally. `false` when a
    /// side holds something other than an array.
    pub fn resolve_composite(&mut self, attr: &str) -> bool {
        let (Some(base), Some(local), Some(server)) = (
            as_array(self.local.base_value(attr)),
            as_array(self.local.new_value(attr)),
            as_array(self.server.new_value(attr)),
        ) else {
            return false;
        };
        let mut merged: Vec<Value> = server
            .iter()
            .filter(|v| !(base.contains(v) && !local.contains(v)))
            .cloned()
            .collect();
        for value in local {
            if !base.contains(value) && !merged.contains(value) {
                merged.push(value.clone());
            }
        }
        let value = (!merged.is_empty()).then(|| Value::Array(merged));
        self.resolution.insert(attr.to_string(), value);
        true
    }

    /// Drops the local edit: the item takes the server state.
    pub fn discard_edit(&mut self) {
        self.discard_edit = true;
    }

    /// Resolves the item to be removed with its dependents.
    pub fn resolve_delete(&mut self) {
        self.delete = true;
    }

    pub fn is_discard_edit(&self) -> bool {
        self.discard_edit
    }

    pub fn is_delete(&self) -> bool {
        self.delete
    }

    pub fn resolution(&self) -> &BTreeMap<String, Option<Value>> {
        &self.resolution
    }

    /// History of the local edit, as resolved.
    pub fn history(&self) -> &[HistoryRecord] {
        self.history.as_deref().unwrap_or(self.local.history())
    }

    pub fn set_history(&mut self, history: Vec<HistoryRecord>) {
        self.history = Some(history);
    }

    /// History to persist on the trunk, or `None` when it did not change.
    pub fn updated_history(&self) -> Option<Vec<HistoryRecord>> {
        match &self.history {
            Some(history) => Some(history.clone()),
            None => self.local.updated_history(),
        }
    }
}

fn as_array(value: Option<&Value>) -> Option<&[Value]> {
    match value {
        None => Some(&[]),
        Some(Value::Array(values)) => Some(values),
        Some(_) => None,
    }
}
