use serde_json::Value;
use std::collections::BTreeSet;

use crate::{AttributeMap, HistoryRecord, ItemId};

/// Difference between two versions of one item.
///
/// A local diff goes from a base snapshot to the trunk and carries the part
/// of the trunk history that has not been uploaded yet. A server diff goes
/// from the base to a newer server snapshot and never carries history.
#[derive(Debug, Clone)]
pub struct ItemDiff {
    item: ItemId,
    base: AttributeMap,
    target: AttributeMap,
    changed: BTreeSet<String>,
    history: Vec<HistoryRecord>,
    history_trimmed: bool,
    history_modified: bool,
}

impl ItemDiff {
    /// Local diff. `uploaded_history` is the number of leading trunk history
    /// records the server has already acknowledged.
    pub fn to_trunk(
        item: ItemId,
        base: &AttributeMap,
        trunk: &AttributeMap,
        trunk_history: &[HistoryRecord],
        uploaded_history: usize,
    ) -> Self {
        let skip = uploaded_history.min(trunk_history.len());
        Self {
            item,
            base: base.clone(),
            target: trunk.clone(),
            changed: base.changed_attributes(trunk),
            history: trunk_history[skip..].to_vec(),
            history_trimmed: skip > 0,
            history_modified: false,
        }
    }

    pub fn server(item: ItemId, base: &AttributeMap, server: &AttributeMap) -> Self {
        Self {
            item,
            base: base.clone(),
            target: server.clone(),
            changed: base.changed_attributes(server),
            history: Vec::new(),
            history_trimmed: false,
            history_modified: false,
        }
    }

    pub fn item(&self) -> ItemId {
        self.item
    }

    pub fn base(&self) -> &AttributeMap {
        &self.base
    }

    pub fn target(&self) -> &AttributeMap {
        &self.target
    }

    pub fn changed(&self) -> &BTreeSet<String> {
        &self.changed
    }

    pub fn is_changed(&self, attr: &str) -> bool {
        self.changed.contains(attr)
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty() || !self.history.is_empty()
    }

    pub fn has_history(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn base_value(&self, attr: &str) -> Option<&Value> {
        self.base.get(attr)
    }

    pub fn new_value(&self, attr: &str) -> Option<&Value> {
        self.target.get(attr)
    }

    /// Drops an attribute from the change set, e.g. a derived value the
    /// host does not want merged.
    pub fn forget(&mut self, attr: &str) {
        self.changed.remove(attr);
    }

    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    pub fn set_history(&mut self, history: Vec<HistoryRecord>) {
        self.history = history;
        self.history_modified = true;
    }

    /// The history to persist on the trunk, or `None` when the stored one is
    /// still correct.
    pub fn updated_history(&self) -> Option<Vec<HistoryRecord>> {
        if self.history_trimmed || self.history_modified {
            Some(self.history.clone())
        } else {
            None
        }
    }
}
