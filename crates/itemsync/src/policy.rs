/// Conflict policies consulted by the auto-merge engine
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use itemdb::Reader;
use items::{ItemDiff, ItemId, INVISIBLE};

use crate::MergeData;

/// Host-supplied rules for reconciling one kind of item.
pub trait ConflictPolicy: Send + Sync {
    /// Adjusts the local diff before merging, e.g. forgets derived
    /// attributes. A diff left without changes discards the local edit.
    fn pre_process(&self, _reader: &Reader<'_>, _local: &mut ItemDiff) {}

    /// Resolves the conflicting attributes it knows how to handle.
    fn resolve(&self, reader: &Reader<'_>, data: &mut MergeData);

    /// Whether two new values of `attr` count as the same change.
    fn values_equal(&self, _attr: &str, a: Option<&Value>, b: Option<&Value>) -> bool {
        a == b
    }
}

/// Chooses the policy for an item. `None` falls back to [`StrictPolicy`].
pub trait PolicySelector: Send + Sync {
    fn policy(&self, reader: &Reader<'_>, item: ItemId) -> Option<Arc<dyn ConflictPolicy>>;
}

/// Same policy for every item
pub struct FixedPolicy(pub Arc<dyn ConflictPolicy>);

impl PolicySelector for FixedPolicy {
    fn policy(&self, _reader: &Reader<'_>, _item: ItemId) -> Option<Arc<dyn ConflictPolicy>> {
        Some(self.0.clone())
    }
}

/// Default policy: accepts a local delete or revive that meets server
/// changes, and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictPolicy;

impl ConflictPolicy for StrictPolicy {
    fn resolve(&self, _reader: &Reader<'_>, data: &mut MergeData) {
        let unresolved = data.unresolved();
        if unresolved.is_empty() {
            return;
        }
        if unresolved.len() == 1 && unresolved.contains(INVISIBLE) && data.local().is_changed(INVISIBLE) {
            data.resolve_to_local(INVISIBLE);
            return;
        }
        tracing::error!(item = %data.item(), conflicts = ?unresolved, "no conflict policy for item");
    }
}

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Server value wins every conflict
    PreferServer,

    /// Local value wins every conflict
    PreferLocal,

    /// Set-merge array values, leave scalar conflicts
    Merge,

    /// Leave every conflict to the user
    Manual,
}

/// Applies one [`ResolutionStrategy`] to every conflicting attribute.
#[derive(Debug, Clone, Copy)]
pub struct StrategyPolicy {
    strategy: ResolutionStrategy,
}

impl StrategyPolicy {
    pub fn new(strategy: ResolutionStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }
}

impl ConflictPolicy for StrategyPolicy {
    fn resolve(&self, _reader: &Reader<'_>, data: &mut MergeData) {
        for attr in data.unresolved() {
            match self.strategy {
                ResolutionStrategy::PreferServer => data.resolve_to_server(&attr),
                ResolutionStrategy::PreferLocal => data.resolve_to_local(&attr),
                ResolutionStrategy::Merge => {
                    if !data.resolve_composite(&attr) {
                        tracing::debug!(item = %data.item(), %attr, "scalar conflict left for the user");
                    }
                }
                ResolutionStrategy::Manual => {}
            }
        }
    }
}
