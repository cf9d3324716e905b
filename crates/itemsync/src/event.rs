use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{btree_map, BTreeMap};
use std::sync::Arc;

use itemdb::Writer;
use items::{ItemId, SyncState};

use crate::CallbackExecutor;

/// Per-item outcomes of one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeEvent {
    items: BTreeMap<ItemId, SyncState>,
}

impl MergeEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(item: ItemId, state: SyncState) -> Self {
        let mut event = Self::new();
        event.add(item, state);
        event
    }

    pub fn add(&mut self, item: ItemId, state: SyncState) -> &mut Self {
        self.items.insert(item, state);
        self
    }

    pub fn add_all(&mut self, items: &[ItemId], state: SyncState) -> &mut Self {
        for item in items {
            self.items.insert(*item, state);
        }
        self
    }

    /// Later outcomes win over earlier ones for the same item.
    pub fn merge(&mut self, other: MergeEvent) {
        self.items.extend(other.items);
    }

    pub fn state(&self, item: ItemId) -> Option<SyncState> {
        self.items.get(&item).copied()
    }

    pub fn items(&self) -> Vec<ItemId> {
        self.items.keys().copied().collect()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ItemId, SyncState> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub trait MergeListener: Send + Sync {
    /// Called on the callback executor after a transaction that merged items
    /// committed. `icn` is the number of that transaction.
    fn on_items_merged(&self, icn: u64, event: &MergeEvent);
}

impl<F> MergeListener for F
where
    F: Fn(u64, &MergeEvent) + Send + Sync,
{
    fn on_items_merged(&self, icn: u64, event: &MergeEvent) {
        self(icn, event)
    }
}

#[derive(Default)]
pub(crate) struct Listeners {
    list: RwLock<Vec<Arc<dyn MergeListener>>>,
}

impl Listeners {
    pub fn add(&self, listener: Arc<dyn MergeListener>) {
        self.list.write().push(listener);
    }

    pub fn dispatch(&self, icn: u64, event: &MergeEvent) {
        let listeners = self.list.read().clone();
        for listener in listeners {
            listener.on_items_merged(icn, event);
        }
    }
}

/// Outcomes collected over one write transaction.
struct PendingEvent(Arc<Mutex<MergeEvent>>);

/// Adds outcomes to the event that is delivered once the current write
/// transaction commits. Nothing is delivered on rollback.
pub(crate) fn record_merged(
    writer: &mut Writer<'_>,
    listeners: &Arc<Listeners>,
    executor: &Arc<dyn CallbackExecutor>,
    event: MergeEvent,
) {
    if event.is_empty() {
        return;
    }
    if let Some(pending) = writer.cache().get::<PendingEvent>() {
        pending.0.lock().merge(event);
        return;
    }
    let shared = Arc::new(Mutex::new(event));
    writer
        .cache()
        .get_or_insert_with(|| PendingEvent(shared.clone()));

    let icn = writer.icn();
    let listeners = listeners.clone();
    let executor = executor.clone();
    writer.finally(move |success| {
        if !success {
            return;
        }
        let event = std::mem::take(&mut *shared.lock());
        tracing::debug!(icn, items = event.len(), "items merged");
        executor.execute(Box::new(move || listeners.dispatch(icn, &event)));
    });
}
