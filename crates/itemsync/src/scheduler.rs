use parking_lot::Mutex;
use std::collections::BTreeSet;

use items::ItemId;

#[derive(Default)]
struct SchedulerState {
    pending: BTreeSet<ItemId>,
    scheduled: bool,
}

/// Items waiting for a background merge. At most one merge transaction is
/// scheduled at a time; requests arriving meanwhile are folded into the
/// pending set.
#[derive(Default)]
pub(crate) struct MergeScheduler {
    state: Mutex<SchedulerState>,
}

impl MergeScheduler {
    /// Adds items. `true` when the caller has to schedule the transaction.
    pub fn request(&self, items: &[ItemId]) -> bool {
        let mut state = self.state.lock();
        state.pending.extend(items.iter().copied());
        if state.scheduled || state.pending.is_empty() {
            return false;
        }
        state.scheduled = true;
        true
    }

    /// Pops everything pending for the running transaction.
    pub fn take(&self) -> Vec<ItemId> {
        std::mem::take(&mut self.state.lock().pending)
            .into_iter()
            .collect()
    }

    /// Called when the transaction settled. Failed items go back to the
    /// pending set. `true` when another transaction has to be scheduled.
    pub fn finished(&self, failed: Vec<ItemId>) -> bool {
        let mut state = self.state.lock();
        state.pending.extend(failed);
        state.scheduled = !state.pending.is_empty();
        state.scheduled
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        !state.scheduled && state.pending.is_empty()
    }
}
