use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use itemdb::Reader;
use items::ItemId;

use crate::{EditControl, EditSession, EditStart};

/// Handle of a registered short-lived locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortLockerId(u64);

#[derive(Default)]
struct ShortProcess {
    short_locks: BTreeSet<ItemId>,
    deferred: Vec<EditStart>,
}

#[derive(Default)]
struct LockState {
    locks: HashMap<ItemId, EditControl>,
    processes: HashMap<ShortLockerId, ShortProcess>,
}

/// Item to edit session map. At most one session holds an item.
///
/// Short lockers (merges and simplified commits running inside one write
/// transaction) keep their own busy sets; edit starts touching those items
/// wait until the locker is cleared.
#[derive(Default)]
pub struct EditLockTable {
    state: Mutex<LockState>,
    next_locker: AtomicU64,
}

fn is_same(lock: &EditControl, session: &EditSession) -> bool {
    std::ptr::eq(Arc::as_ptr(lock), session)
}

fn find_other(
    locks: &HashMap<ItemId, EditControl>,
    items: &[ItemId],
    ignore: Option<&EditSession>,
    ignore_too: Option<&EditSession>,
) -> Option<EditControl> {
    items.iter().find_map(|item| {
        let lock = locks.get(item)?;
        let ignored = ignore.map_or(false, |s| is_same(lock, s))
            || ignore_too.map_or(false, |s| is_same(lock, s));
        (!ignored).then(|| lock.clone())
    })
}

impl EditLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_lock(&self, item: ItemId) -> Option<EditControl> {
        self.find_any_lock(&[item], None)
    }

    /// A live session other than `ignore` holding any of `items`.
    pub fn find_any_lock(
        &self,
        items: &[ItemId],
        ignore: Option<&EditSession>,
    ) -> Option<EditControl> {
        loop {
            let lock = find_other(&self.state.lock().locks, items, ignore, None)?;
            if let Some(lock) = self.ensure_alive(lock) {
                return Some(lock);
            }
        }
    }

    // Must be called without the table lock held: releasing a dead session
    // re-enters the table.
    fn ensure_alive(&self, lock: EditControl) -> Option<EditControl> {
        if lock.is_alive() {
            return Some(lock);
        }
        lock.release();
        let removed = {
            let mut state = self.state.lock();
            let before = state.locks.len();
            state.locks.retain(|_, l| !Arc::ptr_eq(l, &lock));
            before - state.locks.len()
        };
        if removed > 0 {
            tracing::warn!(session = %lock.id(), removed, "dead session kept its locks after release");
        }
        None
    }

    pub fn lock_edit(&self, items: &[ItemId], session: &EditControl) -> bool {
        self.include_lock(session, items, None)
    }

    /// Locks `items` for `target`, taking over the entries `source` holds.
    /// All-or-nothing: on failure no new entry is left behind.
    pub fn include_lock(
        &self,
        target: &EditControl,
        items: &[ItemId],
        source: Option<&EditControl>,
    ) -> bool {
        let locked = loop {
            if let Some(source) = source {
                if !source.is_preparing() {
                    break false;
                }
            }
            let conflict = {
                let mut state = self.state.lock();
                match find_other(&state.locks, items, Some(&**target), source.map(|s| &**s)) {
                    Some(lock) => lock,
                    None => break self.take_entries(&mut state, target, items, source),
                }
            };
            if self.ensure_alive(conflict).is_some() {
                break false;
            }
        };
        if target.is_released() {
            self.unlock_all(target);
            return false;
        }
        locked
    }

    fn take_entries(
        &self,
        state: &mut LockState,
        target: &EditControl,
        items: &[ItemId],
        source: Option<&EditControl>,
    ) -> bool {
        let foreign = items.iter().find_map(|item| {
            let current = state.locks.get(item)?;
            let owned = is_same(current, target) || source.map_or(false, |s| is_same(current, s));
            (!owned).then(|| current.clone())
        });
        if let Some(current) = foreign {
            tracing::error!(
                holder = %current.id(),
                target = %target.id(),
                "item happens to be locked by another session"
            );
            return false;
        }
        if !target.items_locked(items) {
            return false;
        }
        if let Some(source) = source {
            source.remove_items(items);
        }
        for item in items {
            state.locks.insert(*item, target.clone());
        }
        true
    }

    pub fn unlock(&self, items: &[ItemId], session: &EditSession) {
        let mut state = self.state.lock();
        for item in items {
            if state.locks.get(item).map_or(false, |l| is_same(l, session)) {
                state.locks.remove(item);
            }
        }
    }

    /// Drops every entry held by `session`, including items it no longer
    /// lists.
    pub fn unlock_all(&self, session: &EditSession) {
        self.state.lock().locks.retain(|_, l| !is_same(l, session));
    }

    pub fn register_short_locker(&self) -> ShortLockerId {
        let id = ShortLockerId(self.next_locker.fetch_add(1, Ordering::Relaxed));
        self.state.lock().processes.insert(id, ShortProcess::default());
        id
    }

    /// Marks `items` busy for the short locker. Returns the live edit session
    /// (other than `ignore`) that prevents it, if any.
    pub fn short_lock_all(
        &self,
        locker: ShortLockerId,
        items: &[ItemId],
        ignore: Option<&EditSession>,
    ) -> Option<EditControl> {
        loop {
            let lock = {
                let mut state = self.state.lock();
                let LockState { locks, processes } = &mut *state;
                let process = processes.entry(locker).or_insert_with(|| {
                    tracing::error!(?locker, "short lock by unregistered locker");
                    ShortProcess::default()
                });
                let not_locked: Vec<ItemId> = items
                    .iter()
                    .copied()
                    .filter(|item| !process.short_locks.contains(item))
                    .collect();
                match find_other(locks, &not_locked, ignore, None) {
                    Some(lock) => lock,
                    None => {
                        process.short_locks.extend(not_locked);
                        return None;
                    }
                }
            };
            if let Some(lock) = self.ensure_alive(lock) {
                return Some(lock);
            }
        }
    }

    /// Forgets the short locker and hands back the edit starts deferred
    /// behind it.
    pub fn clear_short_locks(&self, locker: ShortLockerId) -> Vec<EditStart> {
        match self.state.lock().processes.remove(&locker) {
            Some(process) => process.deferred,
            None => {
                tracing::error!(?locker, "unknown short locker cleared");
                Vec::new()
            }
        }
    }

    /// Final check before an edit start runs its factory. `Ok(false)` means
    /// the start is dropped or deferred behind a short locker.
    pub fn ensure_can_edit(&self, reader: &Reader<'_>, start: &EditStart) -> itemdb::Result<bool> {
        let Some(session) = self.ensure_alive(start.session().clone()) else {
            tracing::debug!(session = %start.session().id(), "edit start not alive");
            return Ok(false);
        };
        let items = session.items();
        for item in &items {
            if reader.is_removed(*item)? {
                session.release();
                tracing::warn!(?items, "edit start not possible: item does not exist");
                return Ok(false);
            }
        }

        let wrong = {
            let mut state = self.state.lock();
            let LockState { locks, processes } = &mut *state;
            for (locker, process) in processes.iter_mut() {
                if items.iter().any(|item| process.short_locks.contains(item)) {
                    tracing::debug!(?items, ?locker, "edit start deferred");
                    process.deferred.push(start.clone());
                    return Ok(false);
                }
            }
            items
                .iter()
                .find(|item| !locks.get(item).map_or(false, |l| Arc::ptr_eq(l, &session)))
                .copied()
        };
        if let Some(item) = wrong {
            tracing::error!(%item, session = %session.id(), "wrong lock found for edit start");
            session.release();
            return Ok(false);
        }
        Ok(true)
    }
}
