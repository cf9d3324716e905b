use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use itemdb::{Reader, StoreError, TxHandle, Writer};
use items::{merge_history, AttributeMap, HistoryRecord, ItemId, Shadow, INVISIBLE};

use crate::{discard_single, last_server, EditControl, EditSession, ShortLockerId, SyncManager};

/// The user-supplied part of a commit.
pub trait EditCommit: Send {
    /// Runs inside the commit's write transaction. An error rolls the whole
    /// commit back.
    fn perform_commit(&mut self, drain: &mut EditDrain<'_, '_>) -> itemdb::Result<()>;

    /// Runs on the callback executor once the transaction settled.
    fn on_commit_finished(&mut self, _success: bool) {}
}

pub struct FnCommit<F>(F);

/// Wraps a closure as an [`EditCommit`].
pub fn commit_with<F>(f: F) -> FnCommit<F>
where
    F: FnMut(&mut EditDrain<'_, '_>) -> itemdb::Result<()> + Send,
{
    FnCommit(f)
}

impl<F> EditCommit for FnCommit<F>
where
    F: FnMut(&mut EditDrain<'_, '_>) -> itemdb::Result<()> + Send,
{
    fn perform_commit(&mut self, drain: &mut EditDrain<'_, '_>) -> itemdb::Result<()> {
        (self.0)(drain)
    }
}

/// Commit of prepared attribute values and deletions.
#[derive(Debug, Clone, Default)]
pub struct AttributeCommit {
    values: BTreeMap<ItemId, AttributeMap>,
    removed: BTreeMap<ItemId, BTreeSet<String>>,
    deletes: BTreeSet<ItemId>,
}

impl AttributeCommit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, item: ItemId, attr: &str, value: impl Into<Value>) -> Self {
        if let Some(removed) = self.removed.get_mut(&item) {
            removed.remove(attr);
        }
        self.values.entry(item).or_default().insert(attr, value);
        self
    }

    pub fn unset(mut self, item: ItemId, attr: &str) -> Self {
        if let Some(values) = self.values.get_mut(&item) {
            values.remove(attr);
        }
        self.removed.entry(item).or_default().insert(attr.to_string());
        self
    }

    pub fn set_values(mut self, item: ItemId, values: AttributeMap) -> Self {
        self.values.insert(item, values);
        self
    }

    pub fn delete(mut self, item: ItemId) -> Self {
        self.deletes.insert(item);
        self
    }
}

impl EditCommit for AttributeCommit {
    fn perform_commit(&mut self, drain: &mut EditDrain<'_, '_>) -> itemdb::Result<()> {
        for (item, values) in &self.values {
            drain.set_values(*item, values)?;
        }
        for (item, attrs) in &self.removed {
            for attr in attrs {
                drain.set_value(*item, attr, None)?;
            }
        }
        for item in &self.deletes {
            drain.delete(*item)?;
        }
        Ok(())
    }
}

/// Attributes another commit changed in an item an editor holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemChanges {
    pub changed: BTreeSet<String>,
    /// Current values of the changed attributes. Absent means removed.
    pub values: AttributeMap,
}

/// Who a commit runs for.
#[derive(Clone)]
pub(crate) enum CommitCounterpart {
    Session(EditControl),
    /// Short-locked items without an editor.
    Simplified {
        locker: ShortLockerId,
        items: Vec<ItemId>,
    },
    /// Creates items; touches existing ones only through `unsafe_change`.
    CreateOnly,
}

impl CommitCounterpart {
    fn prepare_commit(&self, reader: &Reader<'_>) -> itemdb::Result<Option<HashMap<ItemId, AttributeMap>>> {
        match self {
            CommitCounterpart::Session(session) => Ok(session.prepare_commit()),
            CommitCounterpart::Simplified { items, .. } => collect_bases(reader, items).map(Some),
            CommitCounterpart::CreateOnly => Ok(Some(HashMap::new())),
        }
    }

    fn commit_finished(&self, manager: &Arc<SyncManager>, success: bool) {
        match self {
            CommitCounterpart::Session(session) => session.commit_finished(success),
            CommitCounterpart::Simplified { locker, .. } => manager.clear_short_lock(*locker),
            CommitCounterpart::CreateOnly => {}
        }
    }

    fn lock(&self) -> Option<&EditControl> {
        match self {
            CommitCounterpart::Session(session) => Some(session),
            _ => None,
        }
    }
}

type ConcurrentNotices = Vec<(EditControl, BTreeMap<ItemId, ItemChanges>)>;

impl SyncManager {
    pub(crate) fn run_commit(
        self: &Arc<Self>,
        counterpart: CommitCounterpart,
        commit: Box<dyn EditCommit>,
    ) -> TxHandle<()> {
        let manager = self.clone();
        let commit = Arc::new(Mutex::new(commit));
        self.db().write(move |writer| {
            let notices: Arc<Mutex<ConcurrentNotices>> = Arc::default();
            {
                let manager = manager.clone();
                let counterpart = counterpart.clone();
                let commit = commit.clone();
                let notices = notices.clone();
                writer.finally(move |success| {
                    counterpart.commit_finished(&manager, success);
                    let notices = std::mem::take(&mut *notices.lock());
                    manager.execute(move || {
                        commit.lock().on_commit_finished(success);
                        if success {
                            for (session, changes) in notices {
                                session.notify_concurrent_edit(&changes);
                            }
                        }
                    });
                });
            }

            let Some(bases) = counterpart.prepare_commit(writer)? else {
                return Err(StoreError::Cancelled);
            };
            let outcome = {
                let mut drain = EditDrain::new(writer, &manager, counterpart.lock(), bases);
                commit.lock().perform_commit(&mut drain)?;
                drain.finish()?
            };
            tracing::debug!(icn = writer.icn(), items = ?outcome.items, "edit committed");
            *notices.lock() = outcome.notices;
            manager.auto_merge_now(writer, &outcome.items, counterpart.lock().map(|l| &**l))
        })
    }
}

/// Base snapshot per item: the stored base, or the trunk for items without
/// a pending edit. Missing items are skipped.
pub fn collect_bases(reader: &Reader<'_>, items: &[ItemId]) -> itemdb::Result<HashMap<ItemId, AttributeMap>> {
    let mut bases = HashMap::new();
    for item in items {
        if bases.contains_key(item) {
            continue;
        }
        let base = match reader.shadow(*item, Shadow::Base)? {
            Some(base) => Some(base),
            None => reader.trunk(*item)?,
        };
        if let Some(base) = base {
            bases.insert(*item, base);
        }
    }
    Ok(bases)
}

struct CommitOutcome {
    items: Vec<ItemId>,
    notices: ConcurrentNotices,
}

/// Write access handed to an [`EditCommit`].
///
/// Every change to an existing item first records its base, so the merge
/// engine can later tell the local edit from server changes.
pub struct EditDrain<'w, 'a> {
    writer: &'w mut Writer<'a>,
    manager: &'w Arc<SyncManager>,
    lock: Option<&'w EditControl>,
    bases: HashMap<ItemId, AttributeMap>,
    just_created: HashSet<ItemId>,
    known_unsafe: HashSet<ItemId>,
    changed: BTreeSet<ItemId>,
    concurrent: Vec<(EditControl, BTreeMap<ItemId, AttributeMap>)>,
}

impl<'w, 'a> EditDrain<'w, 'a> {
    fn new(
        writer: &'w mut Writer<'a>,
        manager: &'w Arc<SyncManager>,
        lock: Option<&'w EditControl>,
        bases: HashMap<ItemId, AttributeMap>,
    ) -> Self {
        Self {
            writer,
            manager,
            lock,
            bases,
            just_created: HashSet::new(),
            known_unsafe: HashSet::new(),
            changed: BTreeSet::new(),
            concurrent: Vec::new(),
        }
    }

    pub fn reader(&self) -> &Reader<'a> {
        self.writer.reader()
    }

    /// Creates an item that does not exist on the server yet.
    pub fn create_item(&mut self, values: &AttributeMap) -> itemdb::Result<ItemId> {
        let item = self.writer.new_item()?;
        self.just_created.insert(item);
        self.changed.insert(item);
        if !values.is_empty() {
            self.before_change(item)?;
            self.writer.set_trunk(item, values)?;
        }
        Ok(item)
    }

    /// Creates an item that only ever lives in the replica until uploaded:
    /// its base is the invisible marker from the start.
    pub fn create_local_item(&mut self, values: &AttributeMap) -> itemdb::Result<ItemId> {
        let item = self.writer.new_item()?;
        self.writer
            .set_shadow(item, Shadow::Base, Some(&AttributeMap::invisible()))?;
        self.writer.set_trunk(item, values)?;
        self.changed.insert(item);
        Ok(item)
    }

    pub fn set_value(&mut self, item: ItemId, attr: &str, value: Option<Value>) -> itemdb::Result<()> {
        self.change_item(item)?;
        self.writer.set_value(item, attr, value)
    }

    pub fn set_values(&mut self, item: ItemId, values: &AttributeMap) -> itemdb::Result<()> {
        self.change_item(item)?;
        let mut trunk = self
            .writer
            .trunk(item)?
            .ok_or(StoreError::ItemNotFound(item))?;
        for (attr, value) in values {
            trunk.insert(attr.clone(), value.clone());
        }
        self.writer.set_trunk(item, &trunk)
    }

    pub fn delete(&mut self, item: ItemId) -> itemdb::Result<()> {
        self.set_value(item, INVISIBLE, Some(Value::Bool(true)))
    }

    pub fn revive(&mut self, item: ItemId) -> itemdb::Result<()> {
        self.set_value(item, INVISIBLE, None)
    }

    pub fn add_history(&mut self, item: ItemId, records: &[HistoryRecord]) -> itemdb::Result<()> {
        self.change_item(item)?;
        let history = merge_history(&self.writer.history(item)?, records);
        self.writer.set_history(item, &history)
    }

    /// Accepts the standing conflict: the conflicting server state becomes
    /// the base and the trunk stays as the user left it.
    pub fn mark_merged(&mut self, item: ItemId) -> itemdb::Result<()> {
        if let Some(conflict) = self.writer.shadow(item, Shadow::Conflict)? {
            self.writer.set_shadow(item, Shadow::Base, Some(&conflict))?;
            self.writer.set_shadow(item, Shadow::Conflict, None)?;
        }
        self.change_item(item)
    }

    /// Restores the server state of `root` and its dependents. Items the
    /// server no longer has are cleared. `false` when some item is held by
    /// another session or uploading; the discard is then left to a later
    /// merge.
    pub fn discard_changes(&mut self, root: ItemId) -> itemdb::Result<bool> {
        let subtree = self.writer.subtree(root)?;
        let ignore = self.lock.map(|l| &**l);
        if !self
            .manager
            .lock_or_merge_later(self.writer, &subtree, ignore, &[root])?
        {
            return Ok(false);
        }
        let mut to_clear = BTreeSet::new();
        for item in &subtree {
            let gone = last_server(self.writer.reader(), *item)?.map_or(false, |s| s.is_invisible());
            if gone {
                to_clear.extend(self.writer.subtree(*item)?);
            }
        }
        for item in &to_clear {
            self.writer.clear_item(*item)?;
        }
        for item in &subtree {
            if !to_clear.contains(item) {
                discard_single(self.writer, *item)?;
            }
        }
        self.changed.extend(subtree);
        Ok(true)
    }

    /// Opens an item another live session may hold. That session's editor
    /// is told which attributes changed under it.
    pub fn unsafe_change(&mut self, item: ItemId) -> itemdb::Result<()> {
        self.known_unsafe.insert(item);
        self.change_item(item)
    }

    fn change_item(&mut self, item: ItemId) -> itemdb::Result<()> {
        if !self.writer.exists(item)? {
            return Err(StoreError::ItemNotFound(item));
        }
        self.before_change(item)?;
        self.changed.insert(item);
        Ok(())
    }

    fn before_change(&mut self, item: ItemId) -> itemdb::Result<()> {
        if self.just_created.remove(&item) {
            return self
                .writer
                .set_shadow(item, Shadow::Base, Some(&AttributeMap::invisible()));
        }
        let stored = self.writer.shadow(item, Shadow::Base)?;
        if let Some(base) = self.bases.get(&item) {
            if stored.is_none() {
                let base = base.clone();
                self.writer.set_shadow(item, Shadow::Base, Some(&base))?;
            }
            return Ok(());
        }
        if self.writer.is_removed(item)? {
            // Reviving an item that never reached the server.
            if stored.is_none() {
                self.writer
                    .set_shadow(item, Shadow::Base, Some(&AttributeMap::invisible()))?;
            }
            return Ok(());
        }
        let other = self.base_from_other_session(item)?;
        if stored.is_some() {
            return Ok(());
        }
        let base = match other {
            Some(base) => base,
            None => self
                .writer
                .trunk(item)?
                .ok_or(StoreError::ItemNotFound(item))?,
        };
        self.writer.set_shadow(item, Shadow::Base, Some(&base))
    }

    fn base_from_other_session(&mut self, item: ItemId) -> itemdb::Result<Option<AttributeMap>> {
        let Some(holder) = self.manager.edit_locks().find_lock(item) else {
            return Ok(None);
        };
        if self.lock.map_or(false, |own| Arc::ptr_eq(own, &holder)) {
            return Ok(None);
        }
        if !self.known_unsafe.contains(&item) {
            tracing::warn!(%item, session = %holder.id(), "item held by another session changed");
        }
        let Some(base) = holder.item_base(item) else {
            return Ok(None);
        };
        if let Some(trunk) = self.writer.trunk(item)? {
            let entry = match self
                .concurrent
                .iter_mut()
                .position(|(session, _)| Arc::ptr_eq(session, &holder))
            {
                Some(index) => &mut self.concurrent[index].1,
                None => {
                    self.concurrent.push((holder.clone(), BTreeMap::new()));
                    let last = self.concurrent.len() - 1;
                    &mut self.concurrent[last].1
                }
            };
            entry.entry(item).or_insert(trunk);
        }
        Ok(Some(base))
    }

    fn finish(self) -> itemdb::Result<CommitOutcome> {
        let mut notices = Vec::new();
        for (session, originals) in self.concurrent {
            let mut changes = BTreeMap::new();
            for (item, original) in originals {
                let Some(current) = self.writer.trunk(item)? else {
                    continue;
                };
                let changed = original.changed_attributes(&current);
                if changed.is_empty() {
                    continue;
                }
                let values = changed
                    .iter()
                    .filter_map(|attr| current.get(attr).map(|v| (attr.clone(), v.clone())))
                    .collect();
                changes.insert(item, ItemChanges { changed, values });
            }
            if !changes.is_empty() {
                notices.push((session, changes));
            }
        }
        Ok(CommitOutcome {
            items: self.changed.into_iter().collect(),
            notices,
        })
    }
}

impl EditDrain<'_, '_> {
    /// The edit session this commit runs for, if any.
    pub fn session(&self) -> Option<&EditSession> {
        self.lock.map(|l| &**l)
    }
}
