use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use itemdb::{ItemDb, Reader, TxHandle, Writer};
use items::ItemId;

use crate::automerge::ItemMerge;
use crate::commit::CommitCounterpart;
use crate::event::{record_merged, Listeners};
use crate::scheduler::MergeScheduler;
use crate::upload_locks::{allows_merge, select_not_uploading};
use crate::{
    item_state, CallbackExecutor, ConflictPolicy, EditCommit, EditControl, EditLockTable, EditSession,
    EditStart, ItemState, MergeEvent, MergeListener, PolicySelector, ShortLockerId, StrictPolicy,
    SyncConfig, SyncError, ThreadExecutor, UploadLockTable,
};

const FLUSH_ROUNDS: usize = 64;

#[derive(Default)]
struct StartQueue {
    queue: VecDeque<EditStart>,
    scheduled: bool,
}

/// Short locker of the merges running in one write transaction.
struct MergeLocker(ShortLockerId);

/// Entry point of the edit and merge machinery over one [`ItemDb`].
///
/// Owns the edit and upload lock tables, the merge scheduler and the
/// listener registry. Shared as `Arc<SyncManager>`; sessions keep a handle
/// back to it.
pub struct SyncManager {
    db: ItemDb,
    config: SyncConfig,
    selector: Option<Arc<dyn PolicySelector>>,
    default_policy: Arc<dyn ConflictPolicy>,
    executor: Arc<dyn CallbackExecutor>,
    locks: EditLockTable,
    uploads: UploadLockTable,
    scheduler: MergeScheduler,
    starts: Mutex<StartQueue>,
    listeners: Arc<Listeners>,
}

impl SyncManager {
    pub fn new(
        db: ItemDb,
        selector: Option<Arc<dyn PolicySelector>>,
        executor: Arc<dyn CallbackExecutor>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            selector,
            default_policy: Arc::new(StrictPolicy),
            executor,
            locks: EditLockTable::new(),
            uploads: UploadLockTable::new(),
            scheduler: MergeScheduler::default(),
            starts: Mutex::new(StartQueue::default()),
            listeners: Arc::new(Listeners::default()),
        })
    }

    /// Manager with the strict default policy and a dedicated callback
    /// thread.
    pub fn with_defaults(db: ItemDb, config: SyncConfig) -> crate::Result<Arc<Self>> {
        let executor = ThreadExecutor::spawn(&config.callback_thread_name)?;
        Ok(Self::new(db, None, Arc::new(executor), config))
    }

    pub fn db(&self) -> &ItemDb {
        &self.db
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn edit_locks(&self) -> &EditLockTable {
        &self.locks
    }

    pub fn uploads(&self) -> &UploadLockTable {
        &self.uploads
    }

    /// New session over `items`, or `None` when a live session holds any of
    /// them. Nothing is locked until the session starts.
    pub fn prepare_edit(self: &Arc<Self>, items: &[ItemId]) -> Option<EditControl> {
        if items.is_empty() {
            return None;
        }
        if let Some(holder) = self.locks.find_any_lock(items, None) {
            tracing::debug!(?items, session = %holder.id(), "items already locked");
            return None;
        }
        Some(EditSession::new(self.clone(), items))
    }

    pub fn find_lock(&self, item: ItemId) -> Option<EditControl> {
        self.locks.find_lock(item)
    }

    pub fn find_any_lock(&self, items: &[ItemId]) -> Option<EditControl> {
        self.locks.find_any_lock(items, None)
    }

    /// Commit without locks. Meant for creating items; existing items held
    /// by a session are changed only through `EditDrain::unsafe_change`.
    pub fn commit_edit(self: &Arc<Self>, commit: impl EditCommit + 'static) -> TxHandle<()> {
        self.run_commit(CommitCounterpart::CreateOnly, Box::new(commit))
    }

    /// One-shot commit over `items` without an editor. `None` when a live
    /// session holds any of them.
    pub fn commit_edit_items(
        self: &Arc<Self>,
        items: &[ItemId],
        commit: impl EditCommit + 'static,
    ) -> Option<TxHandle<()>> {
        let locker = self.locks.register_short_locker();
        if let Some(holder) = self.locks.short_lock_all(locker, items, None) {
            tracing::debug!(?items, session = %holder.id(), "simplified commit blocked by edit");
            self.clear_short_lock(locker);
            return None;
        }
        let counterpart = CommitCounterpart::Simplified {
            locker,
            items: items.to_vec(),
        };
        Some(self.run_commit(counterpart, Box::new(commit)))
    }

    /// Schedules a background merge of `items`.
    pub fn request_auto_merge(self: &Arc<Self>, items: &[ItemId]) {
        if self.scheduler.request(items) {
            self.schedule_merge();
        }
    }

    fn schedule_merge(self: &Arc<Self>) {
        let manager = self.clone();
        self.db.write(move |writer| {
            let items = manager.scheduler.take();
            {
                let manager = manager.clone();
                let items = items.clone();
                writer.finally(move |success| {
                    let failed = if success { Vec::new() } else { items };
                    if manager.scheduler.finished(failed) {
                        manager.schedule_merge();
                    }
                });
            }
            tracing::debug!(?items, "scheduled merge");
            manager.auto_merge_now(writer, &items, None)
        });
    }

    pub fn add_listener(&self, listener: Arc<dyn MergeListener>) {
        self.listeners.add(listener);
    }

    /// Stream of `(icn, event)` pairs for async consumers.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<(u64, MergeEvent)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .add(Arc::new(move |icn: u64, event: &MergeEvent| {
                let _ = tx.send((icn, event.clone()));
            }));
        rx
    }

    pub fn can_upload(&self, items: &[ItemId]) -> bool {
        !self.uploads.is_any_locked(items)
    }

    pub fn is_during_upload(&self, item: ItemId) -> bool {
        self.uploads.owner(item).is_some()
    }

    pub fn item_state(&self, item: ItemId) -> TxHandle<ItemState> {
        self.db.read(move |reader| item_state(reader, item))
    }

    /// Waits until queued transactions, edit starts, scheduled merges and
    /// callbacks have settled. Must not be called from the store or callback
    /// thread.
    pub fn flush(&self) -> crate::Result<()> {
        for _ in 0..FLUSH_ROUNDS {
            self.db.read(|_| Ok(())).wait()?;
            let (tx, rx) = bounded(1);
            self.executor.execute(Box::new(move || {
                let _ = tx.send(());
            }));
            rx.recv()
                .map_err(|_| SyncError::Internal("callback executor stopped".to_string()))?;
            if self.scheduler.is_idle() && !self.starts.lock().scheduled {
                return Ok(());
            }
        }
        Err(SyncError::Internal("replica did not settle".to_string()))
    }

    /// `true` when `items` are short-locked for merging in this transaction.
    /// Otherwise `enqueue` is merged later: after the upload of an uploading
    /// item finishes, or when the session holding an item is released.
    pub(crate) fn lock_or_merge_later(
        self: &Arc<Self>,
        writer: &mut Writer<'_>,
        items: &[ItemId],
        ignore: Option<&EditSession>,
        enqueue: &[ItemId],
    ) -> itemdb::Result<bool> {
        if !allows_merge(writer, items, enqueue)? {
            return Ok(false);
        }
        self.try_lock_for_merge_or_defer(writer, items, ignore, enqueue)
    }

    fn try_lock_for_merge_or_defer(
        self: &Arc<Self>,
        writer: &mut Writer<'_>,
        items: &[ItemId],
        ignore: Option<&EditSession>,
        enqueue: &[ItemId],
    ) -> itemdb::Result<bool> {
        let locker = self.merge_locker(writer);
        for _ in 0..self.config.merge_lock_retries.max(1) {
            match self.locks.short_lock_all(locker, items, ignore) {
                None => return Ok(true),
                Some(holder) => {
                    if holder.merge_when_released(enqueue) {
                        tracing::debug!(?enqueue, session = %holder.id(), "merge deferred until release");
                        return Ok(false);
                    }
                }
            }
        }
        tracing::warn!(?items, "items not lockable for merge, rescheduling");
        self.request_auto_merge(enqueue);
        Ok(false)
    }

    fn merge_locker(self: &Arc<Self>, writer: &mut Writer<'_>) -> ShortLockerId {
        if let Some(locker) = writer.cache().get::<MergeLocker>() {
            return locker.0;
        }
        let locker = self.locks.register_short_locker();
        writer.cache().get_or_insert_with(|| MergeLocker(locker));
        let manager = self.clone();
        writer.finally(move |_| manager.clear_short_lock(locker));
        locker
    }

    fn select_mergeable_now_defer_other(
        self: &Arc<Self>,
        writer: &mut Writer<'_>,
        items: &[ItemId],
        ignore: Option<&EditSession>,
    ) -> itemdb::Result<Vec<ItemId>> {
        let mut selected = Vec::new();
        for item in select_not_uploading(writer, items)? {
            if self.try_lock_for_merge_or_defer(writer, &[item], ignore, &[item])? {
                selected.push(item);
            }
        }
        Ok(selected)
    }

    /// Merges `items` inside the current transaction. Items held by another
    /// session or uploading are deferred. Listeners hear about the outcome
    /// once the transaction commits.
    pub(crate) fn auto_merge_now(
        self: &Arc<Self>,
        writer: &mut Writer<'_>,
        items: &[ItemId],
        ignore: Option<&EditSession>,
    ) -> itemdb::Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mergeable = self.select_mergeable_now_defer_other(writer, items, ignore)?;
        let mut event = MergeEvent::new();
        for item in mergeable {
            let merge = ItemMerge {
                manager: self,
                policy: self.policy_for(writer.reader(), item),
                item,
                just_edited: ignore,
            };
            if let Some(outcome) = merge.perform(writer)? {
                event.merge(outcome);
            }
        }
        record_merged(writer, &self.listeners, &self.executor, event);
        Ok(())
    }

    fn policy_for(&self, reader: &Reader<'_>, item: ItemId) -> Arc<dyn ConflictPolicy> {
        self.selector
            .as_ref()
            .and_then(|selector| selector.policy(reader, item))
            .unwrap_or_else(|| self.default_policy.clone())
    }

    pub(crate) fn start_edit(self: &Arc<Self>, start: EditStart) -> bool {
        let session = start.session().clone();
        if !self.locks.lock_edit(&session.items(), &session) {
            tracing::debug!(session = %session.id(), "edit start lost the lock race");
            return false;
        }
        self.add_to_start(vec![start]);
        true
    }

    fn add_to_start(self: &Arc<Self>, starts: Vec<EditStart>) {
        if starts.is_empty() {
            return;
        }
        let schedule = {
            let mut queue = self.starts.lock();
            queue.queue.extend(starts);
            !std::mem::replace(&mut queue.scheduled, true)
        };
        if schedule {
            let manager = self.clone();
            self.db.read(move |reader| manager.run_starts(reader));
        }
    }

    fn poll_start(&self) -> Option<EditStart> {
        let mut queue = self.starts.lock();
        let next = queue.queue.pop_front();
        if next.is_none() {
            queue.scheduled = false;
        }
        next
    }

    fn run_starts(&self, reader: &Reader<'_>) -> itemdb::Result<()> {
        while let Some(start) = self.poll_start() {
            if start.is_released() {
                continue;
            }
            let started = match self.locks.ensure_can_edit(reader, &start) {
                Ok(true) => start.perform_start(reader),
                Ok(false) => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = started {
                tracing::error!(session = %start.session().id(), error = %err, "edit start failed");
                start.session().release();
            }
        }
        Ok(())
    }

    pub(crate) fn do_release(&self, session: &EditSession) {
        self.locks.unlock_all(session);
        self.starts.lock().queue.retain(|start| !start.is_for(session));
    }

    pub(crate) fn clear_short_lock(self: &Arc<Self>, locker: ShortLockerId) {
        let deferred = self.locks.clear_short_locks(locker);
        self.add_to_start(deferred);
    }

    pub(crate) fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.executor.execute(Box::new(f));
    }
}
