use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use itemdb::Reader;
use items::{AttributeMap, ItemId};

use crate::commit::CommitCounterpart;
use crate::{collect_bases, EditCancelled, EditCommit, ItemChanges, SyncManager};

pub type EditControl = Arc<EditSession>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Init,
    Preparing,
    Editing,
    Committing,
    CommitDone,
    Released,
}

/// Produces the editor for a session being started.
pub trait EditorFactory: Send + Sync {
    /// Runs inside a read transaction once the items are locked. `None`
    /// cancels the edit.
    fn prepare_edit(
        &self,
        reader: &Reader<'_>,
        prepare: &mut dyn EditPrepare,
    ) -> itemdb::Result<Option<Arc<dyn ItemEditor>>>;

    fn edit_cancelled(&self) {}
}

pub trait ItemEditor: Send + Sync {
    fn is_alive(&self) -> bool {
        true
    }

    fn show_editor(&self) -> Result<(), EditCancelled> {
        Ok(())
    }

    fn on_edit_released(&self) {}

    /// Another commit changed items this editor holds.
    fn on_items_changed(&self, _changes: &BTreeMap<ItemId, ItemChanges>) {}
}

/// What a factory sees while preparing an edit.
pub trait EditPrepare {
    fn items(&self) -> Vec<ItemId>;

    fn control(&self) -> EditControl;

    /// Locks more items for the session being prepared.
    fn add_items(&mut self, items: &[ItemId]) -> itemdb::Result<bool>;
}

struct SessionInner {
    state: SessionState,
    items: BTreeSet<ItemId>,
    bases: HashMap<ItemId, AttributeMap>,
    merge_when_released: BTreeSet<ItemId>,
    editor: Option<Arc<dyn ItemEditor>>,
    pending_factory: Option<Arc<dyn EditorFactory>>,
}

/// One logical edit over a set of locked items.
///
/// Lifecycle: `Init -> Preparing -> Editing -> Committing -> CommitDone`,
/// back to `Editing` when a commit fails, and `Released` from any state but
/// `Committing`.
pub struct EditSession {
    id: Uuid,
    manager: Arc<SyncManager>,
    inner: Mutex<SessionInner>,
}

impl fmt::Debug for EditSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EditSession")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("items", &inner.items)
            .finish()
    }
}

impl EditSession {
    pub(crate) fn new(manager: Arc<SyncManager>, items: &[ItemId]) -> EditControl {
        Arc::new(Self {
            id: Uuid::new_v4(),
            manager,
            inner: Mutex::new(SessionInner {
                state: SessionState::Init,
                items: items.iter().copied().collect(),
                bases: HashMap::new(),
                merge_when_released: BTreeSet::new(),
                editor: None,
                pending_factory: None,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn items(&self) -> Vec<ItemId> {
        self.inner.lock().items.iter().copied().collect()
    }

    /// Locks the items and queues the factory. `false` if the session was
    /// already started or the items are held by another session.
    pub fn start(self: &Arc<Self>, factory: Arc<dyn EditorFactory>) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Init {
                return false;
            }
            inner.state = SessionState::Preparing;
            inner.pending_factory = Some(factory.clone());
        }
        let started = self.manager.start_edit(EditStart {
            session: self.clone(),
            factory,
        });
        if !started {
            self.release();
        }
        started
    }

    /// Writes the edit. The session is released once the commit succeeds and
    /// goes back to editing when it fails.
    pub fn commit(self: &Arc<Self>, commit: impl EditCommit + 'static) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Editing {
                return false;
            }
            inner.state = SessionState::Committing;
        }
        self.manager
            .run_commit(CommitCounterpart::Session(self.clone()), Box::new(commit));
        true
    }

    /// Adds more items to an editing session. The extra items are locked by
    /// a temporary session whose locks are handed over.
    pub fn include(self: &Arc<Self>, items: &[ItemId], factory: Arc<dyn EditorFactory>) -> bool {
        if self.state() != SessionState::Editing {
            return false;
        }
        let Some(source) = self.manager.prepare_edit(items) else {
            return false;
        };
        source.start(Arc::new(InclusionFactory {
            target: self.clone(),
            loader: factory,
            loader_cancelled: Mutex::new(None),
        }))
    }

    /// Idempotent. Does nothing while a commit is running.
    pub fn release(&self) {
        let (to_merge, editor, factory) = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Committing | SessionState::Released => return,
                _ => {}
            }
            inner.state = SessionState::Released;
            (
                std::mem::take(&mut inner.merge_when_released),
                inner.editor.take(),
                inner.pending_factory.take(),
            )
        };
        tracing::debug!(session = %self.id, "edit session released");
        let to_merge: Vec<ItemId> = to_merge.into_iter().collect();
        self.manager.request_auto_merge(&to_merge);
        self.manager.do_release(self);
        if let Some(editor) = editor {
            self.manager.execute(move || editor.on_edit_released());
        }
        if let Some(factory) = factory {
            factory.edit_cancelled();
        }
    }

    pub fn is_alive(&self) -> bool {
        let (state, editor) = {
            let inner = self.inner.lock();
            (inner.state, inner.editor.clone())
        };
        match state {
            SessionState::Init | SessionState::CommitDone | SessionState::Released => false,
            SessionState::Preparing | SessionState::Committing => true,
            SessionState::Editing => match editor {
                Some(editor) => editor.is_alive(),
                None => {
                    self.release();
                    false
                }
            },
        }
    }

    pub fn is_preparing(&self) -> bool {
        self.state() == SessionState::Preparing
    }

    pub fn is_released(&self) -> bool {
        self.state() == SessionState::Released
    }

    /// Base snapshot captured when `item` was locked.
    pub fn item_base(&self, item: ItemId) -> Option<AttributeMap> {
        self.inner.lock().bases.get(&item).cloned()
    }

    /// Parks `items` for a merge after release. `false` if already released.
    pub(crate) fn merge_when_released(&self, items: &[ItemId]) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Released {
            return false;
        }
        inner.merge_when_released.extend(items.iter().copied());
        true
    }

    pub(crate) fn prepare_commit(&self) -> Option<HashMap<ItemId, AttributeMap>> {
        let bases = {
            let inner = self.inner.lock();
            (inner.state == SessionState::Committing).then(|| inner.bases.clone())
        };
        if bases.is_none() {
            self.release();
        }
        bases
    }

    pub(crate) fn commit_finished(&self, success: bool) {
        let settled = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Committing {
                inner.state = if success {
                    SessionState::CommitDone
                } else {
                    SessionState::Editing
                };
                true
            } else {
                false
            }
        };
        if !settled {
            tracing::error!(session = %self.id, "commit finished outside of committing state");
        }
        if success || !settled {
            self.release();
        }
    }

    fn before_start(&self, reader: &Reader<'_>) -> itemdb::Result<bool> {
        let state = self.state();
        if state != SessionState::Preparing {
            if state != SessionState::Released {
                tracing::error!(session = %self.id, ?state, "edit start in wrong state");
            }
            self.release();
            return Ok(false);
        }
        let items = self.items();
        self.collect_bases(reader, &items)?;
        Ok(true)
    }

    fn collect_bases(&self, reader: &Reader<'_>, items: &[ItemId]) -> itemdb::Result<()> {
        let missing: Vec<ItemId> = {
            let inner = self.inner.lock();
            items
                .iter()
                .copied()
                .filter(|item| !inner.bases.contains_key(item))
                .collect()
        };
        let bases = collect_bases(reader, &missing)?;
        let mut inner = self.inner.lock();
        for (item, base) in bases {
            inner.bases.entry(item).or_insert(base);
        }
        Ok(())
    }

    fn add_items(self: &Arc<Self>, reader: &Reader<'_>, items: &[ItemId]) -> itemdb::Result<bool> {
        if items.is_empty() {
            return Ok(true);
        }
        if !self.manager.edit_locks().lock_edit(items, self) {
            return Ok(false);
        }
        self.collect_bases(reader, items)?;
        Ok(true)
    }

    fn after_start(self: &Arc<Self>, editor: Arc<dyn ItemEditor>) {
        let session = self.clone();
        self.manager.execute(move || {
            if session.state() != SessionState::Preparing {
                session.release();
                editor.on_edit_released();
                return;
            }
            if let Err(err) = editor.show_editor() {
                tracing::warn!(session = %session.id, error = %err, "editor not shown");
                session.release();
                editor.on_edit_released();
                return;
            }
            let accepted = {
                let mut inner = session.inner.lock();
                if inner.state == SessionState::Preparing && inner.editor.is_none() {
                    inner.editor = Some(editor.clone());
                    inner.pending_factory = None;
                    inner.state = SessionState::Editing;
                    true
                } else {
                    false
                }
            };
            if !accepted {
                session.release();
                editor.on_edit_released();
            }
        });
    }

    /// Records newly locked items. `false` while committing.
    pub(crate) fn items_locked(&self, items: &[ItemId]) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Committing {
            return false;
        }
        inner.items.extend(items.iter().copied());
        true
    }

    /// Gives up items whose locks are being handed over. Only while
    /// preparing.
    pub(crate) fn remove_items(&self, items: &[ItemId]) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Preparing {
            return false;
        }
        for item in items {
            inner.items.remove(item);
        }
        true
    }

    fn forget_items(&self, items: &[ItemId]) {
        let mut inner = self.inner.lock();
        for item in items {
            inner.items.remove(item);
            inner.bases.remove(item);
        }
    }

    pub(crate) fn notify_concurrent_edit(&self, changes: &BTreeMap<ItemId, ItemChanges>) {
        let editor = {
            let inner = self.inner.lock();
            if inner.state != SessionState::Editing {
                return;
            }
            inner.editor.clone()
        };
        if let Some(editor) = editor {
            editor.on_items_changed(changes);
        }
    }
}

/// A started session waiting for its preparation transaction.
#[derive(Clone)]
pub struct EditStart {
    session: EditControl,
    factory: Arc<dyn EditorFactory>,
}

impl EditStart {
    pub fn session(&self) -> &EditControl {
        &self.session
    }

    pub fn is_released(&self) -> bool {
        self.session.is_released()
    }

    pub(crate) fn is_for(&self, session: &EditSession) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.session), session)
    }

    pub(crate) fn perform_start(&self, reader: &Reader<'_>) -> itemdb::Result<()> {
        if !self.session.before_start(reader)? {
            return Ok(());
        }
        let mut prepare = StartPrepare {
            reader,
            session: self.session.clone(),
        };
        match self.factory.prepare_edit(reader, &mut prepare)? {
            Some(editor) => self.session.after_start(editor),
            None => self.session.release(),
        }
        Ok(())
    }
}

struct StartPrepare<'r, 'a> {
    reader: &'r Reader<'a>,
    session: EditControl,
}

impl EditPrepare for StartPrepare<'_, '_> {
    fn items(&self) -> Vec<ItemId> {
        self.session.items()
    }

    fn control(&self) -> EditControl {
        self.session.clone()
    }

    fn add_items(&mut self, items: &[ItemId]) -> itemdb::Result<bool> {
        let current = self.session.items();
        let extra: Vec<ItemId> = items.iter().copied().filter(|i| !current.contains(i)).collect();
        self.session.add_items(self.reader, &extra)
    }
}

/// Factory of the temporary session that locks items for
/// [`EditSession::include`].
struct InclusionFactory {
    target: EditControl,
    loader: Arc<dyn EditorFactory>,
    /// `Some(false)` once the loader runs, `Some(true)` once cancelled.
    loader_cancelled: Mutex<Option<bool>>,
}

impl InclusionFactory {
    fn include(&self, reader: &Reader<'_>, source: &EditControl, items: Vec<ItemId>) -> itemdb::Result<()> {
        let target = &self.target;
        if target.state() != SessionState::Editing {
            return Ok(());
        }
        let current = target.items();
        let items: Vec<ItemId> = items.into_iter().filter(|i| !current.contains(i)).collect();
        if !target.manager.edit_locks().include_lock(target, &items, Some(source)) {
            return Ok(());
        }
        target.collect_bases(reader, &items)?;
        {
            let mut cancelled = self.loader_cancelled.lock();
            if cancelled.is_some() {
                return Ok(());
            }
            *cancelled = Some(false);
        }
        let mut inclusion = InclusionPrepare {
            reader,
            target: target.clone(),
            items: items.iter().copied().collect(),
        };
        match self.loader.prepare_edit(reader, &mut inclusion)? {
            Some(editor) => target.manager.execute(move || editor.on_edit_released()),
            None => {
                let added: Vec<ItemId> = inclusion.items.into_iter().collect();
                target.forget_items(&added);
                target.manager.edit_locks().unlock(&added, target);
            }
        }
        Ok(())
    }
}

impl EditorFactory for InclusionFactory {
    fn prepare_edit(
        &self,
        reader: &Reader<'_>,
        prepare: &mut dyn EditPrepare,
    ) -> itemdb::Result<Option<Arc<dyn ItemEditor>>> {
        let source = prepare.control();
        let result = self.include(reader, &source, prepare.items());
        source.release();
        result.map(|_| None)
    }

    fn edit_cancelled(&self) {
        let mut cancelled = self.loader_cancelled.lock();
        if cancelled.is_none() {
            *cancelled = Some(true);
            drop(cancelled);
            self.loader.edit_cancelled();
        }
    }
}

struct InclusionPrepare<'r, 'a> {
    reader: &'r Reader<'a>,
    target: EditControl,
    items: BTreeSet<ItemId>,
}

impl EditPrepare for InclusionPrepare<'_, '_> {
    fn items(&self) -> Vec<ItemId> {
        self.items.iter().copied().collect()
    }

    fn control(&self) -> EditControl {
        self.target.clone()
    }

    fn add_items(&mut self, items: &[ItemId]) -> itemdb::Result<bool> {
        let current = self.target.items();
        let extra: Vec<ItemId> = items.iter().copied().filter(|i| !current.contains(i)).collect();
        if extra.is_empty() {
            return Ok(true);
        }
        let added = self.target.add_items(self.reader, &extra)?;
        if added {
            self.items.extend(extra);
        }
        Ok(added)
    }
}
