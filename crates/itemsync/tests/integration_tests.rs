use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use itemdb::{ItemDb, Reader};
use itemsync::*;
use items::{AttributeMap, ItemId, Shadow, SyncState, MASTER};

#[derive(Default)]
struct TestEditor {
    dead: AtomicBool,
    released: AtomicUsize,
    changes: Mutex<Vec<BTreeMap<ItemId, ItemChanges>>>,
}

impl ItemEditor for TestEditor {
    fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    fn on_edit_released(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn on_items_changed(&self, changes: &BTreeMap<ItemId, ItemChanges>) {
        self.changes.lock().push(changes.clone());
    }
}

struct TestFactory {
    editor: Arc<TestEditor>,
    cancelled: AtomicBool,
}

impl TestFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            editor: Arc::new(TestEditor::default()),
            cancelled: AtomicBool::new(false),
        })
    }
}

impl EditorFactory for TestFactory {
    fn prepare_edit(
        &self,
        _reader: &Reader<'_>,
        _prepare: &mut dyn EditPrepare,
    ) -> itemdb::Result<Option<Arc<dyn ItemEditor>>> {
        Ok(Some(self.editor.clone() as Arc<dyn ItemEditor>))
    }

    fn edit_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct NotifyingCommit {
    inner: AttributeCommit,
    done: Sender<bool>,
}

impl EditCommit for NotifyingCommit {
    fn perform_commit(&mut self, drain: &mut EditDrain<'_, '_>) -> itemdb::Result<()> {
        self.inner.perform_commit(drain)
    }

    fn on_commit_finished(&mut self, success: bool) {
        let _ = self.done.send(success);
    }
}

fn manager() -> Arc<SyncManager> {
    let db = ItemDb::open_in_memory().unwrap();
    SyncManager::new(db, None, Arc::new(ImmediateExecutor), SyncConfig::default())
}

fn events(manager: &Arc<SyncManager>) -> Receiver<(u64, MergeEvent)> {
    let (tx, rx) = unbounded();
    manager.add_listener(Arc::new(move |icn: u64, event: &MergeEvent| {
        let _ = tx.send((icn, event.clone()));
    }));
    rx
}

fn last_state(rx: &Receiver<(u64, MergeEvent)>, item: ItemId) -> Option<SyncState> {
    rx.try_iter().filter_map(|(_, event)| event.state(item)).last()
}

fn attrs(pairs: &[(&str, &str)]) -> AttributeMap {
    pairs
        .iter()
        .fold(AttributeMap::new(), |map, (attr, value)| map.with(*attr, *value))
}

fn create_synced(manager: &Arc<SyncManager>, values: AttributeMap) -> ItemId {
    manager
        .write_downloaded(move |drain| drain.create_item(&values))
        .wait()
        .unwrap()
}

fn download(manager: &Arc<SyncManager>, item: ItemId, values: AttributeMap) {
    manager
        .write_downloaded(move |drain| drain.write_server(item, &values))
        .wait()
        .unwrap();
    manager.flush().unwrap();
}

fn edit(manager: &Arc<SyncManager>, item: ItemId, attr: &str, value: &str) {
    manager
        .commit_edit_items(&[item], AttributeCommit::new().set(item, attr, value))
        .expect("items not locked")
        .wait()
        .unwrap();
    manager.flush().unwrap();
}

fn trunk(manager: &Arc<SyncManager>, item: ItemId) -> Option<AttributeMap> {
    manager.db().read(move |r| r.trunk(item)).wait().unwrap()
}

fn shadow(manager: &Arc<SyncManager>, item: ItemId, shadow: Shadow) -> Option<AttributeMap> {
    manager.db().read(move |r| r.shadow(item, shadow)).wait().unwrap()
}

fn state(manager: &Arc<SyncManager>, item: ItemId) -> ItemState {
    manager.item_state(item).wait().unwrap()
}

fn start_editing(manager: &Arc<SyncManager>, items: &[ItemId]) -> (EditControl, Arc<TestFactory>) {
    let session = manager.prepare_edit(items).expect("items free");
    let factory = TestFactory::new();
    assert!(session.start(factory.clone()));
    manager.flush().unwrap();
    assert_eq!(session.state(), SessionState::Editing);
    (session, factory)
}

#[test]
fn test_conflicting_server_change_keeps_local_edit() {
    let manager = manager();
    let rx = events(&manager);
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    edit(&manager, item, "title", "b");
    assert_eq!(last_state(&rx, item), Some(SyncState::Edited));

    download(&manager, item, attrs(&[("title", "c")]));

    assert_eq!(last_state(&rx, item), Some(SyncState::Conflict));
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "b")])));
    assert_eq!(shadow(&manager, item, Shadow::Conflict), Some(attrs(&[("title", "c")])));
    assert_eq!(shadow(&manager, item, Shadow::Base), Some(attrs(&[("title", "a")])));
    assert!(shadow(&manager, item, Shadow::Download).is_none());
    assert_eq!(state(&manager, item), ItemState::Conflict);
}

#[test]
fn test_server_change_without_local_edit_is_adopted() {
    let manager = manager();
    let rx = events(&manager);
    let item = create_synced(&manager, attrs(&[("title", "a")]));

    download(&manager, item, attrs(&[("title", "c")]));

    assert_eq!(last_state(&rx, item), Some(SyncState::Sync));
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "c")])));
    assert!(shadow(&manager, item, Shadow::Base).is_none());
    assert_eq!(state(&manager, item), ItemState::Sync);
}

#[test]
fn test_resolving_policy_merges_both_sides() {
    let db = ItemDb::open_in_memory().unwrap();
    let policy: Arc<dyn ConflictPolicy> = Arc::new(StrategyPolicy::new(ResolutionStrategy::PreferLocal));
    let manager = SyncManager::new(
        db,
        Some(Arc::new(FixedPolicy(policy)) as Arc<dyn PolicySelector>),
        Arc::new(ImmediateExecutor),
        SyncConfig::default(),
    );
    let rx = events(&manager);
    let item = create_synced(&manager, attrs(&[("title", "a"), ("owner", "x")]));
    edit(&manager, item, "title", "b");

    download(&manager, item, attrs(&[("title", "c"), ("owner", "y")]));

    assert_eq!(last_state(&rx, item), Some(SyncState::Edited));
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "b"), ("owner", "y")])));
    assert_eq!(shadow(&manager, item, Shadow::Base), Some(attrs(&[("title", "c"), ("owner", "y")])));
    assert!(shadow(&manager, item, Shadow::Conflict).is_none());
}

#[test]
fn test_overlapping_sessions_lock_exclusively() {
    let manager = manager();
    let one = create_synced(&manager, attrs(&[("n", "1")]));
    let two = create_synced(&manager, attrs(&[("n", "2")]));
    let three = create_synced(&manager, attrs(&[("n", "3")]));

    let first = manager.prepare_edit(&[one, two]).unwrap();
    let second = manager.prepare_edit(&[two, three]).unwrap();
    assert!(first.start(TestFactory::new()));
    assert!(!second.start(TestFactory::new()));
    manager.flush().unwrap();

    assert_eq!(second.state(), SessionState::Released);
    assert!(manager.find_lock(three).is_none());
    assert!(Arc::ptr_eq(&manager.find_lock(one).unwrap(), &first));
    assert!(Arc::ptr_eq(&manager.find_lock(two).unwrap(), &first));
    assert!(manager.prepare_edit(&[two, three]).is_none());

    first.release();
    assert!(manager.find_any_lock(&[one, two, three]).is_none());
    assert!(manager.prepare_edit(&[two, three]).is_some());
}

#[test]
fn test_release_is_idempotent() {
    let manager = manager();
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    let (session, factory) = start_editing(&manager, &[item]);

    session.release();
    session.release();
    manager.flush().unwrap();

    assert_eq!(session.state(), SessionState::Released);
    assert!(manager.find_lock(item).is_none());
    assert_eq!(factory.editor.released.load(Ordering::SeqCst), 1);
    assert!(!session.commit(AttributeCommit::new().set(item, "title", "b")));
}

#[test]
fn test_session_commit_records_base_and_releases() {
    let manager = manager();
    let rx = events(&manager);
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    let (session, factory) = start_editing(&manager, &[item]);

    let (done_tx, done_rx) = unbounded();
    assert!(session.commit(NotifyingCommit {
        inner: AttributeCommit::new().set(item, "title", "b"),
        done: done_tx,
    }));
    manager.flush().unwrap();

    assert_eq!(done_rx.try_recv(), Ok(true));
    assert_eq!(session.state(), SessionState::Released);
    assert!(manager.find_lock(item).is_none());
    assert_eq!(factory.editor.released.load(Ordering::SeqCst), 1);
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "b")])));
    assert_eq!(shadow(&manager, item, Shadow::Base), Some(attrs(&[("title", "a")])));
    assert_eq!(last_state(&rx, item), Some(SyncState::Edited));
    assert_eq!(state(&manager, item), ItemState::Edited);
}

#[test]
fn test_failed_commit_returns_to_editing() {
    let manager = manager();
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    let (session, _factory) = start_editing(&manager, &[item]);

    assert!(session.commit(commit_with(|drain| {
        drain.set_value(ItemId(9999), "title", Some(Value::from("x")))
    })));
    manager.flush().unwrap();

    assert_eq!(session.state(), SessionState::Editing);
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "a")])));
    session.release();
}

#[test]
fn test_remerge_is_idempotent() {
    let manager = manager();
    let rx = events(&manager);
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    download(&manager, item, attrs(&[("title", "c")]));
    let _ = rx.try_iter().count();

    manager.request_auto_merge(&[item]);
    manager.flush().unwrap();
    manager.request_auto_merge(&[item]);
    manager.flush().unwrap();

    let states: Vec<SyncState> = rx.try_iter().filter_map(|(_, e)| e.state(item)).collect();
    assert_eq!(states, vec![SyncState::Sync, SyncState::Sync]);
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "c")])));
    assert!(shadow(&manager, item, Shadow::Base).is_none());
}

#[test]
fn test_download_while_editing_turns_into_conflict_on_commit() {
    let manager = manager();
    let rx = events(&manager);
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    let (session, _factory) = start_editing(&manager, &[item]);

    download(&manager, item, attrs(&[("title", "c")]));
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "a")])));
    assert_eq!(shadow(&manager, item, Shadow::Download), Some(attrs(&[("title", "c")])));
    assert_eq!(last_state(&rx, item), None);

    assert!(session.commit(AttributeCommit::new().set(item, "title", "b")));
    manager.flush().unwrap();

    assert_eq!(last_state(&rx, item), Some(SyncState::Conflict));
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "b")])));
    assert_eq!(shadow(&manager, item, Shadow::Conflict), Some(attrs(&[("title", "c")])));
}

#[test]
fn test_download_merges_after_session_release() {
    let manager = manager();
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    let (session, _factory) = start_editing(&manager, &[item]);
    download(&manager, item, attrs(&[("title", "c")]));

    session.release();
    manager.flush().unwrap();

    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "c")])));
    assert!(shadow(&manager, item, Shadow::Download).is_none());
}

#[test]
fn test_dead_editor_loses_its_locks() {
    let manager = manager();
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    let (session, factory) = start_editing(&manager, &[item]);

    factory.editor.dead.store(true, Ordering::SeqCst);
    let next = manager.prepare_edit(&[item]);

    assert!(next.is_some());
    assert_eq!(session.state(), SessionState::Released);
    assert!(manager.find_lock(item).is_none());
}

#[test]
fn test_include_transfers_locks() {
    let manager = manager();
    let one = create_synced(&manager, attrs(&[("n", "1")]));
    let two = create_synced(&manager, attrs(&[("n", "2")]));
    let (session, _factory) = start_editing(&manager, &[one]);

    assert!(session.include(&[two], TestFactory::new()));
    manager.flush().unwrap();

    assert_eq!(session.items(), vec![one, two]);
    assert!(Arc::ptr_eq(&manager.find_lock(two).unwrap(), &session));
    assert_eq!(session.item_base(two), Some(attrs(&[("n", "2")])));

    session.release();
    assert!(manager.find_any_lock(&[one, two]).is_none());
}

#[test]
fn test_include_fails_for_items_of_other_session() {
    let manager = manager();
    let one = create_synced(&manager, attrs(&[("n", "1")]));
    let two = create_synced(&manager, attrs(&[("n", "2")]));
    let (session, _f1) = start_editing(&manager, &[one]);
    let (other, _f2) = start_editing(&manager, &[two]);

    assert!(!session.include(&[two], TestFactory::new()));
    assert_eq!(session.items(), vec![one]);
    assert!(Arc::ptr_eq(&manager.find_lock(two).unwrap(), &other));
}

#[test]
fn test_simplified_commit_blocked_by_edit_lock() {
    let manager = manager();
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    let (session, _factory) = start_editing(&manager, &[item]);

    assert!(manager
        .commit_edit_items(&[item], AttributeCommit::new().set(item, "title", "b"))
        .is_none());

    session.release();
    assert!(manager
        .commit_edit_items(&[item], AttributeCommit::new().set(item, "title", "b"))
        .is_some());
}

#[test]
fn test_delete_and_discard() {
    let manager = manager();
    let item = create_synced(&manager, attrs(&[("title", "a")]));

    manager
        .commit_edit_items(&[item], AttributeCommit::new().delete(item))
        .unwrap()
        .wait()
        .unwrap();
    manager.flush().unwrap();
    assert_eq!(state(&manager, item), ItemState::LocalDelete);

    manager
        .commit_edit_items(&[item], commit_with(move |drain| drain.discard_changes(item).map(|_| ())))
        .unwrap()
        .wait()
        .unwrap();
    manager.flush().unwrap();
    assert_eq!(state(&manager, item), ItemState::Sync);
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "a")])));
}

#[test]
fn test_new_item_deleted_before_upload_disappears() {
    let manager = manager();
    let rx = events(&manager);
    let created: Arc<Mutex<Option<ItemId>>> = Arc::default();
    let slot = created.clone();
    manager
        .commit_edit(commit_with(move |drain| {
            *slot.lock() = Some(drain.create_item(&attrs(&[("title", "new")]))?);
            Ok(())
        }))
        .wait()
        .unwrap();
    manager.flush().unwrap();
    let item = created.lock().unwrap();
    assert_eq!(state(&manager, item), ItemState::New);

    manager
        .commit_edit_items(&[item], AttributeCommit::new().delete(item))
        .unwrap()
        .wait()
        .unwrap();
    manager.flush().unwrap();

    assert_eq!(last_state(&rx, item), Some(SyncState::Deleted));
    assert!(trunk(&manager, item).is_none());
}

#[test]
fn test_unsafe_change_notifies_holding_editor() {
    let manager = manager();
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    let (session, factory) = start_editing(&manager, &[item]);

    manager
        .commit_edit(commit_with(move |drain| {
            drain.unsafe_change(item)?;
            drain.set_value(item, "title", Some(Value::from("z")))
        }))
        .wait()
        .unwrap();
    manager.flush().unwrap();

    let changes = factory.editor.changes.lock().clone();
    assert_eq!(changes.len(), 1);
    let change = &changes[0][&item];
    assert!(change.changed.contains("title"));
    assert_eq!(change.values.get("title"), Some(&Value::from("z")));
    assert_eq!(shadow(&manager, item, Shadow::Base), Some(attrs(&[("title", "a")])));
    session.release();
}

struct ScriptedUploader<F> {
    items: Vec<ItemId>,
    upload: F,
}

impl<F> ItemUploader for ScriptedUploader<F>
where
    F: FnMut(&UploadProcess) -> itemsync::Result<()> + Send,
{
    fn prepare_upload(&mut self, prepare: &mut UploadPrepare<'_, '_>) -> itemdb::Result<()> {
        prepare.add_all_to_upload(&self.items)?;
        Ok(())
    }

    fn do_upload(&mut self, process: &UploadProcess) -> itemsync::Result<()> {
        (self.upload)(process)
    }
}

#[test]
fn test_partial_upload_keeps_unsent_local_change() {
    let manager = manager();
    let rx = events(&manager);
    let item = create_synced(&manager, attrs(&[("status", "open"), ("owner", "x")]));
    edit(&manager, item, "status", "closed");
    edit(&manager, item, "owner", "y");

    let claimed = manager
        .sync_upload(ScriptedUploader {
            items: vec![item],
            upload: move |process: &UploadProcess| {
                process.finish_upload(item, &["status"], 0).wait()?;
                Ok(())
            },
        })
        .unwrap();
    manager.flush().unwrap();

    assert_eq!(claimed, vec![item]);
    assert_eq!(last_state(&rx, item), Some(SyncState::Edited));
    assert_eq!(
        shadow(&manager, item, Shadow::Base),
        Some(attrs(&[("status", "closed"), ("owner", "x")]))
    );
    assert_eq!(trunk(&manager, item), Some(attrs(&[("status", "closed"), ("owner", "y")])));
    assert!(shadow(&manager, item, Shadow::DoneUpload).is_none());
    assert!(!manager.is_during_upload(item));
}

#[test]
fn test_no_merge_while_uploading() {
    let manager = manager();
    let item = create_synced(&manager, attrs(&[("status", "open")]));
    edit(&manager, item, "status", "closed");

    let observer = manager.clone();
    manager
        .sync_upload(ScriptedUploader {
            items: vec![item],
            upload: move |process: &UploadProcess| {
                assert!(observer.is_during_upload(item));
                assert!(!observer.can_upload(&[item]));
                download(&observer, item, attrs(&[("status", "rejected")]));
                assert_eq!(trunk(&observer, item), Some(attrs(&[("status", "closed")])));
                process.set_all_done(item).wait()?;
                Ok(())
            },
        })
        .unwrap();
    manager.flush().unwrap();

    assert_eq!(trunk(&manager, item), Some(attrs(&[("status", "rejected")])));
    assert_eq!(state(&manager, item), ItemState::Sync);
    assert!(manager.can_upload(&[item]));
}

#[test]
fn test_edit_during_upload_of_new_item() {
    let manager = manager();
    let created: Arc<Mutex<Option<ItemId>>> = Arc::default();
    let slot = created.clone();
    manager
        .commit_edit(commit_with(move |drain| {
            *slot.lock() = Some(drain.create_item(&attrs(&[("title", "a")]))?);
            Ok(())
        }))
        .wait()
        .unwrap();
    manager.flush().unwrap();
    let item = created.lock().unwrap();

    let editor = manager.clone();
    manager
        .sync_upload(ScriptedUploader {
            items: vec![item],
            upload: move |process: &UploadProcess| {
                edit(&editor, item, "title", "b");
                process.finish_upload(item, &["title"], 0).wait()?;
                Ok(())
            },
        })
        .unwrap();
    manager.flush().unwrap();

    assert_eq!(state(&manager, item), ItemState::Edited);
    assert_eq!(shadow(&manager, item, Shadow::Base), Some(attrs(&[("title", "a")])));
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "b")])));
}

#[test]
fn test_failed_upload_cancels_claims() {
    let manager = manager();
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    edit(&manager, item, "title", "b");

    let result = manager.sync_upload(ScriptedUploader {
        items: vec![item],
        upload: |_: &UploadProcess| Err(SyncError::Upload("connection reset".to_string())),
    });
    manager.flush().unwrap();

    assert!(matches!(result, Err(SyncError::Upload(_))));
    assert!(!manager.is_during_upload(item));
    assert!(shadow(&manager, item, Shadow::UploadTask).is_none());
    assert_eq!(state(&manager, item), ItemState::Edited);
}

#[test]
fn test_failed_upload_keeps_claims_until_cancel_settles() {
    let manager = manager();
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    edit(&manager, item, "title", "b");

    let (gate_tx, gate_rx) = unbounded::<()>();
    let store = manager.clone();
    let result = manager.sync_upload(ScriptedUploader {
        items: vec![item],
        upload: move |_: &UploadProcess| {
            let gate_rx = gate_rx.clone();
            store.db().read(move |_| {
                let _ = gate_rx.recv();
                Ok(())
            });
            Err(SyncError::Upload("timed out".to_string()))
        },
    });

    assert!(matches!(result, Err(SyncError::Upload(_))));
    assert!(manager.is_during_upload(item));
    assert!(!manager.can_upload(&[item]));

    gate_tx.send(()).unwrap();
    manager.flush().unwrap();
    assert!(!manager.is_during_upload(item));
    assert!(shadow(&manager, item, Shadow::UploadTask).is_none());
    assert_eq!(state(&manager, item), ItemState::Edited);
}

struct FailingPreparation {
    items: Vec<ItemId>,
}

impl ItemUploader for FailingPreparation {
    fn prepare_upload(&mut self, prepare: &mut UploadPrepare<'_, '_>) -> itemdb::Result<()> {
        assert!(prepare.add_all_to_upload(&self.items)?);
        Err(itemdb::StoreError::Cancelled)
    }

    fn do_upload(&mut self, _process: &UploadProcess) -> itemsync::Result<()> {
        unreachable!("preparation failed")
    }
}

#[test]
fn test_failed_preparation_releases_claims() {
    let manager = manager();
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    edit(&manager, item, "title", "b");

    let result = manager.sync_upload(FailingPreparation { items: vec![item] });

    assert!(matches!(result, Err(SyncError::Store(_))));
    assert!(!manager.is_during_upload(item));
    assert!(shadow(&manager, item, Shadow::UploadTask).is_none());
    assert!(manager.can_upload(&[item]));
}

fn create_dependent(manager: &Arc<SyncManager>, master: ItemId, title: &str) -> ItemId {
    create_synced(manager, attrs(&[("title", title)]).with(MASTER, master.0))
}

#[test]
fn test_server_delete_removes_item() {
    let manager = manager();
    let rx = events(&manager);
    let item = create_synced(&manager, attrs(&[("title", "a")]));

    download(&manager, item, AttributeMap::invisible());

    assert_eq!(last_state(&rx, item), Some(SyncState::Deleted));
    assert!(trunk(&manager, item).is_none());
    assert!(shadow(&manager, item, Shadow::Download).is_none());
}

#[test]
fn test_server_delete_removes_dependents() {
    let manager = manager();
    let rx = events(&manager);
    let root = create_synced(&manager, attrs(&[("title", "root")]));
    let child = create_dependent(&manager, root, "child");
    let grandchild = create_dependent(&manager, child, "grandchild");
    let unrelated = create_synced(&manager, attrs(&[("title", "other")]));

    download(&manager, root, AttributeMap::invisible());

    let event = rx.try_iter().map(|(_, event)| event).last().unwrap();
    assert_eq!(event.state(root), Some(SyncState::Deleted));
    assert_eq!(event.state(child), Some(SyncState::Sync));
    assert_eq!(event.state(grandchild), Some(SyncState::Sync));
    assert_eq!(event.state(unrelated), None);
    for item in [root, child, grandchild] {
        assert!(trunk(&manager, item).is_none());
    }
    assert!(trunk(&manager, unrelated).is_some());
}

#[test]
fn test_server_delete_waits_for_session_on_dependent() {
    let manager = manager();
    let rx = events(&manager);
    let root = create_synced(&manager, attrs(&[("title", "root")]));
    let child = create_dependent(&manager, root, "child");
    let (session, _factory) = start_editing(&manager, &[child]);

    download(&manager, root, AttributeMap::invisible());

    assert_eq!(last_state(&rx, root), None);
    assert!(trunk(&manager, root).is_some());
    assert!(trunk(&manager, child).is_some());
    assert_eq!(shadow(&manager, root, Shadow::Download), Some(AttributeMap::invisible()));

    session.release();
    manager.flush().unwrap();

    assert_eq!(last_state(&rx, root), Some(SyncState::Deleted));
    assert!(trunk(&manager, root).is_none());
    assert!(trunk(&manager, child).is_none());
}

#[test]
fn test_server_delete_waits_for_upload_of_dependent() {
    let manager = manager();
    let rx = events(&manager);
    let root = create_synced(&manager, attrs(&[("title", "root")]));
    let child = create_dependent(&manager, root, "child");
    edit(&manager, child, "title", "renamed");

    let observer = manager.clone();
    manager
        .sync_upload(ScriptedUploader {
            items: vec![child],
            upload: move |process: &UploadProcess| {
                download(&observer, root, AttributeMap::invisible());
                assert!(trunk(&observer, root).is_some());
                assert!(trunk(&observer, child).is_some());
                process.set_all_done(child).wait()?;
                Ok(())
            },
        })
        .unwrap();
    manager.flush().unwrap();

    assert_eq!(last_state(&rx, root), Some(SyncState::Deleted));
    assert!(trunk(&manager, root).is_none());
    assert!(trunk(&manager, child).is_none());
    assert!(!manager.is_during_upload(child));
}

/// Records the trunk its item had when the edit was prepared.
struct TrunkSnapshotFactory {
    item: ItemId,
    seen: Mutex<Option<AttributeMap>>,
}

impl EditorFactory for TrunkSnapshotFactory {
    fn prepare_edit(
        &self,
        reader: &Reader<'_>,
        _prepare: &mut dyn EditPrepare,
    ) -> itemdb::Result<Option<Arc<dyn ItemEditor>>> {
        *self.seen.lock() = reader.trunk(self.item)?;
        Ok(Some(Arc::new(TestEditor::default()) as Arc<dyn ItemEditor>))
    }
}

#[test]
fn test_edit_start_waits_for_simplified_commit() {
    let manager = manager();
    let other = create_synced(&manager, attrs(&[("title", "x")]));
    let item = create_synced(&manager, attrs(&[("title", "a")]));

    // Blocks the store so the second start joins the start transaction
    // queued ahead of the commit.
    let (gate_tx, gate_rx) = unbounded::<()>();
    let _gate = manager.db().read(move |_| {
        let _ = gate_rx.recv();
        Ok(())
    });
    let first = manager.prepare_edit(&[other]).unwrap();
    assert!(first.start(TestFactory::new()));
    let commit = manager
        .commit_edit_items(&[item], AttributeCommit::new().set(item, "title", "b"))
        .unwrap();
    let session = manager.prepare_edit(&[item]).unwrap();
    let factory = Arc::new(TrunkSnapshotFactory {
        item,
        seen: Mutex::new(None),
    });
    assert!(session.start(factory.clone()));
    gate_tx.send(()).unwrap();

    commit.wait().unwrap();
    manager.flush().unwrap();

    assert_eq!(first.state(), SessionState::Editing);
    assert_eq!(session.state(), SessionState::Editing);
    assert_eq!(*factory.seen.lock(), Some(attrs(&[("title", "b")])));
    assert_eq!(session.item_base(item), Some(attrs(&[("title", "a")])));
    assert!(Arc::ptr_eq(&manager.find_lock(item).unwrap(), &session));
}

#[test]
fn test_finished_upload_with_conflict_falls_back_to_plain_merge() {
    let manager = manager();
    let rx = events(&manager);
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    edit(&manager, item, "title", "b");
    manager
        .db()
        .write(move |writer| {
            writer.set_shadow(item, Shadow::DoneUpload, Some(&attrs(&[("title", "a")])))?;
            writer.set_shadow(item, Shadow::Conflict, Some(&attrs(&[("title", "c")])))
        })
        .wait()
        .unwrap();

    manager.request_auto_merge(&[item]);
    manager.flush().unwrap();

    assert_eq!(last_state(&rx, item), Some(SyncState::Conflict));
    assert!(shadow(&manager, item, Shadow::DoneUpload).is_none());
    assert_eq!(shadow(&manager, item, Shadow::Conflict), Some(attrs(&[("title", "c")])));
    assert_eq!(shadow(&manager, item, Shadow::Base), Some(attrs(&[("title", "a")])));
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "b")])));
}

#[test]
fn test_finished_upload_without_base_is_forgotten() {
    let manager = manager();
    let rx = events(&manager);
    let item = create_synced(&manager, attrs(&[("title", "a")]));
    manager
        .db()
        .write(move |writer| {
            writer.set_value(item, "title", Some(Value::from("b")))?;
            writer.set_shadow(item, Shadow::DoneUpload, Some(&attrs(&[("title", "a")])))
        })
        .wait()
        .unwrap();

    manager.request_auto_merge(&[item]);
    manager.flush().unwrap();

    assert_eq!(last_state(&rx, item), Some(SyncState::Sync));
    assert!(shadow(&manager, item, Shadow::DoneUpload).is_none());
    assert_eq!(trunk(&manager, item), Some(attrs(&[("title", "b")])));
    assert_eq!(state(&manager, item), ItemState::Sync);
}

#[test]
fn test_overlapping_sessions_race_from_two_threads() {
    for _ in 0..20 {
        let manager = manager();
        let one = create_synced(&manager, attrs(&[("n", "1")]));
        let two = create_synced(&manager, attrs(&[("n", "2")]));
        let three = create_synced(&manager, attrs(&[("n", "3")]));

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [vec![one, two], vec![two, three]]
            .into_iter()
            .map(|items| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let session = manager.prepare_edit(&items)?;
                    session.start(TestFactory::new()).then_some(session)
                })
            })
            .collect();
        let started: Vec<Option<EditControl>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        manager.flush().unwrap();

        let winners: Vec<&EditControl> = started.iter().flatten().collect();
        assert_eq!(winners.len(), 1);
        let winner = winners[0];
        assert_eq!(winner.state(), SessionState::Editing);
        let (held, free) = if started[0].is_some() {
            ([one, two], three)
        } else {
            ([two, three], one)
        };
        for item in held {
            assert!(Arc::ptr_eq(&manager.find_lock(item).unwrap(), winner));
        }
        assert!(manager.find_lock(free).is_none());
        winner.release();
        assert!(manager.find_any_lock(&[one, two, three]).is_none());
    }
}

#[tokio::test]
async fn test_subscribe_streams_merge_events() {
    let manager = manager();
    let mut rx = manager.subscribe();
    let item = create_synced(&manager, attrs(&[("title", "a")]));

    download(&manager, item, attrs(&[("title", "c")]));

    let (icn, event) = rx.recv().await.unwrap();
    assert_eq!(event.state(item), Some(SyncState::Sync));
    assert_eq!(icn, manager.db().last_icn());
}
