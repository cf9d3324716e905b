use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use itemdb::{Reader, StoreError, TxHandle, Writer};
use items::{AttributeMap, ItemId, Shadow, INVISIBLE};

use crate::{forget_upload, SyncManager, UploadId};

/// Network side of an upload.
pub trait ItemUploader: Send {
    /// Chooses the items to upload. Runs inside a write transaction.
    fn prepare_upload(&mut self, prepare: &mut UploadPrepare<'_, '_>) -> itemdb::Result<()>;

    /// Sends the claimed items and reports each one back through `process`.
    /// Items not reported when this returns are cancelled.
    fn do_upload(&mut self, process: &UploadProcess) -> crate::Result<()>;
}

/// Item claiming inside the preparation transaction.
pub struct UploadPrepare<'w, 'a> {
    writer: &'w mut Writer<'a>,
    manager: &'w Arc<SyncManager>,
    process: UploadId,
    claimed: Vec<ItemId>,
}

impl<'w, 'a> UploadPrepare<'w, 'a> {
    fn new(writer: &'w mut Writer<'a>, manager: &'w Arc<SyncManager>, process: UploadId) -> Self {
        Self {
            writer,
            manager,
            process,
            claimed: Vec::new(),
        }
    }

    pub fn reader(&self) -> &Reader<'a> {
        self.writer.reader()
    }

    /// An item can be uploaded when it carries a local edit, no conflict and
    /// is not being uploaded already.
    pub fn is_uploadable(&self, item: ItemId) -> itemdb::Result<bool> {
        if self.manager.uploads().owner(item).map_or(false, |owner| owner != self.process) {
            return Ok(false);
        }
        let reader = self.writer.reader();
        Ok(reader.shadow(item, Shadow::Base)?.is_some()
            && reader.shadow(item, Shadow::Conflict)?.is_none()
            && reader.shadow(item, Shadow::UploadTask)?.is_none())
    }

    pub fn add_to_upload(&mut self, item: ItemId) -> itemdb::Result<bool> {
        self.add_all_to_upload(&[item])
    }

    /// Claims all `items` or none of them. The current trunk of each becomes
    /// its upload task.
    pub fn add_all_to_upload(&mut self, items: &[ItemId]) -> itemdb::Result<bool> {
        for item in items {
            if !self.is_uploadable(*item)? {
                return Ok(false);
            }
        }
        if !self.manager.uploads().register_task(self.process, items) {
            return Ok(false);
        }
        for item in items {
            let trunk = self
                .writer
                .trunk(*item)?
                .ok_or(StoreError::ItemNotFound(*item))?;
            self.writer.set_shadow(*item, Shadow::UploadTask, Some(&trunk))?;
            self.claimed.push(*item);
        }
        Ok(true)
    }

    pub fn claimed(&self) -> &[ItemId] {
        &self.claimed
    }
}

/// Acknowledged part of an upload.
struct Acknowledged {
    /// `None` means every requested attribute.
    attrs: Option<Vec<String>>,
    /// `None` means all local history.
    history: Option<u32>,
    server: Option<AttributeMap>,
}

/// One running upload. The transport reports the outcome of every claimed
/// item through it.
pub struct UploadProcess {
    id: UploadId,
    manager: Arc<SyncManager>,
    pending: Mutex<BTreeSet<ItemId>>,
    prepared: AtomicBool,
}

impl UploadProcess {
    fn new(manager: Arc<SyncManager>) -> Self {
        Self {
            id: UploadId::new(),
            manager,
            pending: Mutex::new(BTreeSet::new()),
            prepared: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> UploadId {
        self.id
    }

    /// Claimed items not reported yet.
    pub fn items(&self) -> Vec<ItemId> {
        self.pending.lock().iter().copied().collect()
    }

    /// The server acknowledged `done_attrs` and the first `history_count`
    /// local history records of `item`.
    pub fn finish_upload(&self, item: ItemId, done_attrs: &[&str], history_count: u32) -> TxHandle<()> {
        self.finish(
            item,
            Acknowledged {
                attrs: Some(done_attrs.iter().map(|a| a.to_string()).collect()),
                history: Some(history_count),
                server: None,
            },
        )
    }

    /// Like [`finish_upload`](Self::finish_upload), with the server state
    /// the transport received back.
    pub fn finish_upload_with_server(
        &self,
        item: ItemId,
        server: AttributeMap,
        done_attrs: &[&str],
        history_count: u32,
    ) -> TxHandle<()> {
        self.finish(
            item,
            Acknowledged {
                attrs: Some(done_attrs.iter().map(|a| a.to_string()).collect()),
                history: Some(history_count),
                server: Some(server),
            },
        )
    }

    /// Everything requested was uploaded.
    pub fn set_all_done(&self, item: ItemId) -> TxHandle<()> {
        self.finish(
            item,
            Acknowledged {
                attrs: None,
                history: None,
                server: None,
            },
        )
    }

    pub fn cancel_upload(&self, item: ItemId) -> TxHandle<()> {
        if !self.take_pending(item) {
            return TxHandle::failed(StoreError::Cancelled);
        }
        self.cancel(item)
    }

    fn take_pending(&self, item: ItemId) -> bool {
        if self.pending.lock().remove(&item) {
            return true;
        }
        tracing::warn!(%item, process = %self.id, "item is not part of the upload");
        false
    }

    fn finish(&self, item: ItemId, ack: Acknowledged) -> TxHandle<()> {
        if !self.take_pending(item) {
            return TxHandle::failed(StoreError::Cancelled);
        }
        let manager = self.manager.clone();
        let process = self.id;
        self.manager.db().write(move |writer| {
            {
                let manager = manager.clone();
                writer.finally(move |_| manager.uploads().unregister(process, &[item]));
            }
            let Some(task) = writer.shadow(item, Shadow::UploadTask)? else {
                tracing::warn!(%item, "upload finished for item without upload task");
                return Ok(());
            };
            if let Some(server) = &ack.server {
                writer.set_shadow(item, Shadow::Download, Some(server))?;
            }
            let Some(base) = writer.shadow(item, Shadow::Base)? else {
                tracing::error!(%item, "uploaded item has no base");
                forget_upload(writer, item)?;
                return merge_uploaded(&manager, writer, item);
            };

            let creation = base.is_invisible();
            let mut requested = base.changed_attributes(&task);
            if creation {
                requested.remove(INVISIBLE);
            }
            let acknowledged: BTreeSet<String> = match ack.attrs {
                Some(attrs) => attrs.into_iter().collect(),
                None => requested.clone(),
            };
            let mut done = writer
                .shadow(item, Shadow::DoneUpload)?
                .unwrap_or_else(|| base.clone());
            done.overlay(&task, acknowledged.iter().map(String::as_str));
            if creation {
                done.remove(INVISIBLE);
            }
            let missing: BTreeSet<String> = requested.difference(&acknowledged).cloned().collect();
            if !missing.is_empty() {
                if missing != requested {
                    tracing::warn!(%item, ?missing, "partial upload");
                } else {
                    tracing::debug!(%item, "no attribute acknowledged");
                }
            }

            let history_len = writer.history(item)?.len() as u32;
            let previous = writer.done_upload_history(item)?;
            let history_done = match ack.history {
                Some(count) => previous.saturating_add(count).min(history_len),
                None => history_len,
            };
            writer.set_shadow(item, Shadow::DoneUpload, Some(&done))?;
            writer.set_done_upload_history(item, history_done)?;
            if writer.shadow(item, Shadow::Download)?.is_none() {
                writer.set_shadow(item, Shadow::Download, Some(&done))?;
            }
            writer.set_shadow(item, Shadow::UploadTask, None)?;
            tracing::debug!(%item, acknowledged = acknowledged.len(), "upload finished");
            merge_uploaded(&manager, writer, item)
        })
    }

    fn cancel(&self, item: ItemId) -> TxHandle<()> {
        let manager = self.manager.clone();
        let process = self.id;
        self.manager.db().write(move |writer| {
            {
                let manager = manager.clone();
                writer.finally(move |_| manager.uploads().unregister(process, &[item]));
            }
            if !writer.exists(item)? || writer.shadow(item, Shadow::UploadTask)?.is_none() {
                return Ok(());
            }
            writer.set_shadow(item, Shadow::UploadTask, None)?;
            tracing::debug!(%item, "upload cancelled");
            merge_uploaded(&manager, writer, item)
        })
    }

    /// Cancels every unreported item. Reported and cancelled items drop
    /// their claim once their own transaction settles; before preparation
    /// committed there is nothing to settle.
    fn release_unfinished(&self) {
        if !self.prepared.load(Ordering::SeqCst) {
            self.manager.uploads().unregister_all(self.id);
            return;
        }
        let unfinished = std::mem::take(&mut *self.pending.lock());
        if !unfinished.is_empty() {
            tracing::warn!(process = %self.id, items = ?unfinished, "upload left items unreported");
        }
        for item in unfinished {
            self.cancel(item);
        }
    }
}

/// Merges the item and everything parked behind its upload.
fn merge_uploaded(manager: &Arc<SyncManager>, writer: &mut Writer<'_>, item: ItemId) -> itemdb::Result<()> {
    let mut items = vec![item];
    for parked in writer.merge_after_upload(item)? {
        if !items.contains(&parked) {
            items.push(parked);
        }
    }
    writer.set_merge_after_upload(item, &[])?;
    manager.auto_merge_now(writer, &items, None)
}

/// Releases the claims of an upload on every exit path.
struct UploadClaim {
    process: Arc<UploadProcess>,
}

impl Drop for UploadClaim {
    fn drop(&mut self) {
        self.process.release_unfinished();
    }
}

impl SyncManager {
    /// Prepares and runs one upload. Blocks until the preparation
    /// transaction completes, so it must not run on the store or callback
    /// thread.
    pub fn sync_upload<U>(self: &Arc<Self>, uploader: U) -> crate::Result<Vec<ItemId>>
    where
        U: ItemUploader + 'static,
    {
        let process = Arc::new(UploadProcess::new(self.clone()));
        let _claim = UploadClaim {
            process: process.clone(),
        };
        let manager = self.clone();
        let id = process.id();
        let (mut uploader, claimed) = self
            .db()
            .write(move |writer| {
                let mut uploader = uploader;
                let mut prepare = UploadPrepare::new(writer, &manager, id);
                uploader.prepare_upload(&mut prepare)?;
                let claimed = prepare.claimed;
                Ok((uploader, claimed))
            })
            .wait()?;
        if claimed.is_empty() {
            tracing::debug!(process = %id, "nothing to upload");
            return Ok(claimed);
        }
        process.pending.lock().extend(claimed.iter().copied());
        process.prepared.store(true, Ordering::SeqCst);
        tracing::info!(process = %id, items = claimed.len(), "upload prepared");
        uploader.do_upload(&process)?;
        Ok(claimed)
    }
}
