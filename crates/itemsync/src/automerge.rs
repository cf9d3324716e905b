use std::collections::BTreeSet;
use std::sync::Arc;

use itemdb::Writer;
use items::{AttributeMap, ItemDiff, ItemId, Shadow, SyncState};

use crate::{
    discard_single, forget_upload, last_server, merge_done, ConflictPolicy, EditSession, MergeData,
    MergeEvent, SyncManager,
};

/// Shadows of one item as read at the start of a merge pass.
struct Snapshot {
    trunk: AttributeMap,
    base: Option<AttributeMap>,
    download: Option<AttributeMap>,
    conflict: Option<AttributeMap>,
    done_upload: Option<AttributeMap>,
    done_history: u32,
}

impl Snapshot {
    fn read(writer: &Writer<'_>, item: ItemId) -> itemdb::Result<Option<Self>> {
        let Some(trunk) = writer.trunk(item)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            trunk,
            base: writer.shadow(item, Shadow::Base)?,
            download: writer.shadow(item, Shadow::Download)?,
            conflict: writer.shadow(item, Shadow::Conflict)?,
            done_upload: writer.shadow(item, Shadow::DoneUpload)?,
            done_history: writer.done_upload_history(item)?,
        }))
    }

    fn is_after_upload(&self) -> bool {
        self.done_upload.is_some() || self.done_history > 0
    }

    /// Newest server state to reconcile with: download, then conflict, then
    /// base.
    fn new_server(&self) -> Option<&AttributeMap> {
        self.download
            .as_ref()
            .or(self.conflict.as_ref())
            .or(self.base.as_ref())
    }
}

/// Reconciles one item's local edit with the newest server state.
pub(crate) struct ItemMerge<'m> {
    pub manager: &'m Arc<SyncManager>,
    pub policy: Arc<dyn ConflictPolicy>,
    pub item: ItemId,
    pub just_edited: Option<&'m EditSession>,
}

impl ItemMerge<'_> {
    /// Runs merge passes until the item settles. `None` when the item was
    /// left for a later merge.
    pub fn perform(&self, writer: &mut Writer<'_>) -> itemdb::Result<Option<MergeEvent>> {
        let item = self.item;
        let max_passes = self.manager.config().max_merge_passes.max(1);
        for _ in 0..max_passes {
            let Some(snapshot) = Snapshot::read(writer, item)? else {
                return Ok(None);
            };
            let history = writer.history(item)?;
            let local_from = if snapshot.is_after_upload() {
                snapshot.done_upload.as_ref().or(snapshot.base.as_ref())
            } else {
                snapshot.base.as_ref()
            };
            let uploaded = if snapshot.is_after_upload() {
                snapshot.done_history as usize
            } else {
                0
            };
            let mut local =
                local_from.map(|from| ItemDiff::to_trunk(item, from, &snapshot.trunk, &history, uploaded));
            if let Some(local) = local.as_mut().filter(|l| l.has_changes()) {
                self.policy.pre_process(writer.reader(), local);
            }
            // Created and deleted again before the server saw it.
            let never_existed =
                local_from.map_or(false, AttributeMap::is_invisible) && snapshot.trunk.is_invisible();
            let Some(local) = local.filter(|l| l.has_changes() && !never_existed) else {
                return self.discard_local(writer, &snapshot);
            };

            if snapshot.is_after_upload() {
                self.finish_upload(writer, &snapshot, &local)?;
                continue;
            }

            let (Some(base), Some(new_server)) = (snapshot.base.as_ref(), snapshot.new_server()) else {
                tracing::error!(%item, "local changes without base");
                return Ok(None);
            };
            if let Some(history) = local.updated_history() {
                writer.set_history(item, &history)?;
            }
            if snapshot.download.is_none() && snapshot.conflict.is_none() {
                return Ok(Some(MergeEvent::single(item, SyncState::Edited)));
            }

            let server = ItemDiff::server(item, base, new_server);
            let mut data = MergeData::new(local, server, self.policy.as_ref());
            self.policy.resolve(writer.reader(), &mut data);
            if !data.is_conflict_resolved() {
                merge_done(writer, item, Some(base), Some(new_server))?;
                tracing::debug!(%item, conflicts = ?data.unresolved(), "merge conflict");
                return Ok(Some(MergeEvent::single(item, SyncState::Conflict)));
            }
            if data.is_delete() {
                return self.delete_subtree(writer);
            }
            if data.is_discard_edit() {
                return self.discard_local(writer, &snapshot);
            }

            merge_done(writer, item, Some(new_server), None)?;
            if let Some(history) = data.updated_history() {
                writer.set_history(item, &history)?;
            }
            for (attr, value) in data.resolution() {
                writer.set_value(item, attr, value.clone())?;
            }
            for attr in data.server().changed() {
                if !data.resolution().contains_key(attr) {
                    writer.set_value(item, attr, new_server.get(attr).cloned())?;
                }
            }
        }
        tracing::error!(%item, max_passes, "merge did not settle");
        Ok(Some(MergeEvent::single(item, SyncState::Edited)))
    }

    fn finish_upload(&self, writer: &mut Writer<'_>, snapshot: &Snapshot, local: &ItemDiff) -> itemdb::Result<()> {
        let item = self.item;
        let Some(base) = snapshot.base.as_ref() else {
            tracing::error!(%item, "upload finished without base");
            return forget_upload(writer, item);
        };
        if snapshot.conflict.is_some() {
            tracing::error!(%item, "upload finished while item has conflict");
            return forget_upload(writer, item);
        }
        let new_server = snapshot.download.as_ref().unwrap_or(base);

        let server_attrs: BTreeSet<String> = if snapshot.done_upload.is_some() && !local.has_history() {
            base.keys().chain(new_server.keys()).map(str::to_string).collect()
        } else {
            ItemDiff::server(item, base, new_server).changed().clone()
        };
        if let Some(history) = local.updated_history() {
            writer.set_history(item, &history)?;
        }
        for attr in &server_attrs {
            if !local.is_changed(attr) {
                writer.set_value(item, attr, new_server.get(attr).cloned())?;
            }
        }
        merge_done(writer, item, Some(new_server), None)
    }

    /// No local change left: the trunk takes the newest server state.
    fn discard_local(&self, writer: &mut Writer<'_>, snapshot: &Snapshot) -> itemdb::Result<Option<MergeEvent>> {
        let item = self.item;
        let Some(server) = last_server(writer.reader(), item)? else {
            if snapshot.is_after_upload() {
                forget_upload(writer, item)?;
            }
            return Ok(Some(MergeEvent::single(item, SyncState::Sync)));
        };
        if server.is_invisible() {
            return self.delete_subtree(writer);
        }
        discard_single(writer, item)?;
        Ok(Some(MergeEvent::single(item, SyncState::Sync)))
    }

    /// Physically removes the item and its dependents, or leaves the item for
    /// a later merge when any of them is held.
    fn delete_subtree(&self, writer: &mut Writer<'_>) -> itemdb::Result<Option<MergeEvent>> {
        let item = self.item;
        let subtree = writer.subtree(item)?;
        if !self
            .manager
            .lock_or_merge_later(writer, &subtree, self.just_edited, &[item])?
        {
            tracing::debug!(%item, "subtree delete deferred");
            return Ok(None);
        }
        for member in &subtree {
            writer.clear_item(*member)?;
        }
        let mut event = MergeEvent::new();
        event.add_all(&subtree, SyncState::Sync);
        event.add(item, SyncState::Deleted);
        Ok(Some(event))
    }
}
