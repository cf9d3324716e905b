use std::collections::BTreeSet;
use std::sync::Arc;

use itemdb::{Reader, StoreError, TxHandle, Writer};
use items::{AttributeMap, ItemId, Shadow};

use crate::SyncManager;

/// Write access for storing what the server sent.
pub struct DownloadDrain<'w, 'a> {
    writer: &'w mut Writer<'a>,
    touched: BTreeSet<ItemId>,
}

impl<'w, 'a> DownloadDrain<'w, 'a> {
    pub fn reader(&self) -> &Reader<'a> {
        self.writer.reader()
    }

    /// Materializes an item first seen on the server. It starts in sync.
    pub fn create_item(&mut self, values: &AttributeMap) -> itemdb::Result<ItemId> {
        let item = self.writer.new_item()?;
        self.writer.set_trunk(item, values)?;
        Ok(item)
    }

    /// Stores a newer server state of an existing item. The local edit, if
    /// any, is reconciled with it once the transaction finishes writing.
    pub fn write_server(&mut self, item: ItemId, values: &AttributeMap) -> itemdb::Result<()> {
        if !self.writer.exists(item)? {
            return Err(StoreError::ItemNotFound(item));
        }
        self.writer.set_shadow(item, Shadow::Download, Some(values))?;
        self.touched.insert(item);
        Ok(())
    }
}

impl SyncManager {
    /// Runs `f` in a write transaction and merges every item it wrote a
    /// server state for, or defers the ones held by an edit or an upload.
    pub fn write_downloaded<T, F>(self: &Arc<Self>, f: F) -> TxHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DownloadDrain<'_, '_>) -> itemdb::Result<T> + Send + 'static,
    {
        let manager = self.clone();
        self.db().write(move |writer| {
            let (value, touched) = {
                let mut drain = DownloadDrain {
                    writer: &mut *writer,
                    touched: BTreeSet::new(),
                };
                let value = f(&mut drain)?;
                (value, drain.touched)
            };
            let touched: Vec<ItemId> = touched.into_iter().collect();
            tracing::debug!(items = touched.len(), "download written");
            manager.auto_merge_now(writer, &touched, None)?;
            Ok(value)
        })
    }
}
