use crossbeam_channel::Receiver;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::Deref;

use items::{decode_ids, encode_ids, insert_ids, AttributeMap, HistoryRecord, ItemId, ItemsError, Shadow};

use crate::{Result, StoreError};

/// Callback run after a write transaction settles; the flag tells whether it
/// committed.
pub type FinallyFn = Box<dyn FnOnce(bool) + Send + 'static>;

/// Pending result of a transaction.
pub struct TxHandle<T> {
    rx: Receiver<Result<T>>,
}

impl<T> TxHandle<T> {
    pub(crate) fn new(rx: Receiver<Result<T>>) -> Self {
        Self { rx }
    }

    /// A handle whose transaction never ran.
    pub fn failed(error: StoreError) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(Err(error));
        Self { rx }
    }

    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(StoreError::Closed))
    }
}

/// Sent to subscribers after each committed write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotice {
    pub icn: u64,
    pub items: Vec<ItemId>,
}

/// Per-transaction scratch space, keyed by type.
#[derive(Default)]
pub struct TxCache {
    entries: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl TxCache {
    pub fn get<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.entries
            .get_mut(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_mut::<T>())
    }

    pub fn get_or_insert_with<T: Any + Send>(&mut self, init: impl FnOnce() -> T) -> &mut T {
        let key = TypeId::of::<T>();
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| Box::new(init()));
        match entry.downcast_mut::<T>() {
            Some(value) => value,
            None => unreachable!("cache entry is keyed by its own type"),
        }
    }
}

/// Read access inside a transaction.
pub struct Reader<'a> {
    conn: &'a Connection,
    icn: u64,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(conn: &'a Connection, icn: u64) -> Self {
        Self { conn, icn }
    }

    /// Transaction number: the one being written, or the last committed one
    /// for read transactions.
    pub fn icn(&self) -> u64 {
        self.icn
    }

    pub fn exists(&self, item: ItemId) -> Result<bool> {
        if !item.is_materialized() {
            return Ok(false);
        }
        let found = self
            .conn
            .query_row("SELECT 1 FROM items WHERE id = ?1", params![item.0], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn trunk(&self, item: ItemId) -> Result<Option<AttributeMap>> {
        self.json_column(item, "trunk")
    }

    pub fn value(&self, item: ItemId, attr: &str) -> Result<Option<Value>> {
        Ok(self.trunk(item)?.and_then(|trunk| trunk.get(attr).cloned()))
    }

    /// True when the item is missing or its trunk is marked invisible.
    pub fn is_removed(&self, item: ItemId) -> Result<bool> {
        Ok(self.trunk(item)?.map_or(true, |trunk| trunk.is_invisible()))
    }

    pub fn history(&self, item: ItemId) -> Result<Vec<HistoryRecord>> {
        Ok(self.json_column(item, "history")?.unwrap_or_default())
    }

    pub fn shadow(&self, item: ItemId, shadow: Shadow) -> Result<Option<AttributeMap>> {
        self.json_column(item, shadow.column())
    }

    pub fn done_upload_history(&self, item: ItemId) -> Result<u32> {
        if !item.is_materialized() {
            return Ok(0);
        }
        let count: Option<i64> = self
            .conn
            .query_row(
                "SELECT done_upload_history FROM items WHERE id = ?1",
                params![item.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0).max(0) as u32)
    }

    /// Items to merge once the upload of `item` completes.
    pub fn merge_after_upload(&self, item: ItemId) -> Result<Vec<ItemId>> {
        Ok(decode_ids(&self.merge_after_upload_bytes(item)?)?)
    }

    fn merge_after_upload_bytes(&self, item: ItemId) -> Result<Vec<u8>> {
        if !item.is_materialized() {
            return Ok(Vec::new());
        }
        let bytes: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(
                "SELECT merge_after_upload FROM items WHERE id = ?1",
                params![item.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.flatten().unwrap_or_default())
    }

    /// Items whose `sync.master` points at `item`.
    pub fn children(&self, item: ItemId) -> Result<Vec<ItemId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM items WHERE master = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![item.0], |row| row.get::<_, i64>(0))?;
        let mut children = Vec::new();
        for row in rows {
            children.push(ItemId(row?));
        }
        Ok(children)
    }

    /// `root` followed by every item transitively owned by it.
    pub fn subtree(&self, root: ItemId) -> Result<Vec<ItemId>> {
        let mut result = vec![root];
        let mut seen: BTreeSet<ItemId> = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(next) = queue.pop_front() {
            for child in self.children(next)? {
                if seen.insert(child) {
                    result.push(child);
                    queue.push_back(child);
                }
            }
        }
        Ok(result)
    }

    pub fn all_items(&self) -> Result<Vec<ItemId>> {
        self.ids_where("1 = 1")
    }

    pub fn items_with_shadow(&self, shadow: Shadow) -> Result<Vec<ItemId>> {
        self.ids_where(&format!("{} IS NOT NULL", shadow.column()))
    }

    fn ids_where(&self, condition: &str) -> Result<Vec<ItemId>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM items WHERE {condition} ORDER BY id"))?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(ItemId(row?));
        }
        Ok(ids)
    }

    fn json_column<T: serde::de::DeserializeOwned>(
        &self,
        item: ItemId,
        column: &str,
    ) -> Result<Option<T>> {
        if !item.is_materialized() {
            return Ok(None);
        }
        let raw: Option<Option<String>> = self
            .conn
            .query_row(
                &format!("SELECT {column} FROM items WHERE id = ?1"),
                params![item.0],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

/// Write access inside a write transaction.
pub struct Writer<'a> {
    reader: Reader<'a>,
    finally: Vec<FinallyFn>,
    cache: TxCache,
    touched: BTreeSet<ItemId>,
}

impl<'a> Deref for Writer<'a> {
    type Target = Reader<'a>;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}

impl<'a> Writer<'a> {
    pub(crate) fn new(conn: &'a Connection, icn: u64) -> Self {
        Self {
            reader: Reader::new(conn, icn),
            finally: Vec::new(),
            cache: TxCache::default(),
            touched: BTreeSet::new(),
        }
    }

    pub fn reader(&self) -> &Reader<'a> {
        &self.reader
    }

    /// Materializes a new item with an empty trunk.
    pub fn new_item(&mut self) -> Result<ItemId> {
        let now = chrono::Utc::now().timestamp();
        self.reader.conn.execute(
            "INSERT INTO items(trunk, history, updated_at) VALUES('{}', '[]', ?1)",
            params![now],
        )?;
        let item = ItemId(self.reader.conn.last_insert_rowid());
        self.touched.insert(item);
        Ok(item)
    }

    pub fn set_trunk(&mut self, item: ItemId, trunk: &AttributeMap) -> Result<()> {
        let json = serde_json::to_string(trunk)?;
        let master = trunk.master().map(|m| m.0);
        let now = chrono::Utc::now().timestamp();
        self.update(
            item,
            "UPDATE items SET trunk = ?2, master = ?3, updated_at = ?4 WHERE id = ?1",
            params![item.0, json, master, now],
        )
    }

    pub fn set_value(&mut self, item: ItemId, attr: &str, value: Option<Value>) -> Result<()> {
        let mut trunk = self.trunk(item)?.ok_or(StoreError::ItemNotFound(item))?;
        trunk.set(attr, value);
        self.set_trunk(item, &trunk)
    }

    pub fn set_history(&mut self, item: ItemId, history: &[HistoryRecord]) -> Result<()> {
        let json = serde_json::to_string(history)?;
        self.update(
            item,
            "UPDATE items SET history = ?2 WHERE id = ?1",
            params![item.0, json],
        )
    }

    pub fn set_shadow(
        &mut self,
        item: ItemId,
        shadow: Shadow,
        value: Option<&AttributeMap>,
    ) -> Result<()> {
        let json = match value {
            Some(map) => Some(serde_json::to_string(map)?),
            None => None,
        };
        self.update(
            item,
            &format!("UPDATE items SET {} = ?2 WHERE id = ?1", shadow.column()),
            params![item.0, json],
        )
    }

    pub fn set_done_upload_history(&mut self, item: ItemId, count: u32) -> Result<()> {
        self.update(
            item,
            "UPDATE items SET done_upload_history = ?2 WHERE id = ?1",
            params![item.0, count as i64],
        )
    }

    pub fn set_merge_after_upload(&mut self, item: ItemId, ids: &[ItemId]) -> Result<()> {
        let bytes = if ids.is_empty() {
            None
        } else {
            Some(encode_ids(ids))
        };
        self.update(
            item,
            "UPDATE items SET merge_after_upload = ?2 WHERE id = ?1",
            params![item.0, bytes],
        )
    }

    /// Appends `ids` to the merge-after-upload list of `item`, skipping ids
    /// already there. `false` when nothing was added.
    pub fn add_merge_after_upload(&mut self, item: ItemId, ids: &[ItemId]) -> Result<bool> {
        let current = self.merge_after_upload_bytes(item)?;
        let updated = insert_ids(&current, ids)?;
        if updated.len() == current.len() {
            return Ok(false);
        }
        self.update(
            item,
            "UPDATE items SET merge_after_upload = ?2 WHERE id = ?1",
            params![item.0, updated],
        )?;
        Ok(true)
    }

    /// Physically removes the item with all its shadows.
    pub fn clear_item(&mut self, item: ItemId) -> Result<()> {
        self.reader
            .conn
            .execute("DELETE FROM items WHERE id = ?1", params![item.0])?;
        self.touched.insert(item);
        Ok(())
    }

    /// Registers a callback run on the store thread once this transaction
    /// commits or rolls back.
    pub fn finally(&mut self, callback: impl FnOnce(bool) + Send + 'static) {
        self.finally.push(Box::new(callback));
    }

    pub fn cache(&mut self) -> &mut TxCache {
        &mut self.cache
    }

    pub(crate) fn into_parts(self) -> (Vec<FinallyFn>, BTreeSet<ItemId>) {
        (self.finally, self.touched)
    }

    fn update(&mut self, item: ItemId, sql: &str, params: impl rusqlite::Params) -> Result<()> {
        if !item.is_materialized() {
            return Err(ItemsError::NotMaterialized(item).into());
        }
        let changed = self.reader.conn.execute(sql, params)?;
        if changed == 0 {
            return Err(StoreError::ItemNotFound(item));
        }
        self.touched.insert(item);
        Ok(())
    }
}
