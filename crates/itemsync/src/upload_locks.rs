use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use itemdb::Writer;
use items::{ItemId, Shadow};

/// Identity of one upload process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Items claimed by in-flight uploads.
#[derive(Default)]
pub struct UploadLockTable {
    claims: Mutex<HashMap<ItemId, UploadId>>,
}

impl UploadLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims all `items` for `process`, or none of them when any is
    /// claimed by another process.
    pub fn register_task(&self, process: UploadId, items: &[ItemId]) -> bool {
        let mut claims = self.claims.lock();
        if let Some(item) = items
            .iter()
            .find(|item| claims.get(item).map_or(false, |owner| *owner != process))
        {
            tracing::debug!(%item, %process, "item already uploading");
            return false;
        }
        for item in items {
            claims.insert(*item, process);
        }
        true
    }

    pub fn unregister(&self, process: UploadId, items: &[ItemId]) {
        let mut claims = self.claims.lock();
        for item in items {
            if claims.get(item) == Some(&process) {
                claims.remove(item);
            }
        }
    }

    pub fn unregister_all(&self, process: UploadId) {
        self.claims.lock().retain(|_, owner| *owner != process);
    }

    pub fn is_any_locked(&self, items: &[ItemId]) -> bool {
        let claims = self.claims.lock();
        items.iter().any(|item| claims.contains_key(item))
    }

    pub fn owner(&self, item: ItemId) -> Option<UploadId> {
        self.claims.lock().get(&item).copied()
    }
}

/// `false` when any of `items` carries an upload task. `enqueue` is then
/// parked on each uploading item and merged once its upload finishes.
pub(crate) fn allows_merge(writer: &mut Writer<'_>, items: &[ItemId], enqueue: &[ItemId]) -> itemdb::Result<bool> {
    let mut allowed = true;
    for item in items {
        if writer.shadow(*item, Shadow::UploadTask)?.is_some() {
            writer.add_merge_after_upload(*item, enqueue)?;
            allowed = false;
        }
    }
    Ok(allowed)
}

/// Items without an upload task. Uploading items are parked on their own
/// merge-after-upload list.
pub(crate) fn select_not_uploading(writer: &mut Writer<'_>, items: &[ItemId]) -> itemdb::Result<Vec<ItemId>> {
    let mut selected = Vec::with_capacity(items.len());
    for item in items {
        if allows_merge(writer, &[*item], &[*item])? {
            selected.push(*item);
        }
    }
    Ok(selected)
}
