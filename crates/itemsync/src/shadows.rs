use serde::{Deserialize, Serialize};
use std::fmt;

use itemdb::{Reader, Result, Writer};
use items::{AttributeMap, ItemId, Shadow};

/// Display state of an item derived from its shadows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Sync,
    /// Created locally, never uploaded.
    New,
    Edited,
    LocalDelete,
    Conflict,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemState::Sync => "sync",
            ItemState::New => "new",
            ItemState::Edited => "edited",
            ItemState::LocalDelete => "local_delete",
            ItemState::Conflict => "conflict",
        };
        f.write_str(name)
    }
}

pub fn item_state(reader: &Reader<'_>, item: ItemId) -> Result<ItemState> {
    if reader.shadow(item, Shadow::Conflict)?.is_some() {
        return Ok(ItemState::Conflict);
    }
    let Some(base) = reader.shadow(item, Shadow::Base)? else {
        return Ok(ItemState::Sync);
    };
    if base.is_invisible() {
        return Ok(ItemState::New);
    }
    if reader.is_removed(item)? {
        return Ok(ItemState::LocalDelete);
    }
    Ok(ItemState::Edited)
}

/// Newest known server state: download, then conflict, then base.
pub fn last_server(reader: &Reader<'_>, item: ItemId) -> Result<Option<AttributeMap>> {
    for shadow in [Shadow::Download, Shadow::Conflict, Shadow::Base] {
        if let Some(version) = reader.shadow(item, shadow)? {
            return Ok(Some(version));
        }
    }
    Ok(None)
}

/// Server state of any item: the newest server shadow, or the trunk when the
/// item carries no local edit.
pub fn server_version(reader: &Reader<'_>, item: ItemId) -> Result<Option<AttributeMap>> {
    match last_server(reader, item)? {
        Some(version) => Ok(Some(version)),
        None => reader.trunk(item),
    }
}

/// Replaces the trunk with the last server state and drops every shadow.
pub fn discard_single(writer: &mut Writer<'_>, item: ItemId) -> Result<()> {
    if let Some(server) = last_server(writer, item)? {
        writer.set_trunk(item, &server)?;
        writer.set_history(item, &[])?;
    }
    merge_done(writer, item, None, None)
}

/// Records the outcome of a merge: the new base and conflict, with the
/// upload and download shadows consumed.
pub fn merge_done(
    writer: &mut Writer<'_>,
    item: ItemId,
    base: Option<&AttributeMap>,
    conflict: Option<&AttributeMap>,
) -> Result<()> {
    writer.set_shadow(item, Shadow::Base, base)?;
    writer.set_shadow(item, Shadow::Conflict, conflict)?;
    forget_upload(writer, item)
}

pub fn forget_upload(writer: &mut Writer<'_>, item: ItemId) -> Result<()> {
    writer.set_shadow(item, Shadow::Download, None)?;
    writer.set_shadow(item, Shadow::DoneUpload, None)?;
    writer.set_shadow(item, Shadow::UploadTask, None)?;
    writer.set_done_upload_history(item, 0)
}
