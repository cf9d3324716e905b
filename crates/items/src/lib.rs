use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod attributes;
pub use attributes::*;
mod history;
pub use history::*;
mod diff;
pub use diff::*;
mod shadow;
pub use shadow::*;
mod id_set;
pub use id_set::*;

#[derive(Debug, Error)]
pub enum ItemsError {
    #[error("invalid item id list: {0} bytes is not a multiple of 8")]
    BadIdList(usize),
    #[error("item not materialized: {0}")]
    NotMaterialized(ItemId),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ItemsError>;

/// Identifier of a record in the local replica.
///
/// Ids are allocated by the store. Zero and negative ids denote items that
/// are not yet materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub i64);

impl ItemId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn is_materialized(self) -> bool {
        self.0 > 0
    }

    pub fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<i64> for ItemId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Per-item outcome of a merge pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No pending local change.
    Sync,
    /// Local change retained, no unresolved conflict.
    Edited,
    /// Server state could not be reconciled with the local edit.
    Conflict,
    /// The item and its dependent subtree were removed.
    Deleted,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Sync => "sync",
            SyncState::Edited => "edited",
            SyncState::Conflict => "conflict",
            SyncState::Deleted => "deleted",
        };
        f.write_str(name)
    }
}
