//! Edit and merge coordination for the local item replica.
//!
//! Edit sessions lock items while a user edits them, commits are written
//! through an [`EditDrain`], downloaded server versions are reconciled with
//! local edits by the auto-merge engine, and uploads claim items so nothing
//! merges into them while they are being transmitted. [`SyncManager`] wires
//! all of it together.
use serde::Deserialize;
use thiserror::Error;

use itemdb::StoreError;

mod exec;
pub use exec::*;

mod event;
pub use event::*;

mod shadows;
pub use shadows::*;

mod edit_locks;
pub use edit_locks::*;

mod session;
pub use session::*;

mod commit;
pub use commit::*;

mod merge_data;
pub use merge_data::*;

mod policy;
pub use policy::*;

mod automerge;

mod scheduler;

mod upload_locks;
pub use upload_locks::*;

mod upload;
pub use upload::*;

mod download;
pub use download::*;

mod manager;
pub use manager::*;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("executor error: {0}")]
    Executor(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Raised by an editor that refuses to show itself.
#[derive(Debug, Error)]
#[error("edit cancelled: {0}")]
pub struct EditCancelled(pub String);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts to either short-lock items for merge or park them behind the
    /// edit session holding them.
    pub merge_lock_retries: u32,
    /// Upper bound of reconciliation passes over one item in one merge.
    pub max_merge_passes: u32,
    pub callback_thread_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            merge_lock_retries: 10,
            max_merge_passes: 16,
            callback_thread_name: "itemsync-callbacks".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: SyncConfig = serde_json::from_str(r#"{"max_merge_passes": 4}"#).unwrap();
        assert_eq!(config.max_merge_passes, 4);
        assert_eq!(config.merge_lock_retries, 10);
        assert_eq!(config.callback_thread_name, "itemsync-callbacks");
    }
}
