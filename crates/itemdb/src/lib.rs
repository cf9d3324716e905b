//! Transactional item store backing the replica.
//!
//! Every item is one SQLite row holding its trunk attributes, its local
//! history and the optional shadow snapshots used by the merge engine.
//! Transactions run one at a time on a dedicated worker thread; callers get a
//! [`TxHandle`] and are never blocked by the store itself.
use std::path::PathBuf;
use thiserror::Error;

use items::{ItemId, ItemsError};

mod db;
pub use db::*;
mod tx;
pub use tx::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("item data error: {0}")]
    Items(#[from] ItemsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("transaction cancelled")]
    Cancelled,

    #[error("store closed")]
    Closed,
}

impl StoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StoreError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("replica")
}

pub fn default_db_path() -> PathBuf {
    app_data_dir().join("items.db")
}
