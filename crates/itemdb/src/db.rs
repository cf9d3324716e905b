use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crate::{CommitNotice, FinallyFn, Reader, Result, StoreError, TxHandle, Writer};

type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// Database file. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    pub journal_mode: String,
    pub synchronous: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: None,
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
        }
    }
}

impl DbConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
}

struct Shared {
    last_icn: AtomicU64,
    subscribers: Mutex<Vec<Sender<CommitNotice>>>,
}

/// Handle to the item store. Cloning is cheap; the worker thread stops once
/// every handle is dropped.
#[derive(Clone)]
pub struct ItemDb {
    jobs: Sender<Job>,
    shared: Arc<Shared>,
}

impl ItemDb {
    pub fn open(config: &DbConfig) -> Result<Self> {
        let conn = match &config.path {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                let conn = Connection::open(path)?;
                conn.pragma_update(None, "journal_mode", &config.journal_mode)?;
                conn.pragma_update(None, "synchronous", &config.synchronous)?;
                conn
            }
            None => Connection::open_in_memory()?,
        };
        apply_migrations(&conn)?;
        let last_icn: i64 =
            conn.query_row("SELECT last_icn FROM transactions WHERE id = 1", [], |row| {
                row.get(0)
            })?;

        let (jobs, rx_jobs) = unbounded::<Job>();
        let shared = Arc::new(Shared {
            last_icn: AtomicU64::new(last_icn.max(0) as u64),
            subscribers: Mutex::new(Vec::new()),
        });
        thread::Builder::new()
            .name("itemdb-worker".to_string())
            .spawn(move || run_worker(conn, rx_jobs))?;

        tracing::debug!(path = ?config.path, last_icn, "item store opened");
        Ok(Self { jobs, shared })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(&DbConfig::in_memory())
    }

    /// Number of the last committed write transaction.
    pub fn last_icn(&self) -> u64 {
        self.shared.last_icn.load(Ordering::SeqCst)
    }

    /// Receives a notice after every committed write transaction.
    pub fn subscribe(&self) -> Receiver<CommitNotice> {
        let (tx, rx) = unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Queues a read transaction.
    pub fn read<T, F>(&self, f: F) -> TxHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&Reader<'_>) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let shared = self.shared.clone();
        let job: Job = Box::new(move |conn| {
            let result = match conn.transaction() {
                Ok(txn) => {
                    let reader = Reader::new(&txn, shared.last_icn.load(Ordering::SeqCst));
                    f(&reader)
                }
                Err(err) => Err(err.into()),
            };
            let _ = tx.send(result);
        });
        self.submit(job, rx)
    }

    /// Queues a write transaction. Returning an error from `f` rolls back
    /// every change it made.
    pub fn write<T, F>(&self, f: F) -> TxHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Writer<'_>) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let shared = self.shared.clone();
        let job: Job = Box::new(move |conn| {
            let icn = shared.last_icn.load(Ordering::SeqCst) + 1;
            let (result, finally, notice) = run_write(conn, icn, f);
            let success = result.is_ok();
            if success {
                shared.last_icn.store(icn, Ordering::SeqCst);
            }
            for callback in finally {
                callback(success);
            }
            if let Some(notice) = notice {
                shared
                    .subscribers
                    .lock()
                    .retain(|sub| sub.send(notice.clone()).is_ok());
            }
            let _ = tx.send(result);
        });
        self.submit(job, rx)
    }

    fn submit<T>(&self, job: Job, rx: Receiver<Result<T>>) -> TxHandle<T> {
        if self.jobs.send(job).is_err() {
            return TxHandle::failed(StoreError::Closed);
        }
        TxHandle::new(rx)
    }
}

fn run_worker(mut conn: Connection, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        job(&mut conn);
    }
    tracing::debug!("item store worker stopped");
}

fn run_write<T, F>(
    conn: &mut Connection,
    icn: u64,
    f: F,
) -> (Result<T>, Vec<FinallyFn>, Option<CommitNotice>)
where
    F: FnOnce(&mut Writer<'_>) -> Result<T>,
{
    let txn = match conn.transaction() {
        Ok(txn) => txn,
        Err(err) => return (Err(err.into()), Vec::new(), None),
    };
    let mut writer = Writer::new(&txn, icn);
    let outcome = f(&mut writer);
    let (finally, touched) = writer.into_parts();

    let value = match outcome {
        Ok(value) => value,
        Err(err) => {
            if !err.is_cancelled() {
                tracing::warn!(icn, error = %err, "write transaction rolled back");
            }
            return (Err(err), finally, None);
        }
    };
    let committed = txn
        .execute(
            "UPDATE transactions SET last_icn = ?1 WHERE id = 1",
            params![icn as i64],
        )
        .map_err(StoreError::from)
        .and_then(|_| txn.commit().map_err(StoreError::from));
    match committed {
        Ok(()) => {
            let notice = CommitNotice {
                icn,
                items: touched.into_iter().collect(),
            };
            (Ok(value), finally, Some(notice))
        }
        Err(err) => {
            tracing::error!(icn, error = %err, "failed to commit write transaction");
            (Err(err), finally, None)
        }
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(include_str!("../migrations/V0001__items.sql"))?;
    conn.execute(
        "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
        params!["V0001__items"],
    )?;
    Ok(())
}
