use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use itemdb::{default_db_path, DbConfig, ItemDb};
use items::{AttributeMap, ItemId, Shadow};
use itemsync::{
    item_state, server_version, AttributeCommit, ItemUploader, SyncConfig, SyncManager,
    UploadPrepare, UploadProcess,
};

#[derive(Parser)]
#[command(name = "replica-cli")]
#[command(about = "Inspect and drive the offline item replica")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Item database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON config file with `db` and `sync` sections
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a server snapshot, creating the item when no id is given
    Download {
        /// Existing item id
        #[arg(short, long)]
        item: Option<i64>,

        /// Snapshot as a JSON object
        #[arg(long, conflicts_with = "file")]
        json: Option<String>,

        /// File holding the snapshot
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Commit attribute values to one item
    Edit {
        #[arg(short, long)]
        item: i64,

        /// Attribute assignment, `name=value`. Values are parsed as JSON and
        /// fall back to plain strings
        #[arg(short, long = "set")]
        set: Vec<String>,

        /// Remove an attribute
        #[arg(long)]
        unset: Vec<String>,

        /// Mark the item deleted
        #[arg(long)]
        delete: bool,
    },

    /// Merge items with their latest server state
    Merge {
        /// Items to merge; every item with a server shadow when empty
        items: Vec<i64>,
    },

    /// Upload items, acknowledging everything sent as the new server state
    Upload {
        /// Items to upload; every edited item when empty
        items: Vec<i64>,
    },

    /// Print trunk, shadows and state of an item
    Show {
        #[arg(short, long)]
        item: i64,
    },

    /// List items with their state
    List,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    db: DbConfig,
    sync: SyncConfig,
}

impl CliConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = CliConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db.clone() {
        config.db.path = Some(db);
    }
    if config.db.path.is_none() {
        config.db.path = Some(default_db_path());
    }
    info!(path = ?config.db.path, "opening item store");

    let db = ItemDb::open(&config.db).context("failed to open item store")?;
    let manager = SyncManager::with_defaults(db, config.sync)?;
    let mut events = manager.subscribe();

    let worker = manager.clone();
    tokio::task::spawn_blocking(move || run(&worker, cli.command))
        .await
        .context("command panicked")??;

    while let Ok((icn, event)) = events.try_recv() {
        for (item, state) in event.iter() {
            info!(icn, %item, %state, "merged");
        }
    }
    Ok(())
}

fn run(manager: &Arc<SyncManager>, command: Commands) -> Result<()> {
    match command {
        Commands::Download { item, json, file } => {
            let text = match (json, file) {
                (Some(json), _) => json,
                (None, Some(file)) => fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?,
                (None, None) => bail!("either --json or --file is required"),
            };
            let values: AttributeMap =
                serde_json::from_str(&text).context("snapshot must be a JSON object")?;
            let item = match item {
                Some(id) => {
                    let item = ItemId(id);
                    manager
                        .write_downloaded(move |drain| drain.write_server(item, &values))
                        .wait()
                        .with_context(|| format!("failed to store server state of {item}"))?;
                    item
                }
                None => manager
                    .write_downloaded(move |drain| drain.create_item(&values))
                    .wait()
                    .context("failed to create item")?,
            };
            manager.flush()?;
            println!("{}", item);
        }

        Commands::Edit {
            item,
            set,
            unset,
            delete,
        } => {
            let item = ItemId(item);
            let mut commit = AttributeCommit::new();
            for assignment in &set {
                let (attr, value) = parse_assignment(assignment)?;
                commit = commit.set(item, &attr, value);
            }
            for attr in &unset {
                commit = commit.unset(item, attr);
            }
            if delete {
                commit = commit.delete(item);
            }
            let Some(handle) = manager.commit_edit_items(&[item], commit) else {
                bail!("item {item} is being edited elsewhere");
            };
            handle
                .wait()
                .with_context(|| format!("failed to commit {item}"))?;
            manager.flush()?;
            print_item(manager, item)?;
        }

        Commands::Merge { items } => {
            let items = if items.is_empty() {
                manager
                    .db()
                    .read(|r| r.items_with_shadow(Shadow::Download))
                    .wait()?
            } else {
                items.into_iter().map(ItemId).collect()
            };
            info!(items = items.len(), "requesting merge");
            manager.request_auto_merge(&items);
            manager.flush()?;
        }

        Commands::Upload { items } => {
            let items = if items.is_empty() {
                manager
                    .db()
                    .read(|r| r.items_with_shadow(Shadow::Base))
                    .wait()?
            } else {
                items.into_iter().map(ItemId).collect()
            };
            let uploaded = manager.sync_upload(AcknowledgeAll { items })?;
            manager.flush()?;
            info!(items = uploaded.len(), "upload finished");
            for item in uploaded {
                println!("{}", item);
            }
        }

        Commands::Show { item } => print_item(manager, ItemId(item))?,

        Commands::List => {
            let rows = manager
                .db()
                .read(|r| {
                    let mut rows = Vec::new();
                    for item in r.all_items()? {
                        rows.push((item, item_state(r, item)?));
                    }
                    Ok(rows)
                })
                .wait()?;
            for (item, state) in rows {
                println!("{item}\t{state}");
            }
        }
    }
    Ok(())
}

fn parse_assignment(assignment: &str) -> Result<(String, Value)> {
    let Some((attr, raw)) = assignment.split_once('=') else {
        bail!("expected name=value, got {assignment:?}");
    };
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((attr.trim().to_string(), value))
}

fn print_item(manager: &Arc<SyncManager>, item: ItemId) -> Result<()> {
    let (trunk, server, shadows, state) = manager
        .db()
        .read(move |r| {
            let mut shadows = Map::new();
            for shadow in Shadow::ALL {
                if let Some(values) = r.shadow(item, shadow)? {
                    shadows.insert(shadow.to_string(), serde_json::to_value(values)?);
                }
            }
            Ok((r.trunk(item)?, server_version(r, item)?, shadows, item_state(r, item)?))
        })
        .wait()?;
    let Some(trunk) = trunk else {
        bail!("item {item} not found");
    };
    let report = json!({
        "id": item,
        "state": state,
        "trunk": trunk,
        "server": server,
        "shadows": shadows,
        "uploading": manager.is_during_upload(item),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Treats every claimed item as accepted by the server exactly as sent.
struct AcknowledgeAll {
    items: Vec<ItemId>,
}

impl ItemUploader for AcknowledgeAll {
    fn prepare_upload(&mut self, prepare: &mut UploadPrepare<'_, '_>) -> itemdb::Result<()> {
        for item in &self.items {
            if !prepare.add_to_upload(*item)? {
                warn!(%item, "item not uploadable");
            }
        }
        Ok(())
    }

    fn do_upload(&mut self, process: &UploadProcess) -> itemsync::Result<()> {
        for item in process.items() {
            process.set_all_done(item).wait()?;
        }
        Ok(())
    }
}
