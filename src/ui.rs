//! CLI subcommands. Thin wrappers over [`Engine`](crate::engine::Engine)
//! and the device store.

use anyhow::{Context, Result};

use crate::config::Configuration;
use crate::db::Db;

pub mod add_device;
pub mod add_tree;
pub mod download;
pub mod favorite;
pub mod index;
pub mod init;
pub mod new_sync;
pub mod serve;
pub mod set;
pub mod status;
pub mod sync;

/// Open the device store directly, for commands that don't need a
/// running engine.
pub(crate) fn open_db(config: &Configuration) -> Result<Db> {
    let dir = config.data_dir()?;
    std::fs::create_dir_all(&dir).with_context(|| format!("Couldn't create {dir}"))?;
    Ok(Db::open(&dir.join("zisync.db"))?)
}

/// Resolve a sync given either its uuid or its (unique) name.
pub(crate) fn find_sync(db: &Db, id_or_name: &str) -> Result<crate::db::SyncFolder> {
    if let Ok(sync) = db.sync_folder(id_or_name) {
        return Ok(sync);
    }
    let matches: Vec<_> = db
        .sync_folders()?
        .into_iter()
        .filter(|s| s.name == id_or_name)
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no sync named {id_or_name}"),
        1 => Ok(matches.into_iter().next().unwrap()),
        _ => anyhow::bail!("{id_or_name} is ambiguous; use the uuid"),
    }
}
