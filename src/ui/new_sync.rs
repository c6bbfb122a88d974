use anyhow::{Context, Result};
use clap::Parser;
use uuid::Uuid;

use crate::config::Configuration;
use crate::db::{SyncFolder, SyncKind, SyncPerm, keys};
use crate::ui::open_db;

/// Create a sync folder (a group of trees to keep consistent).
#[derive(Debug, Parser)]
pub struct Args {
    name: String,

    /// rdonly, wronly, rdwr, or disconnected
    #[clap(long, default_value = "rdwr")]
    perm: String,

    /// normal, backup, or shared
    #[clap(long, default_value = "normal")]
    kind: String,
}

pub fn run(config: &Configuration, args: Args) -> Result<()> {
    let db = open_db(config)?;
    let creator = db
        .setting_str(keys::SELF_DEVICE)?
        .context("store has no device identity; run init first")?;
    let sync = SyncFolder {
        uuid: Uuid::new_v4().to_string(),
        name: args.name,
        perm: SyncPerm::parse(&args.perm)?,
        kind: SyncKind::parse(&args.kind)?,
        creator,
        deleted: false,
    };
    db.put_sync(&sync)?;
    println!("{}", sync.uuid);
    Ok(())
}
