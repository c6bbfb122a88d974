use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use uuid::Uuid;

use crate::config::Configuration;
use crate::db::{Tree, TreeRole, keys};
use crate::ui::{find_sync, open_db};

/// Join a directory to a sync - this device's, or a record of a peer's.
#[derive(Debug, Parser)]
pub struct Args {
    /// Sync uuid or name
    sync: String,

    /// The tree root. For a remote tree this is the path on the peer.
    root: Utf8PathBuf,

    /// none, backup-src, or backup-dst
    #[clap(long, default_value = "none")]
    role: String,

    /// Register a peer's tree instead: the device uuid it lives on.
    #[clap(long, requires = "tree_uuid")]
    device: Option<String>,

    /// The peer's tree uuid (learned during pairing).
    #[clap(long)]
    tree_uuid: Option<String>,
}

pub fn run(config: &Configuration, args: Args) -> Result<()> {
    let db = open_db(config)?;
    let sync = find_sync(&db, &args.sync)?;
    let role = TreeRole::parse(&args.role)?;

    let (uuid, device_uuid) = match (&args.device, &args.tree_uuid) {
        (Some(device), Some(tree_uuid)) => {
            db.device(device)?;
            (tree_uuid.clone(), device.clone())
        }
        _ => {
            let self_device = db
                .setting_str(keys::SELF_DEVICE)?
                .context("store has no device identity; run init first")?;
            anyhow::ensure!(args.root.is_absolute(), "tree root must be absolute");
            std::fs::create_dir_all(&args.root)?;
            (Uuid::new_v4().to_string(), self_device)
        }
    };

    db.put_tree(&Tree {
        uuid: uuid.clone(),
        sync_uuid: sync.uuid,
        device_uuid,
        root: args.root,
        role,
        enabled: true,
    })?;
    println!("{uuid}");
    Ok(())
}
