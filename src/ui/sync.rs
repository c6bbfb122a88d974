use anyhow::Result;
use clap::Parser;
use console::style;

use crate::config::Configuration;
use crate::engine::Engine;
use crate::ui::find_sync;

/// Sync one folder with its peers, right now.
#[derive(Debug, Parser)]
pub struct Args {
    /// Sync uuid or name
    sync: String,
}

pub fn run(config: &Configuration, args: Args) -> Result<()> {
    let engine = Engine::start(config)?;
    let result = (|| -> Result<()> {
        let sync = find_sync(engine.db(), &args.sync)?;
        engine.sync_once(&sync.uuid)?;

        for tree in engine.db().trees_of_sync(&sync.uuid)? {
            if tree.device_uuid != engine.device_uuid() {
                continue;
            }
            let status = engine.query_tree_status(&tree.uuid);
            println!(
                "{} {}: {} files / {} bytes moved, {} files skipped",
                style("synced").green(),
                tree.root,
                status.files_transferred,
                status.bytes_transferred,
                status.files_skipped,
            );
        }
        Ok(())
    })();
    engine.shutdown();
    result
}
