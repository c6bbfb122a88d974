use anyhow::Result;
use clap::Parser;

use crate::config::Configuration;
use crate::ui::open_db;

/// Manage a tree's whitelist of synced paths.
#[derive(Debug, Parser)]
pub struct Args {
    #[clap(subcommand)]
    what: What,
}

#[derive(Debug, clap::Subcommand)]
enum What {
    /// Whitelist a path (collapses entries beneath it)
    Add { tree: String, path: String },
    /// Remove a whitelist entry
    Rm { tree: String, path: String },
    /// Show the current entries
    Ls { tree: String },
}

pub fn run(config: &Configuration, args: Args) -> Result<()> {
    let db = open_db(config)?;
    match args.what {
        What::Add { tree, path } => {
            crate::meta::check_rel(&path)?;
            if !db.add_favorite(&tree, &path)? {
                println!("{path} was already covered");
            }
        }
        What::Rm { tree, path } => {
            if !db.remove_favorite(&tree, &path)? {
                anyhow::bail!("{path} isn't an entry (ls to see them)");
            }
        }
        What::Ls { tree } => {
            for entry in db.synclist(&tree)?.entries() {
                println!("{entry}");
            }
        }
    }
    Ok(())
}
