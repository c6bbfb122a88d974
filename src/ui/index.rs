use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;

use crate::abort::Abort;
use crate::config::Configuration;
use crate::indexer;
use crate::notify::Notifier;
use crate::tree_mutex::TreeMutex;
use crate::ui::open_db;

/// Re-scan a local tree and refresh its metadata rows.
#[derive(Debug, Parser)]
pub struct Args {
    /// Tree uuid
    tree: String,
}

pub fn run(config: &Configuration, args: Args) -> Result<()> {
    let db = open_db(config)?;
    let tree = db.tree(&args.tree)?;

    let skips = config
        .skips
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("bad skip pattern {p:?}")))
        .collect::<Result<Vec<_>>>()?;
    let self_device = db
        .setting_str(crate::db::keys::SELF_DEVICE)?
        .context("store has no device identity; run init first")?;

    let outcome = indexer::index_tree(
        &db,
        &tree,
        &self_device,
        &TreeMutex::new(),
        &Abort::new(),
        &Notifier::new(),
        &skips,
    )?;
    println!(
        "{} new, {} changed, {} removed",
        outcome.inserted, outcome.updated, outcome.removed
    );
    for failed in &outcome.sha1_failures {
        eprintln!("couldn't hash {failed}; it'll be retried next run");
    }
    Ok(())
}
