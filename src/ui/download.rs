use std::io::Write;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use crate::config::Configuration;
use crate::engine::Engine;
use crate::ui::find_sync;

/// Fetch one file from a peer into the download cache (and out).
#[derive(Debug, Parser)]
pub struct Args {
    /// Sync uuid or name
    sync: String,
    /// Tree-relative path, e.g. /docs/report.pdf
    path: String,

    /// Write here instead of stdout
    #[clap(short, long)]
    output: Option<Utf8PathBuf>,
}

pub fn run(config: &Configuration, args: Args) -> Result<()> {
    let engine = Engine::start(config)?;
    let result = (|| -> Result<()> {
        let sync = find_sync(engine.db(), &args.sync)?;
        let bytes = engine.download_file(&sync.uuid, &args.path)?;
        match &args.output {
            Some(path) => std::fs::write(path, &bytes)?,
            None => std::io::stdout().write_all(&bytes)?,
        }
        Ok(())
    })();
    engine.shutdown();
    result
}
