use anyhow::Result;
use byte_unit::Byte;
use clap::Parser;

use crate::config::Configuration;
use crate::db::keys;
use crate::ui::open_db;

/// Change persisted engine knobs. A running `serve` picks most of these
/// up at its next start; use the control API for live changes.
#[derive(Debug, Parser)]
pub struct Args {
    /// Upload cap, e.g. "2 MiB" (0 = unlimited)
    #[clap(long)]
    upload_limit: Option<Byte>,

    /// Download cap (0 = unlimited)
    #[clap(long)]
    download_limit: Option<Byte>,

    /// Seconds between scheduled sync rounds
    #[clap(long)]
    sync_interval: Option<u64>,

    /// Worker threads for the transfer reactor
    #[clap(long)]
    transfer_threads: Option<usize>,

    /// Download cache ceiling, e.g. "200 MiB"
    #[clap(long)]
    cache_volume: Option<Byte>,

    #[clap(long)]
    discover_port: Option<u16>,

    #[clap(long)]
    route_port: Option<u16>,

    #[clap(long)]
    data_port: Option<u16>,
}

pub fn run(config: &Configuration, args: Args) -> Result<()> {
    let db = open_db(config)?;
    let mut changed = false;

    let mut set = |key: &str, value: i64| -> Result<()> {
        db.set_setting_i64(key, value)?;
        println!("{key} = {value}");
        Ok(())
    };

    if let Some(b) = args.upload_limit {
        set(keys::UPLOAD_LIMIT, b.as_u64() as i64)?;
        changed = true;
    }
    if let Some(b) = args.download_limit {
        set(keys::DOWNLOAD_LIMIT, b.as_u64() as i64)?;
        changed = true;
    }
    if let Some(secs) = args.sync_interval {
        set(keys::SYNC_INTERVAL_MS, (secs * 1000) as i64)?;
        changed = true;
    }
    if let Some(n) = args.transfer_threads {
        set(keys::TRANSFER_THREADS, n.max(1) as i64)?;
        changed = true;
    }
    if let Some(b) = args.cache_volume {
        set(keys::CACHE_VOLUME, b.as_u64() as i64)?;
        changed = true;
    }
    if let Some(p) = args.discover_port {
        set(keys::DISCOVER_PORT, p as i64)?;
        changed = true;
    }
    if let Some(p) = args.route_port {
        set(keys::ROUTE_PORT, p as i64)?;
        changed = true;
    }
    if let Some(p) = args.data_port {
        set(keys::DATA_PORT, p as i64)?;
        changed = true;
    }

    if !changed {
        anyhow::bail!("nothing to set; see --help for the knobs");
    }
    Ok(())
}
