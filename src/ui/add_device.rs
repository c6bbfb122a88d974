use anyhow::Result;
use clap::Parser;

use crate::config::Configuration;
use crate::db::Device;
use crate::ui::open_db;

/// Record a paired peer device.
#[derive(Debug, Parser)]
pub struct Args {
    /// The peer's device uuid (from `init` on that machine)
    uuid: String,
    /// Where to reach it
    host: String,

    #[clap(long)]
    name: Option<String>,

    #[clap(long, default_value_t = crate::config::DEFAULT_DATA_PORT)]
    data_port: u16,

    #[clap(long, default_value_t = crate::config::DEFAULT_ROUTE_PORT)]
    route_port: u16,
}

pub fn run(config: &Configuration, args: Args) -> Result<()> {
    let db = open_db(config)?;
    db.put_device(&Device {
        uuid: args.uuid.clone(),
        name: args.name.unwrap_or_else(|| args.host.clone()),
        platform: String::new(),
        host: args.host,
        route_port: args.route_port,
        data_port: args.data_port,
        trusted: true,
        deleted: false,
    })?;
    println!("{}", args.uuid);
    Ok(())
}
