use anyhow::Result;
use clap::Parser;

use crate::config::Configuration;
use crate::engine::Engine;

/// Create the device store and print this device's identity.
#[derive(Debug, Parser)]
pub struct Args {}

pub fn run(config: &Configuration, _args: Args) -> Result<()> {
    let engine = Engine::start(config)?;
    println!("device uuid: {}", engine.device_uuid());
    println!("data dir:    {}", config.data_dir()?);
    if let Some(addr) = engine.data_addr() {
        println!("data plane:  {addr}");
    }
    engine.shutdown();
    Ok(())
}
