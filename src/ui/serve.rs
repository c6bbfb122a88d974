use anyhow::Result;
use clap::Parser;
use tracing::*;

use crate::config::Configuration;
use crate::engine::Engine;

/// Run the sync engine until Ctrl-C.
#[derive(Debug, Parser)]
pub struct Args {}

pub fn run(config: &Configuration, _args: Args) -> Result<()> {
    let engine = Engine::start(config)?;
    info!("serving; Ctrl-C to stop");
    engine.wait_for_ctrl_c();
    engine.shutdown();
    Ok(())
}
