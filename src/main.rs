use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use zisync::config;
use zisync::ui;

/// Keep folders in sync across your devices.
#[derive(Debug, Parser)]
#[command(version, about, verbatim_doc_comment)]
struct Args {
    /// Verbosity (-v, -vv, -vvv, etc.)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (defaults to ~/.config/zisync.toml)
    #[clap(short, long)]
    config: Option<Utf8PathBuf>,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    Init(ui::init::Args),
    Serve(ui::serve::Args),
    Sync(ui::sync::Args),
    Index(ui::index::Args),
    NewSync(ui::new_sync::Args),
    AddTree(ui::add_tree::Args),
    AddDevice(ui::add_device::Args),
    Favorite(ui::favorite::Args),
    Status(ui::status::Args),
    Set(ui::set::Args),
    Download(ui::download::Args),
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    let config = match &args.config {
        Some(path) => config::load_from(path)?,
        None => config::load()?,
    };

    match args.subcommand {
        Subcommand::Init(a) => ui::init::run(&config, a),
        Subcommand::Serve(a) => ui::serve::run(&config, a),
        Subcommand::Sync(a) => ui::sync::run(&config, a),
        Subcommand::Index(a) => ui::index::run(&config, a),
        Subcommand::NewSync(a) => ui::new_sync::run(&config, a),
        Subcommand::AddTree(a) => ui::add_tree::run(&config, a),
        Subcommand::AddDevice(a) => ui::add_device::run(&config, a),
        Subcommand::Favorite(a) => ui::favorite::run(&config, a),
        Subcommand::Status(a) => ui::status::run(&config, a),
        Subcommand::Set(a) => ui::set::run(&config, a),
        Subcommand::Download(a) => ui::download::run(&config, a),
    }
}

/// Spit messages to stderr; `-v`s raise the floor.
fn init_logger(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("zisync={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
