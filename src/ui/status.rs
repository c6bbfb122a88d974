use anyhow::Result;
use clap::Parser;
use console::style;

use crate::config::Configuration;
use crate::ui::open_db;

/// Show syncs, trees, and peers known to this device.
#[derive(Debug, Parser)]
pub struct Args {}

pub fn run(config: &Configuration, _args: Args) -> Result<()> {
    let db = open_db(config)?;
    let self_uuid = db
        .setting_str(crate::db::keys::SELF_DEVICE)?
        .unwrap_or_default();

    for sync in db.sync_folders()? {
        println!(
            "{} {} ({}, {})",
            style(&sync.name).bold(),
            style(&sync.uuid).dim(),
            sync.perm.as_str(),
            sync.kind.as_str(),
        );
        for tree in db.trees_of_sync(&sync.uuid)? {
            let place = if tree.device_uuid == self_uuid {
                "here".to_owned()
            } else {
                match db.try_device(&tree.device_uuid)? {
                    Some(d) => format!("on {}", d.name),
                    None => format!("on {}", tree.device_uuid),
                }
            };
            let role = match tree.role {
                crate::db::TreeRole::None => String::new(),
                other => format!(" [{}]", other.as_str()),
            };
            println!(
                "  {} {} {place}{role}{}",
                style(&tree.uuid).dim(),
                tree.root,
                if tree.enabled { "" } else { " (disabled)" },
            );
        }
    }

    let devices = db.devices()?;
    if !devices.is_empty() {
        println!("{}", style("devices:").bold());
        for d in devices {
            let marker = if d.uuid == self_uuid { " (this one)" } else { "" };
            println!("  {} {} {}:{}{marker}", style(&d.uuid).dim(), d.name, d.host, d.data_port);
        }
    }
    Ok(())
}
