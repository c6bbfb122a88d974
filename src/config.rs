//! Bootstrap configuration: where the device store lives, what we're
//! called, which ports to bind.
//!
//! Runtime-tunable knobs (limits, intervals, cache volume) live in the
//! settings table so `set_*` control operations persist; this file only
//! seeds their first values.

use std::{fs, io};

use anyhow::Context;
use byte_unit::Byte;
use camino::Utf8PathBuf;
use serde_derive::Deserialize;

use crate::errors::{Error, Result};

pub const DEFAULT_ROUTE_PORT: u16 = 8846;
pub const DEFAULT_DATA_PORT: u16 = 8847;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Where the device store and download cache live.
    /// Defaults to `~/.zisync`.
    pub data_dir: Option<Utf8PathBuf>,
    /// Defaults to the hostname.
    pub device_name: Option<String>,
    pub route_port: Option<u16>,
    pub data_port: Option<u16>,
    /// Absolute paths matching any of these regexes are never indexed.
    #[serde(default)]
    pub skips: Vec<String>,
    /// Initial byte-per-second caps; absent or zero means unlimited.
    pub upload_limit: Option<Byte>,
    pub download_limit: Option<Byte>,
}

impl Configuration {
    pub fn data_dir(&self) -> Result<Utf8PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let mut dir: Utf8PathBuf = home::home_dir()
            .ok_or_else(|| Error::config("can't find home directory"))?
            .try_into()
            .map_err(|_| Error::config("home directory isn't UTF-8"))?;
        dir.push(".zisync");
        Ok(dir)
    }

    pub fn device_name(&self) -> String {
        if let Some(name) = &self.device_name {
            return name.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "zisync-device".to_owned())
    }

    pub fn route_port(&self) -> u16 {
        self.route_port.unwrap_or(DEFAULT_ROUTE_PORT)
    }

    pub fn data_port(&self) -> u16 {
        self.data_port.unwrap_or(DEFAULT_DATA_PORT)
    }
}

/// Load `~/.config/zisync.toml`, or defaults when it doesn't exist.
pub fn load() -> anyhow::Result<Configuration> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Can't find home directory"))?
        .try_into()
        .ok()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "zisync.toml"]);
    load_from(&confpath)
}

pub fn load_from(confpath: &Utf8PathBuf) -> anyhow::Result<Configuration> {
    let s = match fs::read_to_string(confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(conf)
}
