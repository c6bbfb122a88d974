//! Smoke the CLI end to end: a throwaway config, a sync, a tree, a
//! favorite.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;

fn cli(config: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME"))?;
    cmd.arg("--config").arg(config);
    Ok(cmd)
}

fn write_config(dir: &Path) -> PathBuf {
    let config = dir.join("zisync.toml");
    let data_dir = dir.join("state");
    fs::write(
        &config,
        format!(
            "data_dir = \"{}\"\ndevice_name = \"cli-test\"\ndata_port = 0\n",
            data_dir.display()
        ),
    )
    .unwrap();
    config
}

#[test]
fn init_creates_an_identity() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = write_config(dir.path());

    cli(&config)?
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("device uuid:"));
    assert!(dir.path().join("state/zisync.db").exists());
    Ok(())
}

#[test]
fn sync_tree_and_favorite_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = write_config(dir.path());
    cli(&config)?.arg("init").assert().success();

    let out = cli(&config)?
        .args(["new-sync", "docs"])
        .assert()
        .success();
    let sync_uuid = String::from_utf8(out.get_output().stdout.clone())?
        .trim()
        .to_owned();

    let root = dir.path().join("docs-root");
    let out = cli(&config)?
        .arg("add-tree")
        .arg(&sync_uuid)
        .arg(&root)
        .assert()
        .success();
    let tree_uuid = String::from_utf8(out.get_output().stdout.clone())?
        .trim()
        .to_owned();
    assert!(root.is_dir());

    cli(&config)?
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("docs").and(predicate::str::contains(&tree_uuid)));

    // Narrow the whitelist and read it back.
    cli(&config)?
        .args(["favorite", "rm", &tree_uuid, "/"])
        .assert()
        .success();
    cli(&config)?
        .args(["favorite", "add", &tree_uuid, "/keep"])
        .assert()
        .success();
    cli(&config)?
        .args(["favorite", "ls", &tree_uuid])
        .assert()
        .success()
        .stdout(predicate::str::contains("/keep"));

    // Unknown trees simply have no entries.
    cli(&config)?
        .args(["favorite", "ls", "not-a-tree"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    Ok(())
}
