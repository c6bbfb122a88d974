//! The device store: who we are, which syncs and trees exist, the
//! whitelist entries, and the runtime-tunable settings.
//!
//! One sqlite file per device. File metadata lives in the same file but is
//! owned by [`MetaStore`](crate::store::MetaStore), which opens its own
//! connections so readers can snapshot while a writer batch runs (WAL).

use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::*;

use crate::errors::{Error, Result};
use crate::meta::is_ancestor;
use crate::synclist::SyncList;

/// A peer (or this machine). Rows appear on pairing and are soft-deleted
/// on unbind so history stays attributable.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Device {
    pub uuid: String,
    pub name: String,
    pub platform: String,
    pub host: String,
    pub route_port: u16,
    pub data_port: u16,
    pub trusted: bool,
    pub deleted: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncPerm {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    Disconnected,
}

impl SyncPerm {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPerm::ReadOnly => "rdonly",
            SyncPerm::WriteOnly => "wronly",
            SyncPerm::ReadWrite => "rdwr",
            SyncPerm::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "rdonly" => Ok(SyncPerm::ReadOnly),
            "wronly" => Ok(SyncPerm::WriteOnly),
            "rdwr" => Ok(SyncPerm::ReadWrite),
            "disconnected" => Ok(SyncPerm::Disconnected),
            other => Err(Error::config(format!("unknown sync permission {other}"))),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncKind {
    Normal,
    Backup,
    Shared,
}

impl SyncKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncKind::Normal => "normal",
            SyncKind::Backup => "backup",
            SyncKind::Shared => "shared",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(SyncKind::Normal),
            "backup" => Ok(SyncKind::Backup),
            "shared" => Ok(SyncKind::Shared),
            other => Err(Error::config(format!("unknown sync type {other}"))),
        }
    }
}

/// A logical grouping of trees across devices that should stay consistent.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SyncFolder {
    pub uuid: String,
    pub name: String,
    pub perm: SyncPerm,
    pub kind: SyncKind,
    pub creator: String,
    pub deleted: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TreeRole {
    None,
    BackupSrc,
    BackupDst,
}

impl TreeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TreeRole::None => "none",
            TreeRole::BackupSrc => "backup-src",
            TreeRole::BackupDst => "backup-dst",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(TreeRole::None),
            "backup-src" => Ok(TreeRole::BackupSrc),
            "backup-dst" => Ok(TreeRole::BackupDst),
            other => Err(Error::config(format!("unknown tree role {other}"))),
        }
    }
}

/// A directory on one device participating in a sync.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Tree {
    pub uuid: String,
    pub sync_uuid: String,
    pub device_uuid: String,
    pub root: Utf8PathBuf,
    pub role: TreeRole,
    pub enabled: bool,
}

/// Runtime-tunable knobs, persisted in the settings table.
pub mod keys {
    pub const SELF_DEVICE: &str = "self_device";
    pub const DISCOVER_PORT: &str = "discover_port";
    pub const ROUTE_PORT: &str = "route_port";
    pub const DATA_PORT: &str = "data_port";
    pub const UPLOAD_LIMIT: &str = "upload_limit";
    pub const DOWNLOAD_LIMIT: &str = "download_limit";
    pub const SYNC_INTERVAL_MS: &str = "sync_interval_ms";
    pub const TRANSFER_THREADS: &str = "transfer_threads";
    pub const CACHE_VOLUME: &str = "cache_volume";
}

/// Ten minutes between scheduled rounds unless configured otherwise.
pub const DEFAULT_SYNC_INTERVAL_MS: i64 = 600_000;

pub struct Db {
    conn: Mutex<Connection>,
    path: Utf8PathBuf,
}

impl Db {
    /// Open (creating and migrating as needed) the device store at `path`.
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;

        let jm: String = conn.query_row("PRAGMA journal_mode=wal", (), |r| r.get(0))?;
        if jm != "wal" && jm != "memory" {
            return Err(Error::config(format!("couldn't set WAL mode on {path}")));
        }

        let tx = conn.transaction()?;
        let ver: i32 = tx.query_row("PRAGMA user_version", (), |r| r.get(0))?;
        if ver < 1 {
            tx.execute_batch(
                "CREATE TABLE devices (
                    uuid TEXT NOT NULL PRIMARY KEY,
                    name TEXT NOT NULL,
                    platform TEXT NOT NULL,
                    host TEXT NOT NULL,
                    route_port INTEGER NOT NULL,
                    data_port INTEGER NOT NULL,
                    trusted INTEGER NOT NULL,
                    deleted INTEGER NOT NULL DEFAULT 0
                ) STRICT;
                CREATE TABLE syncs (
                    uuid TEXT NOT NULL PRIMARY KEY,
                    name TEXT NOT NULL,
                    perm TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    creator TEXT NOT NULL,
                    deleted INTEGER NOT NULL DEFAULT 0
                ) STRICT;
                CREATE TABLE trees (
                    uuid TEXT NOT NULL PRIMARY KEY,
                    sync_uuid TEXT NOT NULL,
                    device_uuid TEXT NOT NULL,
                    root TEXT NOT NULL,
                    role TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1
                ) STRICT;
                CREATE TABLE synclist (
                    tree TEXT NOT NULL,
                    path TEXT NOT NULL,
                    PRIMARY KEY (tree, path)
                ) STRICT;
                CREATE TABLE settings (
                    key TEXT NOT NULL PRIMARY KEY,
                    value NOT NULL
                );
                CREATE TABLE files (
                    tree TEXT NOT NULL,
                    path TEXT NOT NULL,
                    kind INTEGER NOT NULL,
                    status INTEGER NOT NULL,
                    mtime INTEGER NOT NULL,
                    length INTEGER NOT NULL,
                    sha1 BLOB,
                    usn INTEGER NOT NULL,
                    vclock BLOB NOT NULL,
                    win_attr INTEGER NOT NULL DEFAULT 0,
                    unix_attr INTEGER NOT NULL DEFAULT 0,
                    android_attr INTEGER NOT NULL DEFAULT 0,
                    alias TEXT,
                    modifier TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    PRIMARY KEY (tree, path)
                ) STRICT;
                CREATE INDEX files_by_usn ON files (tree, usn);
                CREATE TABLE usns (
                    tree TEXT NOT NULL PRIMARY KEY,
                    next INTEGER NOT NULL
                ) STRICT;",
            )?;
        }
        tx.execute("PRAGMA user_version=1", ())?;
        tx.commit()?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    // Devices

    pub fn put_device(&self, d: &Device) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "REPLACE INTO devices (uuid, name, platform, host, route_port, data_port, trusted, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                d.uuid,
                d.name,
                d.platform,
                d.host,
                d.route_port,
                d.data_port,
                d.trusted,
                d.deleted
            ],
        )?;
        Ok(())
    }

    pub fn device(&self, uuid: &str) -> Result<Device> {
        self.try_device(uuid)?
            .ok_or_else(|| Error::not_found(format!("device {uuid}")))
    }

    pub fn try_device(&self, uuid: &str) -> Result<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        let found = conn
            .query_row(
                "SELECT uuid, name, platform, host, route_port, data_port, trusted, deleted
                 FROM devices WHERE uuid = ?1",
                [uuid],
                row_to_device,
            )
            .optional()?;
        Ok(found)
    }

    pub fn devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn.lock().unwrap();
        let devices = conn
            .prepare(
                "SELECT uuid, name, platform, host, route_port, data_port, trusted, deleted
                 FROM devices WHERE deleted = 0 ORDER BY uuid",
            )?
            .query_map((), row_to_device)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(devices)
    }

    /// Soft-delete: the row stays so old modifier uuids keep resolving.
    pub fn unbind_device(&self, uuid: &str) -> Result<()> {
        let n = self
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE devices SET deleted = 1 WHERE uuid = ?1", [uuid])?;
        if n == 0 {
            return Err(Error::not_found(format!("device {uuid}")));
        }
        Ok(())
    }

    // Syncs

    pub fn put_sync(&self, s: &SyncFolder) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "REPLACE INTO syncs (uuid, name, perm, kind, creator, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                s.uuid,
                s.name,
                s.perm.as_str(),
                s.kind.as_str(),
                s.creator,
                s.deleted
            ],
        )?;
        Ok(())
    }

    pub fn sync_folder(&self, uuid: &str) -> Result<SyncFolder> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT uuid, name, perm, kind, creator, deleted FROM syncs WHERE uuid = ?1",
            [uuid],
            row_to_sync,
        )
        .optional()?
        .filter(|s| !s.deleted)
        .ok_or_else(|| Error::not_found(format!("sync {uuid}")))
    }

    pub fn sync_folders(&self) -> Result<Vec<SyncFolder>> {
        let conn = self.conn.lock().unwrap();
        let syncs = conn
            .prepare("SELECT uuid, name, perm, kind, creator, deleted FROM syncs WHERE deleted = 0 ORDER BY name")?
            .query_map((), row_to_sync)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(syncs)
    }

    /// Destroying a sync destroys its trees and their metadata.
    pub fn destroy_sync(&self, uuid: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let n = tx.execute("UPDATE syncs SET deleted = 1 WHERE uuid = ?1 AND deleted = 0", [uuid])?;
        if n == 0 {
            return Err(Error::not_found(format!("sync {uuid}")));
        }
        tx.execute(
            "DELETE FROM files WHERE tree IN (SELECT uuid FROM trees WHERE sync_uuid = ?1)",
            [uuid],
        )?;
        tx.execute(
            "DELETE FROM usns WHERE tree IN (SELECT uuid FROM trees WHERE sync_uuid = ?1)",
            [uuid],
        )?;
        tx.execute(
            "DELETE FROM synclist WHERE tree IN (SELECT uuid FROM trees WHERE sync_uuid = ?1)",
            [uuid],
        )?;
        tx.execute("DELETE FROM trees WHERE sync_uuid = ?1", [uuid])?;
        tx.commit()?;
        info!("destroyed sync {uuid}");
        Ok(())
    }

    // Trees

    /// Insert a tree, rejecting nested roots on the same device.
    pub fn put_tree(&self, t: &Tree) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "SELECT root FROM trees WHERE device_uuid = ?1 AND sync_uuid = ?2 AND uuid != ?3",
            )?;
            let roots = stmt
                .query_map(params![t.device_uuid, t.sync_uuid, t.uuid], |r| {
                    r.get::<_, String>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for other in roots {
                let a = t.root.as_str();
                if a == other || is_root_nested(a, &other) || is_root_nested(&other, a) {
                    return Err(Error::conflict(format!(
                        "tree root {a} nests with existing root {other}"
                    )));
                }
            }
        }
        tx.execute(
            "REPLACE INTO trees (uuid, sync_uuid, device_uuid, root, role, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                t.uuid,
                t.sync_uuid,
                t.device_uuid,
                t.root.as_str(),
                t.role.as_str(),
                t.enabled
            ],
        )?;
        // New trees start whitelisting everything.
        tx.execute(
            "INSERT OR IGNORE INTO synclist (tree, path) VALUES (?1, '/')",
            [&t.uuid],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn tree(&self, uuid: &str) -> Result<Tree> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT uuid, sync_uuid, device_uuid, root, role, enabled FROM trees WHERE uuid = ?1",
            [uuid],
            row_to_tree,
        )
        .optional()?
        .ok_or_else(|| Error::not_found(format!("tree {uuid}")))
    }

    pub fn trees_of_sync(&self, sync_uuid: &str) -> Result<Vec<Tree>> {
        let conn = self.conn.lock().unwrap();
        let trees = conn
            .prepare(
                "SELECT uuid, sync_uuid, device_uuid, root, role, enabled
                 FROM trees WHERE sync_uuid = ?1 ORDER BY uuid",
            )?
            .query_map([sync_uuid], row_to_tree)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(trees)
    }

    pub fn destroy_tree(&self, uuid: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let n = tx.execute("DELETE FROM trees WHERE uuid = ?1", [uuid])?;
        if n == 0 {
            return Err(Error::not_found(format!("tree {uuid}")));
        }
        tx.execute("DELETE FROM files WHERE tree = ?1", [uuid])?;
        tx.execute("DELETE FROM usns WHERE tree = ?1", [uuid])?;
        tx.execute("DELETE FROM synclist WHERE tree = ?1", [uuid])?;
        tx.commit()?;
        info!("destroyed tree {uuid}");
        Ok(())
    }

    /// All tree uuids participating in a sync, ordered. This is the vclock
    /// alignment list the manifest carries.
    pub fn sync_tree_uuids(&self, sync_uuid: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let uuids = conn
            .prepare("SELECT uuid FROM trees WHERE sync_uuid = ?1 ORDER BY uuid")?
            .query_map([sync_uuid], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(uuids)
    }

    // Sync list (favorites)

    pub fn synclist(&self, tree: &str) -> Result<SyncList> {
        let conn = self.conn.lock().unwrap();
        let entries = conn
            .prepare("SELECT path FROM synclist WHERE tree = ?1 ORDER BY path")?
            .query_map([tree], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(SyncList::from_entries(entries))
    }

    /// Add a favorite; the stored set is rewritten trie-compressed.
    pub fn add_favorite(&self, tree: &str, path: &str) -> Result<bool> {
        let mut list = self.synclist(tree)?;
        let added = list.add(path);
        if added {
            self.save_synclist(tree, &list)?;
        }
        Ok(added)
    }

    pub fn remove_favorite(&self, tree: &str, path: &str) -> Result<bool> {
        let mut list = self.synclist(tree)?;
        let removed = list.del(path);
        if removed {
            self.save_synclist(tree, &list)?;
        }
        Ok(removed)
    }

    fn save_synclist(&self, tree: &str, list: &SyncList) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM synclist WHERE tree = ?1", [tree])?;
        for entry in list.entries() {
            tx.execute(
                "INSERT INTO synclist (tree, path) VALUES (?1, ?2)",
                params![tree, entry],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // Settings

    pub fn set_setting_i64(&self, key: &str, value: i64) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn setting_i64(&self, key: &str, default: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let found = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(found.unwrap_or(default))
    }

    pub fn set_setting_str(&self, key: &str, value: &str) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn setting_str(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let found = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(found)
    }
}

/// Does `inner` live underneath `outer`?
fn is_root_nested(outer: &str, inner: &str) -> bool {
    is_ancestor(outer, inner)
}

fn row_to_device(r: &rusqlite::Row) -> rusqlite::Result<Device> {
    Ok(Device {
        uuid: r.get(0)?,
        name: r.get(1)?,
        platform: r.get(2)?,
        host: r.get(3)?,
        route_port: r.get(4)?,
        data_port: r.get(5)?,
        trusted: r.get(6)?,
        deleted: r.get(7)?,
    })
}

fn row_to_sync(r: &rusqlite::Row) -> rusqlite::Result<SyncFolder> {
    Ok(SyncFolder {
        uuid: r.get(0)?,
        name: r.get(1)?,
        perm: SyncPerm::parse(&r.get::<_, String>(2)?).unwrap_or(SyncPerm::Disconnected),
        kind: SyncKind::parse(&r.get::<_, String>(3)?).unwrap_or(SyncKind::Normal),
        creator: r.get(4)?,
        deleted: r.get(5)?,
    })
}

fn row_to_tree(r: &rusqlite::Row) -> rusqlite::Result<Tree> {
    Ok(Tree {
        uuid: r.get(0)?,
        sync_uuid: r.get(1)?,
        device_uuid: r.get(2)?,
        root: Utf8PathBuf::from(r.get::<_, String>(3)?),
        role: TreeRole::parse(&r.get::<_, String>(4)?).unwrap_or(TreeRole::None),
        enabled: r.get(5)?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("device.db")).unwrap();
        let db = Db::open(&path).unwrap();
        (dir, db)
    }

    fn some_tree(uuid: &str, sync: &str, root: &str) -> Tree {
        Tree {
            uuid: uuid.into(),
            sync_uuid: sync.into(),
            device_uuid: "dev1".into(),
            root: root.into(),
            role: TreeRole::None,
            enabled: true,
        }
    }

    #[test]
    fn sync_and_tree_round_trip() -> Result<()> {
        let (_dir, db) = scratch_db();
        let sync = SyncFolder {
            uuid: "s1".into(),
            name: "Documents".into(),
            perm: SyncPerm::ReadWrite,
            kind: SyncKind::Normal,
            creator: "dev1".into(),
            deleted: false,
        };
        db.put_sync(&sync)?;
        assert_eq!(db.sync_folder("s1")?, sync);

        db.put_tree(&some_tree("t1", "s1", "/home/me/Documents"))?;
        assert_eq!(db.tree("t1")?.root, "/home/me/Documents");
        // Fresh trees whitelist everything.
        assert!(db.synclist("t1")?.find("/anything").syncable());
        Ok(())
    }

    #[test]
    fn nested_roots_are_rejected() -> Result<()> {
        let (_dir, db) = scratch_db();
        db.put_tree(&some_tree("t1", "s1", "/data/sync"))?;
        let under = db.put_tree(&some_tree("t2", "s1", "/data/sync/inner"));
        assert!(matches!(under, Err(Error::Conflict(_))));
        let over = db.put_tree(&some_tree("t3", "s1", "/data"));
        assert!(matches!(over, Err(Error::Conflict(_))));
        // Sibling is fine.
        db.put_tree(&some_tree("t4", "s1", "/data/sync2"))?;
        Ok(())
    }

    #[test]
    fn destroy_sync_takes_trees_along() -> Result<()> {
        let (_dir, db) = scratch_db();
        db.put_sync(&SyncFolder {
            uuid: "s1".into(),
            name: "n".into(),
            perm: SyncPerm::ReadWrite,
            kind: SyncKind::Normal,
            creator: "dev1".into(),
            deleted: false,
        })?;
        db.put_tree(&some_tree("t1", "s1", "/a"))?;
        db.destroy_sync("s1")?;
        assert!(matches!(db.sync_folder("s1"), Err(Error::NotFound(_))));
        assert!(matches!(db.tree("t1"), Err(Error::NotFound(_))));
        Ok(())
    }

    #[test]
    fn favorites_stay_compressed() -> Result<()> {
        let (_dir, db) = scratch_db();
        db.put_tree(&some_tree("t1", "s1", "/a"))?;
        // Narrow from "everything" to two subtrees.
        assert!(db.remove_favorite("t1", "/")?);
        assert!(db.add_favorite("t1", "/docs/work")?);
        assert!(db.add_favorite("t1", "/music")?);
        assert!(db.add_favorite("t1", "/docs")?); // collapses /docs/work
        let list = db.synclist("t1")?;
        assert_eq!(list.entries(), vec!["/docs", "/music"]);
        Ok(())
    }

    #[test]
    fn settings_round_trip() -> Result<()> {
        let (_dir, db) = scratch_db();
        assert_eq!(db.setting_i64(keys::SYNC_INTERVAL_MS, 600_000)?, 600_000);
        db.set_setting_i64(keys::SYNC_INTERVAL_MS, 1_000)?;
        assert_eq!(db.setting_i64(keys::SYNC_INTERVAL_MS, 600_000)?, 1_000);
        Ok(())
    }
}
