#![allow(dead_code)]

//! Two (or more) engines in one process, talking over loopback.

use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use walkdir::WalkDir;

use zisync::config::Configuration;
use zisync::db::{Device, SyncFolder, SyncKind, SyncPerm, Tree, TreeRole};
use zisync::engine::Engine;
use zisync::store::MetaStore;

pub struct Peer {
    pub name: &'static str,
    pub engine: Engine,
    // Owns the on-disk state; dropped last.
    _dir: tempfile::TempDir,
    base: Utf8PathBuf,
}

impl Peer {
    pub fn start(name: &'static str) -> Peer {
        let dir = tempfile::tempdir().expect("couldn't make a scratch dir");
        let base = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let config = Configuration {
            data_dir: Some(base.join("state")),
            device_name: Some(name.to_owned()),
            // Ephemeral everything; peers learn the real port from
            // data_addr().
            data_port: Some(0),
            ..Default::default()
        };
        let engine = Engine::start(&config).expect("engine wouldn't start");
        Peer {
            name,
            engine,
            _dir: dir,
            base,
        }
    }

    pub fn device_uuid(&self) -> String {
        self.engine.device_uuid().to_owned()
    }

    pub fn data_port(&self) -> u16 {
        self.engine.data_addr().expect("no data plane").port()
    }

    /// A root directory for a new tree on this peer.
    pub fn fresh_root(&self, name: &str) -> Utf8PathBuf {
        let root = self.base.join(name);
        fs::create_dir_all(&root).unwrap();
        root
    }

    /// Open this peer's metadata table for a tree.
    pub fn store(&self, tree_uuid: &str) -> MetaStore {
        MetaStore::open(self.engine.db().path(), tree_uuid).unwrap()
    }

    pub fn shutdown(self) {
        self.engine.shutdown();
    }
}

/// Teach each peer how to reach the other.
pub fn link(a: &Peer, b: &Peer) {
    for (me, them) in [(a, b), (b, a)] {
        me.engine
            .add_device(&Device {
                uuid: them.device_uuid(),
                name: them.name.to_owned(),
                platform: std::env::consts::OS.to_owned(),
                host: "127.0.0.1".to_owned(),
                route_port: 0,
                data_port: them.data_port(),
                trusted: true,
                deleted: false,
            })
            .unwrap();
    }
}

/// A sync both peers participate in. Returns (sync uuid, a's tree, b's
/// tree).
pub fn make_sync(a: &Peer, b: &Peer, name: &str) -> (String, Tree, Tree) {
    make_sync_with_roles(a, b, name, SyncKind::Normal, TreeRole::None, TreeRole::None)
}

pub fn make_sync_with_roles(
    a: &Peer,
    b: &Peer,
    name: &str,
    kind: SyncKind,
    a_role: TreeRole,
    b_role: TreeRole,
) -> (String, Tree, Tree) {
    let sync = a
        .engine
        .create_sync(name, SyncPerm::ReadWrite, kind)
        .unwrap();
    // Both device stores carry the same sync row.
    b.engine
        .db()
        .put_sync(&SyncFolder {
            creator: a.device_uuid(),
            ..sync.clone()
        })
        .unwrap();

    let a_tree = a
        .engine
        .create_tree(&sync.uuid, &a.fresh_root(&format!("{name}-a")), a_role)
        .unwrap();
    let b_tree = b
        .engine
        .create_tree(&sync.uuid, &b.fresh_root(&format!("{name}-b")), b_role)
        .unwrap();

    a.engine
        .register_remote_tree(
            &b_tree.uuid,
            &sync.uuid,
            &b.device_uuid(),
            &b_tree.root,
            b_role,
        )
        .unwrap();
    b.engine
        .register_remote_tree(
            &a_tree.uuid,
            &sync.uuid,
            &a.device_uuid(),
            &a_tree.root,
            a_role,
        )
        .unwrap();

    (sync.uuid, a_tree, b_tree)
}

/// Push a file's mtime forward so consecutive edits are distinguishable
/// regardless of filesystem timestamp granularity.
pub fn bump_mtime(path: &Utf8Path, seconds: u64) {
    let fh = fs::File::options().write(true).open(path).unwrap();
    let now = fh.metadata().unwrap().modified().unwrap();
    fh.set_modified(now + Duration::from_secs(seconds)).unwrap();
}

pub fn write_file(root: &Utf8Path, rel: &str, contents: &[u8]) -> Utf8PathBuf {
    let path = root.join(rel.trim_start_matches('/'));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

pub fn read_file(root: &Utf8Path, rel: &str) -> Option<Vec<u8>> {
    fs::read(root.join(rel.trim_start_matches('/'))).ok()
}

/// Every visible file under a tree root, tree-relative, sorted. Hidden
/// engine droppings (.zstm, the manifest) are a test failure if present.
pub fn visible_files(root: &Utf8Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .map(|e| e.expect("couldn't walk tree"))
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e
                .path()
                .strip_prefix(root.as_std_path())
                .unwrap()
                .to_string_lossy()
                .into_owned();
            format!("/{rel}")
        })
        .collect();
    files.sort();
    files
}

/// Any leftover staging session dirs under `<root>/.zstm`?
pub fn staging_leftovers(root: &Utf8Path) -> Vec<String> {
    let staging = root.join(zisync::STAGING_DIR_NAME);
    if !staging.exists() {
        return Vec::new();
    }
    fs::read_dir(staging)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

pub fn assert_no_droppings(root: &Utf8Path) {
    assert_eq!(
        staging_leftovers(root),
        Vec::<String>::new(),
        "staging sessions survived under {root}"
    );
    assert!(
        !root.join(zisync::MANIFEST_NAME).exists(),
        "manifest file survived under {root}"
    );
}

pub fn eventually(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..100 {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {what}");
}
