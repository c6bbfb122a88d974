//! Reconcile the physical filesystem with the metadata store for one tree.
//!
//! Indexing is restartable: a crash leaves the store consistent with the
//! last committed batch, and the next run rediscovers the rest.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use rustc_hash::FxHashSet;
use tracing::*;

use crate::abort::Abort;
use crate::db::{Db, Tree};
use crate::errors::{Error, Result};
use crate::file_util;
use crate::meta::{FileKind, FileMeta, FileStatus};
use crate::monitor;
use crate::notify::{Event, Notifier};
use crate::store::{APPLY_BATCH_LIMIT, MetaOp, MetaStore};
use crate::synclist::Coverage;
use crate::tree_mutex::TreeMutex;
use crate::{MANIFEST_NAME, STAGING_DIR_NAME};

/// Directory names never walked, wherever they appear.
const IGNORE_DIRS: &[&str] = &[
    STAGING_DIR_NAME,
    "$RECYCLE.BIN",
    "RECYCLER",
    ".thumbnails",
    "System Volume Information",
];

#[derive(Debug, Default)]
pub struct IndexOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    /// Paths whose contents couldn't be hashed (locked, vanished, ...).
    /// Their rows are left untouched for the next run.
    pub sha1_failures: Vec<String>,
}

impl IndexOutcome {
    pub fn changes(&self) -> usize {
        self.inserted + self.updated + self.removed
    }
}

/// Walk `tree`'s root, diff against the store, and commit fresh rows.
///
/// Takes the tree's self-lock; refusal means an index or sync against this
/// tree is already running and the caller should reschedule.
pub fn index_tree(
    db: &Db,
    tree: &Tree,
    self_device: &str,
    locks: &TreeMutex,
    abort: &Abort,
    notifier: &Notifier,
    skips: &[Regex],
) -> Result<IndexOutcome> {
    let _lock = locks
        .try_lock(&tree.uuid, &tree.uuid)
        .ok_or(Error::Again("tree is busy"))?;

    notifier.emit(Event::IndexStart {
        tree: tree.uuid.clone(),
    });
    monitor::bump(monitor::Op::IndexRun);

    let result = index_locked(db, tree, self_device, abort, skips);

    notifier.emit(Event::IndexFinish {
        tree: tree.uuid.clone(),
    });
    if let Ok(outcome) = &result {
        if outcome.changes() > 0 {
            notifier.emit(Event::SyncModify);
        }
    }
    result
}

fn index_locked(
    db: &Db,
    tree: &Tree,
    self_device: &str,
    abort: &Abort,
    skips: &[Regex],
) -> Result<IndexOutcome> {
    let synclist = db.synclist(&tree.uuid)?;
    let mut store = MetaStore::open(db.path(), &tree.uuid)?;
    let now_ms = jiff::Timestamp::now().as_millisecond();

    let mut outcome = IndexOutcome::default();
    let mut observed: FxHashSet<String> = FxHashSet::default();
    let mut batch: Vec<MetaOp> = Vec::new();

    // Breadth-first: parents always precede children, so a crash mid-run
    // can't commit a child whose directory row is missing.
    let mut queue: VecDeque<(Utf8PathBuf, String)> = VecDeque::new();
    queue.push_back((tree.root.clone(), String::new()));

    while let Some((dir_abs, dir_rel)) = queue.pop_front() {
        if abort.tree_aborted(&tree.uuid) {
            return Err(Error::Cancelled);
        }

        let entries = match fs::read_dir(&dir_abs) {
            Ok(iter) => iter,
            Err(e) => {
                // A directory we saw a moment ago may be gone already;
                // the removal pass below will tombstone it.
                debug!("couldn't read {dir_abs}: {e}");
                continue;
            }
        };
        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => {
                    names.insert(name);
                }
                Err(bad) => warn!("skipping non-UTF-8 name {bad:?} in {dir_abs}"),
            }
        }

        for name in names {
            if abort.tree_aborted(&tree.uuid) {
                return Err(Error::Cancelled);
            }

            let abs = dir_abs.join(&name);
            let rel = format!("{dir_rel}/{name}");

            let Ok(stat) = fs::symlink_metadata(abs.as_std_path()) else {
                continue;
            };
            // Neither regular nor directory (symlinks, sockets, ...) is
            // out of scope.
            let kind = if stat.is_file() {
                FileKind::Regular
            } else if stat.is_dir() {
                FileKind::Directory
            } else {
                continue;
            };

            if kind == FileKind::Directory {
                if IGNORE_DIRS.contains(&name.as_str()) {
                    continue;
                }
            } else if name == MANIFEST_NAME {
                continue;
            }
            if skips.iter().any(|re| re.is_match(abs.as_str())) {
                trace!("{abs} matches a skip pattern");
                continue;
            }

            let coverage = synclist.find(&rel);
            if !coverage.walkable() {
                continue;
            }
            if kind == FileKind::Directory {
                queue.push_back((abs.clone(), rel.clone()));
            } else if !coverage.syncable() {
                // Files above the whitelist don't exist; directories do so
                // their covered children have parents.
                continue;
            }

            observed.insert(rel.clone());
            diff_one(
                &store, tree, self_device, &abs, &rel, kind, &stat, now_ms, &mut outcome,
                &mut batch,
            )?;

            if batch.len() >= APPLY_BATCH_LIMIT {
                store.apply_batch(&batch)?;
                batch.clear();
            }
        }
    }

    // Anything in the store we didn't see is gone: tombstone it.
    let mut after: Option<String> = None;
    loop {
        if abort.tree_aborted(&tree.uuid) {
            return Err(Error::Cancelled);
        }
        let page = store.scan_from(after.as_deref(), APPLY_BATCH_LIMIT)?;
        if page.is_empty() {
            break;
        }
        after = Some(page.last().unwrap().path.clone());
        for row in page {
            // Rows that fell outside the whitelist aren't gone, just
            // unwatched; freezing them keeps an un-favorited path from
            // reading as a deletion everywhere else.
            if !synclist.find(&row.path).syncable() {
                continue;
            }
            if row.status == FileStatus::Normal && !observed.contains(&row.path) {
                trace!("{} vanished; tombstoning", row.path);
                let mut dead = row;
                dead.status = FileStatus::Removed;
                dead.vclock.increment(&tree.uuid);
                dead.modifier = self_device.to_owned();
                dead.timestamp_ms = now_ms;
                batch.push(MetaOp::Update(dead));
                outcome.removed += 1;

                if batch.len() >= APPLY_BATCH_LIMIT {
                    store.apply_batch(&batch)?;
                    batch.clear();
                }
            }
        }
    }
    store.apply_batch(&batch)?;

    info!(
        "indexed {}: +{} ~{} -{} ({} hash failures)",
        tree.uuid,
        outcome.inserted,
        outcome.updated,
        outcome.removed,
        outcome.sha1_failures.len()
    );
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn diff_one(
    store: &MetaStore,
    tree: &Tree,
    self_device: &str,
    abs: &Utf8Path,
    rel: &str,
    kind: FileKind,
    stat: &fs::Metadata,
    now_ms: i64,
    outcome: &mut IndexOutcome,
    batch: &mut Vec<MetaOp>,
) -> Result<()> {
    let mtime_ms = mtime_millis(stat);
    let length = if kind == FileKind::Regular {
        stat.len() as i64
    } else {
        0
    };

    let existing = store.get(rel)?;

    // Directory mtimes wobble whenever children change and carry no
    // content, so a directory row only changes when it appears, vanishes,
    // or swaps kind.
    let unchanged = existing.as_ref().is_some_and(|row| {
        row.status == FileStatus::Normal
            && row.kind == kind
            && match kind {
                FileKind::Directory => true,
                FileKind::Regular => {
                    row.mtime_ms == mtime_ms && row.length == length && row.sha1.is_some()
                }
            }
    });
    if unchanged {
        return Ok(());
    }

    let sha1 = if kind == FileKind::Regular {
        match file_util::hash_file(abs) {
            Ok(hash) => Some(hash),
            Err(e) => {
                warn!("couldn't hash {abs}: {e}");
                outcome.sha1_failures.push(rel.to_owned());
                return Ok(());
            }
        }
    } else {
        None
    };

    match existing {
        None => {
            trace!("new {rel}");
            batch.push(MetaOp::Insert(FileMeta {
                path: rel.to_owned(),
                kind,
                status: FileStatus::Normal,
                mtime_ms,
                length,
                sha1,
                usn: 0,
                vclock: crate::vclock::VClock::first(&tree.uuid),
                win_attr: 0,
                unix_attr: unix_mode(stat),
                android_attr: 0,
                alias: None,
                modifier: self_device.to_owned(),
                timestamp_ms: now_ms,
            }));
            outcome.inserted += 1;
        }
        Some(mut row) => {
            trace!("changed {rel}");
            row.kind = kind;
            row.status = FileStatus::Normal;
            row.mtime_ms = mtime_ms;
            row.length = length;
            row.sha1 = sha1;
            row.unix_attr = unix_mode(stat);
            row.vclock.increment(&tree.uuid);
            row.modifier = self_device.to_owned();
            row.timestamp_ms = now_ms;
            batch.push(MetaOp::Update(row));
            outcome.updated += 1;
        }
    }
    Ok(())
}

fn mtime_millis(stat: &fs::Metadata) -> i64 {
    stat.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn unix_mode(stat: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    stat.mode()
}

#[cfg(not(unix))]
fn unix_mode(_stat: &fs::Metadata) -> u32 {
    0
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::TreeRole;
    use crate::hashing::ContentHash;
    use crate::vclock::Causality;
    use std::fs::File;
    use std::io::Write;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Db,
        tree: Tree,
        locks: TreeMutex,
        abort: Abort,
        notifier: Notifier,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let root = base.join("root");
        fs::create_dir(&root).unwrap();
        let db = Db::open(&base.join("device.db")).unwrap();
        let tree = Tree {
            uuid: "t1".into(),
            sync_uuid: "s1".into(),
            device_uuid: "dev1".into(),
            root,
            role: TreeRole::None,
            enabled: true,
        };
        db.put_tree(&tree).unwrap();
        Fixture {
            _dir: dir,
            db,
            tree,
            locks: TreeMutex::new(),
            abort: Abort::new(),
            notifier: Notifier::new(),
        }
    }

    fn index(f: &Fixture) -> IndexOutcome {
        index_tree(
            &f.db,
            &f.tree,
            "dev1",
            &f.locks,
            &f.abort,
            &f.notifier,
            &[],
        )
        .unwrap()
    }

    #[test]
    fn discovers_inserts_and_reindex_is_a_noop() {
        let f = fixture();
        fs::create_dir(f.tree.root.join("d")).unwrap();
        let mut fh = File::create(f.tree.root.join("d/a.txt")).unwrap();
        fh.write_all(b"hello").unwrap();
        drop(fh);

        let first = index(&f);
        assert_eq!(first.inserted, 2);
        assert_eq!(first.updated, 0);

        let store = MetaStore::open(f.db.path(), "t1").unwrap();
        let file = store.get("/d/a.txt").unwrap().unwrap();
        assert_eq!(file.length, 5);
        assert_eq!(file.sha1, Some(ContentHash::hash(b"hello")));
        assert_eq!(file.vclock.get("t1"), 1);
        let dir = store.get("/d").unwrap().unwrap();
        assert_eq!(dir.kind, FileKind::Directory);
        assert!(dir.sha1.is_none());

        // Indexing an unchanged tree produces zero writes.
        let second = index(&f);
        assert_eq!(second.changes(), 0);
    }

    #[test]
    fn modification_bumps_the_clock() {
        let f = fixture();
        fs::write(f.tree.root.join("a.txt"), b"one").unwrap();
        index(&f);

        let store = MetaStore::open(f.db.path(), "t1").unwrap();
        let before = store.get("/a.txt").unwrap().unwrap();

        fs::write(f.tree.root.join("a.txt"), b"two!").unwrap();
        // Filesystem mtime granularity can swallow quick edits; force it.
        filetime_nudge(&f.tree.root.join("a.txt"));
        let outcome = index(&f);
        assert_eq!(outcome.updated, 1);

        let after = store.get("/a.txt").unwrap().unwrap();
        assert_eq!(after.length, 4);
        assert_eq!(before.vclock.compare(&after.vclock), Causality::Less);
        assert!(after.usn > before.usn);
    }

    #[test]
    fn vanished_files_become_tombstones() {
        let f = fixture();
        fs::write(f.tree.root.join("a.txt"), b"bye").unwrap();
        index(&f);
        fs::remove_file(f.tree.root.join("a.txt")).unwrap();

        let outcome = index(&f);
        assert_eq!(outcome.removed, 1);

        let store = MetaStore::open(f.db.path(), "t1").unwrap();
        let dead = store.get("/a.txt").unwrap().unwrap();
        assert_eq!(dead.status, FileStatus::Removed);
        // Tombstones keep their hash so rename detection can match them.
        assert_eq!(dead.sha1, Some(ContentHash::hash(b"bye")));
        assert_eq!(dead.vclock.get("t1"), 2);
    }

    #[test]
    fn staging_and_manifest_are_invisible() {
        let f = fixture();
        fs::create_dir(f.tree.root.join(STAGING_DIR_NAME)).unwrap();
        fs::write(
            f.tree.root.join(STAGING_DIR_NAME).join("partial"),
            b"junk",
        )
        .unwrap();
        fs::write(f.tree.root.join(MANIFEST_NAME), b"meta").unwrap();
        fs::write(f.tree.root.join("real.txt"), b"data").unwrap();

        let outcome = index(&f);
        assert_eq!(outcome.inserted, 1);
        let store = MetaStore::open(f.db.path(), "t1").unwrap();
        assert!(store.get("/real.txt").unwrap().is_some());
        assert!(store.get(&format!("/{MANIFEST_NAME}")).unwrap().is_none());
    }

    #[test]
    fn busy_tree_refuses() {
        let f = fixture();
        let _held = f.locks.try_lock("t1", "t1").unwrap();
        let err = index_tree(
            &f.db,
            &f.tree,
            "dev1",
            &f.locks,
            &f.abort,
            &f.notifier,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Again(_)));
    }

    /// Push a file's mtime forward a second so a same-instant rewrite is
    /// visible to the stat diff.
    fn filetime_nudge(path: &Utf8Path) {
        let stat = fs::metadata(path).unwrap();
        let bumped = stat.modified().unwrap() + std::time::Duration::from_secs(1);
        let fh = File::options().write(true).open(path).unwrap();
        fh.set_modified(bumped).unwrap();
    }
}
