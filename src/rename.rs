//! Fold REMOVE+INSERT pairs that share content into rename actions.
//!
//! The arena lives for a single planner (or manifest-ingest) pass: remove
//! candidates are keyed by content hash and size, inserts match against
//! them, ties break by nearest mtime, and everything unpaired drains back
//! to the ordinary queues.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::*;

use crate::hashing::ContentHash;
use crate::meta::FileStatus;
use crate::planner::SyncFile;

/// `from` tombstones the old path; `to` appears at the new one. The
/// receiver applies both as one local rename - no bytes move.
#[derive(Debug, Clone)]
pub struct Rename {
    pub from: SyncFile,
    pub to: SyncFile,
}

#[derive(Debug, Default)]
pub struct RenameOutcome {
    pub renames: Vec<Rename>,
    /// Remove candidates that found no partner.
    pub removes: Vec<SyncFile>,
    /// Insert candidates that found no partner.
    pub inserts: Vec<SyncFile>,
}

#[derive(Hash, Eq, PartialEq, Copy, Clone)]
struct ContentKey {
    sha1: ContentHash,
    length: i64,
}

/// A remove can anchor a rename only if the receiver still holds the old
/// bytes: its current row must be a live regular file with a hash.
fn remove_key(candidate: &SyncFile) -> Option<ContentKey> {
    let dst = candidate.dst.as_ref()?;
    if !dst.is_regular() || dst.status != FileStatus::Normal {
        return None;
    }
    Some(ContentKey {
        sha1: dst.sha1?,
        length: dst.length,
    })
}

/// An insert can complete a rename only if it's a brand-new regular file.
fn insert_key(candidate: &SyncFile) -> Option<ContentKey> {
    if candidate.dst.is_some() || !candidate.src.is_regular() {
        return None;
    }
    Some(ContentKey {
        sha1: candidate.src.sha1?,
        length: candidate.src.length,
    })
}

pub fn detect_renames(removes: Vec<SyncFile>, inserts: Vec<SyncFile>) -> RenameOutcome {
    let mut outcome = RenameOutcome::default();

    // Feeding the same candidate twice must not mint two renames.
    let mut seen: FxHashSet<(String, bool)> = FxHashSet::default();

    let mut remove_buckets: FxHashMap<ContentKey, Vec<SyncFile>> = FxHashMap::default();
    for r in removes {
        if !seen.insert((r.path().to_owned(), true)) {
            continue;
        }
        match remove_key(&r) {
            Some(key) => remove_buckets.entry(key).or_default().push(r),
            None => outcome.removes.push(r),
        }
    }

    for i in inserts {
        if !seen.insert((i.path().to_owned(), false)) {
            continue;
        }
        let Some(key) = insert_key(&i) else {
            outcome.inserts.push(i);
            continue;
        };
        let Some(bucket) = remove_buckets.get_mut(&key) else {
            outcome.inserts.push(i);
            continue;
        };
        // Multiple candidates share the hash: pair by nearest mtime.
        let nearest = bucket
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.src.mtime_ms.abs_diff(i.src.mtime_ms))
            .map(|(idx, _)| idx)
            .expect("empty buckets are removed");
        let from = bucket.swap_remove(nearest);
        if bucket.is_empty() {
            remove_buckets.remove(&key);
        }
        trace!("rename {} -> {}", from.path(), i.path());
        outcome.renames.push(Rename { from, to: i });
    }

    for (_, bucket) in remove_buckets {
        outcome.removes.extend(bucket);
    }
    outcome.renames.sort_by(|a, b| a.to.path().cmp(b.to.path()));
    outcome
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::{FileKind, FileMeta};
    use crate::planner::{ActionKind, SyncMode};
    use crate::vclock::VClock;

    fn row(path: &str, content: &[u8], mtime_ms: i64) -> FileMeta {
        FileMeta {
            path: path.into(),
            kind: FileKind::Regular,
            status: FileStatus::Normal,
            mtime_ms,
            length: content.len() as i64,
            sha1: Some(ContentHash::hash(content)),
            usn: 1,
            vclock: VClock::first("t"),
            win_attr: 0,
            unix_attr: 0,
            android_attr: 0,
            alias: None,
            modifier: "dev".into(),
            timestamp_ms: mtime_ms,
        }
    }

    fn remove_of(path: &str, content: &[u8], mtime_ms: i64) -> SyncFile {
        let live = row(path, content, mtime_ms);
        let mut dead = live.clone();
        dead.status = FileStatus::Removed;
        SyncFile {
            mode: SyncMode::Pull,
            kind: ActionKind::Meta,
            conflict: false,
            dst: Some(live),
            src: dead,
        }
    }

    fn insert_of(path: &str, content: &[u8], mtime_ms: i64) -> SyncFile {
        SyncFile {
            mode: SyncMode::Pull,
            kind: ActionKind::Data,
            conflict: false,
            dst: None,
            src: row(path, content, mtime_ms),
        }
    }

    #[test]
    fn pairs_matching_content() {
        let outcome = detect_renames(
            vec![remove_of("/old", b"stuff", 100)],
            vec![insert_of("/new", b"stuff", 100)],
        );
        assert_eq!(outcome.renames.len(), 1);
        assert_eq!(outcome.renames[0].from.path(), "/old");
        assert_eq!(outcome.renames[0].to.path(), "/new");
        assert!(outcome.removes.is_empty());
        assert!(outcome.inserts.is_empty());
    }

    #[test]
    fn size_and_hash_must_both_match() {
        let outcome = detect_renames(
            vec![remove_of("/old", b"aaa", 100)],
            vec![insert_of("/new", b"bbb", 100)],
        );
        assert!(outcome.renames.is_empty());
        assert_eq!(outcome.removes.len(), 1);
        assert_eq!(outcome.inserts.len(), 1);
    }

    #[test]
    fn nearest_mtime_breaks_ties() {
        let outcome = detect_renames(
            vec![
                remove_of("/copy-early", b"dup", 100),
                remove_of("/copy-late", b"dup", 500),
            ],
            vec![insert_of("/renamed", b"dup", 480)],
        );
        assert_eq!(outcome.renames.len(), 1);
        assert_eq!(outcome.renames[0].from.path(), "/copy-late");
        assert_eq!(outcome.removes.len(), 1);
        assert_eq!(outcome.removes[0].path(), "/copy-early");
    }

    #[test]
    fn duplicate_feeds_are_idempotent() {
        let outcome = detect_renames(
            vec![
                remove_of("/old", b"stuff", 100),
                remove_of("/old", b"stuff", 100),
            ],
            vec![
                insert_of("/new", b"stuff", 100),
                insert_of("/new", b"stuff", 100),
            ],
        );
        assert_eq!(outcome.renames.len(), 1);
        assert!(outcome.removes.is_empty());
        assert!(outcome.inserts.is_empty());
    }

    #[test]
    fn updates_and_directories_pass_through() {
        // An insert over an existing row isn't a rename target.
        let mut not_new = insert_of("/exists", b"x", 10);
        not_new.dst = Some(row("/exists", b"y", 5));
        let outcome = detect_renames(vec![], vec![not_new]);
        assert!(outcome.renames.is_empty());
        assert_eq!(outcome.inserts.len(), 1);
    }
}
