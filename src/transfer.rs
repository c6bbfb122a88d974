//! The transfer executor: moving bytes between peers without corrupting
//! either side.
//!
//! `client` drives outbound sessions (PUT/GET/upload), `server` answers
//! them. Everything stages into a hidden scratch directory under the tree
//! root and renames into place only after the SHA-1 checks out, so a
//! cancelled or failing session never leaves a partial file at a
//! canonical path.

pub mod client;
pub mod http;
pub mod limiter;
pub mod server;
pub mod tar;

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::*;

use crate::abort::Abort;
use crate::db::{Db, Tree};
use crate::errors::{Error, Result};
use crate::file_util;
use crate::hashing::StreamingHasher;
use crate::meta::{FileMeta, FileStatus, join_rel};
use crate::monitor::{self, Monitor};
use crate::notify::Notifier;
use crate::planner::{ActionKind, SyncFile, SyncMode};
use crate::rename;
use crate::store::{APPLY_BATCH_LIMIT, MetaOp, MetaStore};
use crate::synclist::SyncList;
use crate::tree_mutex::TreeMutex;
use crate::vclock::Causality;
use crate::STAGING_DIR_NAME;
use limiter::RateLimiter;

/// Copy-loop chunk and the send/recv high-water mark.
pub const COPY_CHUNK: usize = 64 * 1024;

/// Dialing a peer gets this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Waiting on a peer's head - where a dead or wedged peer shows up -
/// gets a much shorter leash than bytes already in flight.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Every individual body read or write gets this long.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a session needs, threaded explicitly - sessions own no
/// global state.
pub struct TransferCtx {
    pub db: Arc<Db>,
    pub locks: TreeMutex,
    pub abort: Abort,
    pub monitor: Monitor,
    pub notifier: Notifier,
    pub up_limit: Arc<RateLimiter>,
    pub down_limit: Arc<RateLimiter>,
    pub self_device: String,
}

/// Where a session is in its life. Terminal states release everything.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    HeadRead,
    BodyRead,
    HeadWrite,
    BodyWrite,
    Done,
    Error,
}

async fn timed_at<T, F>(limit: Duration, what: &'static str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::network(format!("{what} timed out"))),
    }
}

/// Wrap a body read or write with the per-operation network timeout.
pub async fn timed<T, F>(what: &'static str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    timed_at(IO_TIMEOUT, what, fut).await
}

/// Wrap a wait for a peer's head with the short response timeout.
pub async fn timed_head<T, F>(what: &'static str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    timed_at(RESPONSE_TIMEOUT, what, fut).await
}

/// A per-session scratch directory: `<root>/.zstm/<random>`.
/// Dropped (however the session ends) it takes its contents with it.
pub struct StagingDir {
    // Option so Drop can consume it.
    dir: Option<tempfile::TempDir>,
    path: Utf8PathBuf,
}

impl StagingDir {
    pub fn create(tree_root: &Utf8Path) -> Result<Self> {
        let parent = tree_root.join(STAGING_DIR_NAME);
        std::fs::create_dir_all(&parent)?;
        file_util::hide_best_effort(&parent);
        let dir = tempfile::Builder::new()
            .prefix("session-")
            .tempdir_in(&parent)?;
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned())
            .map_err(|p| Error::config(format!("staging dir {} isn't UTF-8", p.display())))?;
        trace!("staging in {path}");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// A staging location for the nth incoming file.
    pub fn entry(&self, n: usize) -> Utf8PathBuf {
        self.path.join(format!("{n}"))
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!("couldn't reclaim staging dir {}: {e}", self.path);
            } else {
                monitor::bump(monitor::Op::StagingReclaimed);
            }
        }
    }
}

/// Copy exactly `len` bytes in bounded chunks, throttled and abortable.
/// Returns the hash of what passed through.
pub async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    limit: &RateLimiter,
    mut on_chunk: impl FnMut(u64) -> Result<()>,
) -> Result<crate::hashing::ContentHash>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut hasher = StreamingHasher::new();
    let mut remaining = len;
    while remaining > 0 {
        let want = (remaining as usize).min(COPY_CHUNK);
        limit.throttle(want).await;
        let got = timed("body read", async {
            Ok(reader.read(&mut buf[..want]).await?)
        })
        .await?;
        if got == 0 {
            return Err(Error::network("peer closed mid-body"));
        }
        hasher.update(&buf[..got]);
        timed("body write", async {
            writer.write_all(&buf[..got]).await?;
            Ok(())
        })
        .await?;
        remaining -= got as u64;
        on_chunk(got as u64)?;
    }
    Ok(hasher.finalize())
}

/// Body framing for the CBOR records: 4-byte big-endian length prefix.
pub async fn write_record<W, T>(w: &mut W, record: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let bytes = crate::manifest::encode(record)?;
    timed("record write", async {
        w.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
        w.write_all(&bytes).await?;
        Ok(())
    })
    .await
}

pub async fn read_record<R, T>(r: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    const RECORD_LIMIT: u32 = 256 * 1024 * 1024;
    let mut len = [0u8; 4];
    timed("record read", async {
        r.read_exact(&mut len).await?;
        Ok(())
    })
    .await?;
    let len = u32::from_be_bytes(len);
    if len > RECORD_LIMIT {
        return Err(Error::content(format!("{len}-byte record is absurd")));
    }
    let mut bytes = vec![0u8; len as usize];
    timed("record read", async {
        r.read_exact(&mut bytes).await?;
        Ok(())
    })
    .await?;
    crate::manifest::decode(&bytes)
}

/// Is the on-disk file still exactly what this row describes?
/// Length and mtime, the same check the indexer trusts.
pub fn stat_consistent(abs: &Utf8Path, row: &FileMeta) -> bool {
    let Ok(stat) = std::fs::metadata(abs.as_std_path()) else {
        return false;
    };
    if !stat.is_file() || stat.len() != row.length.max(0) as u64 {
        return false;
    }
    let mtime_ms = stat
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(-1);
    mtime_ms == row.mtime_ms
}

/// Pay off the rest of a tar entry we can no longer fill with real bytes.
pub async fn zero_fill<W: AsyncWrite + Unpin>(
    writer: &mut W,
    limit: &RateLimiter,
    mut remaining: u64,
) -> Result<()> {
    let zeros = vec![0u8; COPY_CHUNK];
    while remaining > 0 {
        let n = (remaining as usize).min(zeros.len());
        limit.throttle(n).await;
        timed("zero fill write", async {
            writer.write_all(&zeros[..n]).await?;
            Ok(())
        })
        .await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Read and discard exactly `len` bytes (tar padding, skipped bodies).
pub async fn drain_exact<R: AsyncRead + Unpin>(reader: &mut R, len: u64) -> Result<()> {
    let mut sink = tokio::io::sink();
    let mut limited = reader.take(len);
    let copied = timed("body drain", async {
        Ok(tokio::io::copy(&mut limited, &mut sink).await?)
    })
    .await?;
    if copied != len {
        return Err(Error::network("peer closed mid-body"));
    }
    Ok(())
}

/// What the receiver-side causality re-check says about one incoming row.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Disposition {
    Apply,
    /// Local history diverged concurrently: preserve the local copy under
    /// a conflict name, then apply.
    ApplyConflict,
    /// Already have it (or something newer).
    Skip,
}

/// Applies remotely-produced rows and bytes to the local tree + store.
///
/// This is the single funnel for both PUT ingest (server side) and PULL
/// apply (client side): causality re-check, conflict preservation, atomic
/// rename into place, batched row writes.
pub struct Applier {
    store: MetaStore,
    tree: Tree,
    synclist: SyncList,
    self_device: String,
    batch: Vec<MetaOp>,
    pub applied: usize,
    pub skipped: usize,
}

impl Applier {
    pub fn new(db: &Db, tree: &Tree, self_device: &str) -> Result<Self> {
        Ok(Self {
            store: MetaStore::open(db.path(), &tree.uuid)?,
            tree: tree.clone(),
            synclist: db.synclist(&tree.uuid)?,
            self_device: self_device.to_owned(),
            batch: Vec::new(),
            applied: 0,
            skipped: 0,
        })
    }

    fn check_incoming(&self, incoming: &FileMeta) -> Result<Disposition> {
        if !self.synclist.find(&incoming.path).syncable() {
            return Ok(Disposition::Skip);
        }
        let Some(current) = self.store.get(&incoming.path)? else {
            return Ok(Disposition::Apply);
        };
        Ok(match incoming.vclock.compare(&current.vclock) {
            Causality::Greater => Disposition::Apply,
            Causality::Equal | Causality::Less => Disposition::Skip,
            Causality::Conflict => Disposition::ApplyConflict,
        })
    }

    fn push_row(&mut self, mut row: FileMeta) -> Result<()> {
        row.timestamp_ms = jiff::Timestamp::now().as_millisecond();
        let op = if self.store.get(&row.path)?.is_some() {
            MetaOp::Update(row)
        } else {
            MetaOp::Insert(row)
        };
        self.batch.push(op);
        self.applied += 1;
        if self.batch.len() >= APPLY_BATCH_LIMIT {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.store.apply_batch(&self.batch)?;
        self.batch.clear();
        Ok(())
    }

    /// Move a diverged local file out of the way, to the first free
    /// conflict name. The copy gets picked up by the next index pass as a
    /// brand-new file.
    fn preserve_conflict_copy(&mut self, rel: &str) -> Result<()> {
        let abs = join_rel(&self.tree.root, rel);
        if !abs.exists() {
            return Ok(());
        }
        for n in 0.. {
            let conflict_rel = file_util::conflict_rel_path(rel, n);
            let conflict_abs = join_rel(&self.tree.root, &conflict_rel);
            if conflict_abs.exists() {
                continue;
            }
            std::fs::rename(&abs, &conflict_abs)?;
            info!("kept diverged copy of {rel} as {conflict_rel}");
            monitor::bump(monitor::Op::ConflictPreserved);
            return Ok(());
        }
        unreachable!()
    }

    /// Apply a self-contained row change: any remove, a directory create,
    /// or a regular file whose bytes we already hold.
    pub fn apply_meta(&mut self, incoming: FileMeta) -> Result<bool> {
        let disposition = self.check_incoming(&incoming)?;
        if disposition == Disposition::Skip {
            self.skipped += 1;
            return Ok(false);
        }

        let mut incoming = incoming;
        if disposition == Disposition::ApplyConflict {
            if let Some(current) = self.store.get(&incoming.path)? {
                incoming.vclock.merge(&current.vclock);
            }
        }

        let abs = join_rel(&self.tree.root, &incoming.path);
        match incoming.status {
            FileStatus::Removed => {
                if disposition == Disposition::ApplyConflict && !incoming.is_directory() {
                    // Their remove raced our edit: keep our copy.
                    self.preserve_conflict_copy(&incoming.path)?;
                } else if incoming.is_directory() {
                    // Children tombstone first, so this is empty by now;
                    // if something local snuck in, leave it for the next
                    // index to report.
                    let _ = std::fs::remove_dir(&abs);
                } else {
                    match std::fs::remove_file(&abs) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            FileStatus::Normal if incoming.is_directory() => {
                std::fs::create_dir_all(&abs)?;
            }
            FileStatus::Normal => {
                // A regular-file row with no bytes attached: only valid
                // when our on-disk content already matches.
                let holds = self
                    .store
                    .get(&incoming.path)?
                    .is_some_and(|c| c.status == FileStatus::Normal && c.sha1 == incoming.sha1);
                if !holds {
                    debug!("no local bytes for meta row {}; deferring", incoming.path);
                    self.skipped += 1;
                    return Ok(false);
                }
                set_mtime(&abs, incoming.mtime_ms);
            }
        }
        self.push_row(incoming)?;
        Ok(true)
    }

    /// Place a fully-staged, hash-verified file and write its row.
    pub fn apply_data(&mut self, incoming: FileMeta, staged: &Utf8Path) -> Result<bool> {
        let disposition = self.check_incoming(&incoming)?;
        if disposition == Disposition::Skip {
            self.skipped += 1;
            return Ok(false);
        }
        let mut incoming = incoming;
        if disposition == Disposition::ApplyConflict {
            if let Some(current) = self.store.get(&incoming.path)? {
                incoming.vclock.merge(&current.vclock);
            }
            self.preserve_conflict_copy(&incoming.path)?;
        }

        let abs = join_rel(&self.tree.root, &incoming.path);
        file_util::place_file(staged, &abs)?;
        set_mtime(&abs, incoming.mtime_ms);
        self.push_row(incoming)?;
        Ok(true)
    }

    /// Fold a tombstone + same-content insert into one local rename.
    /// Falls back to applying just the tombstone when the local bytes
    /// drifted; the insert then waits for a data transfer.
    pub fn apply_rename(&mut self, from: FileMeta, to: FileMeta) -> Result<bool> {
        let from_abs = join_rel(&self.tree.root, &from.path);
        let matches = to
            .sha1
            .is_some_and(|expected| match file_util::hash_file(&from_abs) {
                Ok(actual) => actual == expected,
                Err(_) => false,
            });
        if !matches {
            debug!(
                "local {} no longer matches; renaming {} the slow way",
                from.path, to.path
            );
            self.apply_meta(from)?;
            return Ok(false);
        }

        let to_abs = join_rel(&self.tree.root, &to.path);
        if let Some(parent) = to_abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&from_abs, &to_abs)?;
        set_mtime(&to_abs, to.mtime_ms);
        monitor::bump(monitor::Op::RenameApplied);

        self.push_row(from)?;
        self.push_row(to)?;
        Ok(true)
    }

    /// Ingest a manifest's worth of meta rows: removes children-first,
    /// creations parents-first, rename pairs folded on this side.
    pub fn ingest_manifest_rows(&mut self, rows: Vec<FileMeta>) -> Result<()> {
        let mut removes = Vec::new();
        let mut makes = Vec::new();
        let mut inserts = Vec::new();
        for row in rows {
            let current = self.store.get(&row.path)?;
            if row.status == FileStatus::Removed {
                removes.push(SyncFile {
                    mode: SyncMode::Pull,
                    kind: ActionKind::Meta,
                    conflict: false,
                    dst: current,
                    src: row,
                });
            } else if row.is_regular() && current.is_none() {
                inserts.push(SyncFile {
                    mode: SyncMode::Pull,
                    kind: ActionKind::Data,
                    conflict: false,
                    dst: None,
                    src: row,
                });
            } else {
                makes.push(row);
            }
        }

        // The sender detects renames on its side too, but it planned
        // against a snapshot; matching again here is what lets a pair
        // apply as one filesystem rename with zero bytes moved.
        let folded = rename::detect_renames(removes, inserts);
        for r in folded.renames {
            self.apply_rename(r.from.src, r.to.src)?;
        }

        let mut removes = folded.removes;
        removes.sort_by(|a, b| b.src.path.cmp(&a.src.path));
        for r in removes {
            self.apply_meta(r.src)?;
        }

        makes.sort_by(|a, b| a.path.cmp(&b.path));
        for row in makes {
            self.apply_meta(row)?;
        }
        // Unpaired inserts either have bytes coming in this same session
        // or wait for the next cycle; either way, not our problem yet.
        for skipped in folded.inserts {
            trace!("insert {} waits for its bytes", skipped.src.path);
        }
        self.flush()
    }
}

fn set_mtime(abs: &Utf8Path, mtime_ms: i64) {
    let Ok(fh) = std::fs::File::options().write(true).open(abs) else {
        return;
    };
    let time = std::time::UNIX_EPOCH + Duration::from_millis(mtime_ms.max(0) as u64);
    let _ = fh.set_modified(time);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::TreeRole;
    use crate::hashing::ContentHash;
    use crate::meta::FileKind;
    use crate::vclock::VClock;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Db>,
        tree: Tree,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        let root = base.join("root");
        std::fs::create_dir(&root).unwrap();
        let db = Arc::new(Db::open(&base.join("device.db")).unwrap());
        let tree = Tree {
            uuid: "local".into(),
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
        }
    }

    fn incoming(path: &str, content: &[u8], vclock: VClock) -> FileMeta {
        FileMeta {
            path: path.into(),
            kind: FileKind::Regular,
            status: FileStatus::Normal,
            mtime_ms: 1_600_000_000_000,
            length: content.len() as i64,
            sha1: Some(ContentHash::hash(content)),
            usn: 1,
            vclock,
            win_attr: 0,
            unix_attr: 0o644,
            android_attr: 0,
            alias: None,
            modifier: "remote-dev".into(),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn data_applies_and_second_apply_skips() -> Result<()> {
        let f = fixture();
        let mut applier = Applier::new(&f.db, &f.tree, "dev1")?;

        let staged = f.tree.root.join(".incoming");
        std::fs::write(&staged, b"payload")?;
        let row = incoming("/a.txt", b"payload", VClock::first("remote"));
        assert!(applier.apply_data(row.clone(), &staged)?);
        applier.flush()?;

        assert_eq!(std::fs::read(f.tree.root.join("a.txt"))?, b"payload");
        let stored = applier.store.get("/a.txt")?.unwrap();
        assert_eq!(stored.sha1, row.sha1);

        // Same row again: Equal, skipped.
        let staged2 = f.tree.root.join(".incoming2");
        std::fs::write(&staged2, b"payload")?;
        assert!(!applier.apply_data(row, &staged2)?);
        Ok(())
    }

    #[test]
    fn conflicting_data_preserves_the_local_copy() -> Result<()> {
        let f = fixture();
        let mut applier = Applier::new(&f.db, &f.tree, "dev1")?;

        // Local history: our own edit.
        std::fs::write(f.tree.root.join("a.txt"), b"ours")?;
        applier.apply_meta(incoming("/a.txt", b"ours", VClock::first("local")))?;
        // That meta apply defers (no bytes); seed via data instead.
        let staged = f.tree.root.join(".seed");
        std::fs::write(&staged, b"ours")?;
        assert!(applier.apply_data(incoming("/a.txt", b"ours", VClock::first("local")), &staged)?);
        applier.flush()?;

        // Incoming concurrent edit from the remote.
        let staged = f.tree.root.join(".incoming");
        std::fs::write(&staged, b"theirs")?;
        let remote_row = incoming("/a.txt", b"theirs", VClock::first("remote"));
        assert!(applier.apply_data(remote_row, &staged)?);
        applier.flush()?;

        assert_eq!(std::fs::read(f.tree.root.join("a.txt"))?, b"theirs");
        assert_eq!(
            std::fs::read(f.tree.root.join("a.conflict.txt"))?,
            b"ours"
        );
        // The surviving row dominates both histories.
        let stored = applier.store.get("/a.txt")?.unwrap();
        assert!(stored.vclock.get("local") >= 1);
        assert!(stored.vclock.get("remote") >= 1);
        Ok(())
    }

    #[test]
    fn manifest_rename_moves_without_bytes() -> Result<()> {
        let f = fixture();
        let mut applier = Applier::new(&f.db, &f.tree, "dev1")?;

        // Seed /old locally.
        let staged = f.tree.root.join(".seed");
        std::fs::write(&staged, b"contents")?;
        let old = incoming("/old.txt", b"contents", VClock::first("remote"));
        applier.apply_data(old.clone(), &staged)?;
        applier.flush()?;

        // Remote renamed it: tombstone + new path, same bytes.
        let mut dead = old.clone();
        dead.status = FileStatus::Removed;
        dead.vclock.increment("remote");
        let mut new_row = incoming("/new.txt", b"contents", VClock::first("remote"));
        new_row.mtime_ms = old.mtime_ms;
        applier.ingest_manifest_rows(vec![dead, new_row])?;

        assert!(!f.tree.root.join("old.txt").exists());
        assert_eq!(std::fs::read(f.tree.root.join("new.txt"))?, b"contents");
        let old_row = applier.store.get("/old.txt")?.unwrap();
        assert_eq!(old_row.status, FileStatus::Removed);
        assert!(applier.store.get("/new.txt")?.is_some());
        Ok(())
    }

    #[test]
    fn staging_dirs_vanish_on_drop() -> Result<()> {
        let f = fixture();
        let kept_path;
        {
            let staging = StagingDir::create(&f.tree.root)?;
            kept_path = staging.path().to_owned();
            std::fs::write(staging.entry(0), b"partial")?;
            assert!(kept_path.exists());
        }
        assert!(!kept_path.exists());
        Ok(())
    }

    #[test]
    fn whitelist_blocks_incoming_rows() -> Result<()> {
        let f = fixture();
        f.db.remove_favorite("local", "/")?;
        f.db.add_favorite("local", "/wanted")?;
        let mut applier = Applier::new(&f.db, &f.tree, "dev1")?;

        let staged = f.tree.root.join(".incoming");
        std::fs::write(&staged, b"x")?;
        assert!(!applier.apply_data(incoming("/stray", b"x", VClock::first("remote")), &staged)?);
        assert_eq!(applier.skipped, 1);
        Ok(())
    }
}
