//! The per-tree metadata table and its transactional batch writer.
//!
//! A `MetaStore` is scoped to one tree. Writers are serialized by the
//! tree's self-lock; each store instance opens its own WAL connection so
//! readers elsewhere keep a consistent snapshot while a batch commits.

use camino::Utf8Path;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::*;

use crate::errors::{Error, Result};
use crate::hashing::ContentHash;
use crate::meta::{FileKind, FileMeta, FileStatus, is_ancestor};
use crate::vclock::VClock;

/// Row changes applied as one atomic unit.
///
/// `Insert` and `Update` get a fresh USN from the allocator inside the
/// batch transaction; the USN on the passed row is ignored.
#[derive(Debug, Clone)]
pub enum MetaOp {
    Insert(FileMeta),
    Update(FileMeta),
    /// Drop the row at this path, but only when no live rows remain under
    /// it. Tree destruction uses this; the sync path never does -
    /// tombstones are `Update`s.
    DeleteIfEmpty(String),
}

/// Commit batches at most this many row changes at a time to bound peak
/// memory and transaction length.
pub const APPLY_BATCH_LIMIT: usize = 500;

pub struct MetaStore {
    conn: Connection,
    tree: String,
}

impl MetaStore {
    pub fn open(db_path: &Utf8Path, tree_uuid: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        Ok(Self {
            conn,
            tree: tree_uuid.to_owned(),
        })
    }

    pub fn tree_uuid(&self) -> &str {
        &self.tree
    }

    pub fn get(&self, path: &str) -> Result<Option<FileMeta>> {
        let found = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM files WHERE tree = ?1 AND path = ?2"),
                params![self.tree, path],
                row_to_meta,
            )
            .optional()?;
        Ok(found)
    }

    /// Rows in lexicographic path order, tombstones included, starting
    /// strictly after `after` (or at the beginning). Paging with the last
    /// returned path yields each row exactly once per scan.
    pub fn scan_from(&self, after: Option<&str>, limit: usize) -> Result<Vec<FileMeta>> {
        let rows = self
            .conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM files
                 WHERE tree = ?1 AND path > ?2 ORDER BY path LIMIT ?3"
            ))?
            .query_map(
                params![self.tree, after.unwrap_or(""), limit as i64],
                row_to_meta,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The whole table, path-ordered. Planner snapshots and the metadata
    /// RPC use this.
    pub fn scan_all(&self) -> Result<Vec<FileMeta>> {
        let rows = self
            .conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM files WHERE tree = ?1 ORDER BY path"
            ))?
            .query_map([&self.tree], row_to_meta)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Reserve `n` strictly-increasing USNs, returning the first.
    /// Runs in its own transaction when called outside a batch.
    pub fn allocate_usns(&mut self, n: usize) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let first = allocate_in_tx(&tx, &self.tree, n)?;
        tx.commit()?;
        Ok(first)
    }

    /// Apply an ordered list of row operations atomically.
    ///
    /// USN allocation happens in the same transaction: on any failure no
    /// row is visible and no USN is consumed. Returns the number of rows
    /// actually changed.
    pub fn apply_batch(&mut self, ops: &[MetaOp]) -> Result<usize> {
        if ops.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let written = ops
            .iter()
            .filter(|op| matches!(op, MetaOp::Insert(_) | MetaOp::Update(_)))
            .count();
        let mut next_usn = if written > 0 {
            allocate_in_tx(&tx, &self.tree, written)?
        } else {
            0
        };

        let mut affected = 0;
        for op in ops {
            match op {
                MetaOp::Insert(row) | MetaOp::Update(row) => {
                    let usn = next_usn;
                    next_usn += 1;
                    affected += write_row(&tx, &self.tree, row, usn)?;
                }
                MetaOp::DeleteIfEmpty(path) => {
                    affected += delete_if_empty(&tx, &self.tree, path)?;
                }
            }
        }
        tx.commit()?;
        trace!("committed batch of {affected} rows for tree {}", self.tree);
        Ok(affected)
    }

    /// Largest USN ever handed out for this tree.
    pub fn last_usn(&self) -> Result<i64> {
        let next: Option<i64> = self
            .conn
            .query_row("SELECT next FROM usns WHERE tree = ?1", [&self.tree], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(next.unwrap_or(1) - 1)
    }
}

const COLUMNS: &str = "path, kind, status, mtime, length, sha1, usn, vclock, \
                       win_attr, unix_attr, android_attr, alias, modifier, timestamp";

fn allocate_in_tx(tx: &rusqlite::Transaction, tree: &str, n: usize) -> Result<i64> {
    let current: Option<i64> = tx
        .query_row("SELECT next FROM usns WHERE tree = ?1", [tree], |r| {
            r.get(0)
        })
        .optional()?;
    let first = current.unwrap_or(1);
    tx.execute(
        "REPLACE INTO usns (tree, next) VALUES (?1, ?2)",
        params![tree, first + n as i64],
    )?;
    Ok(first)
}

fn write_row(tx: &rusqlite::Transaction, tree: &str, row: &FileMeta, usn: i64) -> Result<usize> {
    let mut vclock = Vec::new();
    ciborium::into_writer(&row.vclock, &mut vclock)
        .map_err(|e| Error::content(format!("couldn't encode vclock: {e}")))?;
    let n = tx.execute(
        "REPLACE INTO files (tree, path, kind, status, mtime, length, sha1, usn, vclock,
                             win_attr, unix_attr, android_attr, alias, modifier, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            tree,
            row.path,
            kind_to_i64(row.kind),
            status_to_i64(row.status),
            row.mtime_ms,
            row.length,
            row.sha1.as_ref().map(|h| h.as_bytes().to_vec()),
            usn,
            vclock,
            row.win_attr,
            row.unix_attr,
            row.android_attr,
            row.alias,
            row.modifier,
            row.timestamp_ms,
        ],
    )?;
    Ok(n)
}

fn delete_if_empty(tx: &rusqlite::Transaction, tree: &str, path: &str) -> Result<usize> {
    // Any live row below the path keeps it alive.
    let mut stmt = tx.prepare(
        "SELECT path FROM files WHERE tree = ?1 AND status = 0 AND path > ?2 ORDER BY path",
    )?;
    let mut rows = stmt.query(params![tree, path])?;
    while let Some(r) = rows.next()? {
        let candidate: String = r.get(0)?;
        if !candidate.starts_with(path) {
            break;
        }
        if is_ancestor(path, &candidate) {
            return Ok(0);
        }
    }
    drop(rows);
    drop(stmt);
    let n = tx.execute(
        "DELETE FROM files WHERE tree = ?1 AND path = ?2",
        params![tree, path],
    )?;
    Ok(n)
}

fn kind_to_i64(k: FileKind) -> i64 {
    match k {
        FileKind::Regular => 0,
        FileKind::Directory => 1,
    }
}

fn status_to_i64(s: FileStatus) -> i64 {
    match s {
        FileStatus::Normal => 0,
        FileStatus::Removed => 1,
    }
}

fn row_to_meta(r: &rusqlite::Row) -> rusqlite::Result<FileMeta> {
    let kind = match r.get::<_, i64>(1)? {
        0 => FileKind::Regular,
        _ => FileKind::Directory,
    };
    let status = match r.get::<_, i64>(2)? {
        0 => FileStatus::Normal,
        _ => FileStatus::Removed,
    };
    let sha1 = r
        .get::<_, Option<Vec<u8>>>(5)?
        .as_deref()
        .and_then(ContentHash::from_bytes);
    let vclock_blob: Vec<u8> = r.get(7)?;
    let vclock: VClock = ciborium::from_reader(vclock_blob.as_slice()).unwrap_or_default();
    Ok(FileMeta {
        path: r.get(0)?,
        kind,
        status,
        mtime_ms: r.get(3)?,
        length: r.get(4)?,
        sha1,
        usn: r.get(6)?,
        vclock,
        win_attr: r.get(8)?,
        unix_attr: r.get(9)?,
        android_attr: r.get(10)?,
        alias: r.get(11)?,
        modifier: r.get(12)?,
        timestamp_ms: r.get(13)?,
    })
}
