//! Per-file metadata rows - what a tree contains and how it got there.
//!
//! Rows live in the [`MetaStore`](crate::store::MetaStore), keyed by
//! tree-relative path. A path here is always a `String` starting with `/`,
//! components separated by `/` - the same shape the sync list and the wire
//! use. The tree root itself has no row.

use camino::{Utf8Path, Utf8PathBuf};
use serde_derive::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::hashing::ContentHash;
use crate::vclock::VClock;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Directory,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Normal,
    /// A tombstone. It keeps its vclock to preserve causality and is never
    /// physically dropped by the engine.
    Removed,
}

/// One row of tree metadata.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Tree-relative, `/`-rooted.
    pub path: String,
    pub kind: FileKind,
    pub status: FileStatus,
    /// Modification time in milliseconds since the epoch.
    pub mtime_ms: i64,
    pub length: i64,
    /// Content hash; regular files only.
    pub sha1: Option<ContentHash>,
    /// Update sequence number, strictly increasing per tree.
    /// Zero until the store assigns one.
    pub usn: i64,
    pub vclock: VClock,
    pub win_attr: u32,
    pub unix_attr: u32,
    pub android_attr: u32,
    /// Opaque platform handle (e.g. a content-provider id on Android).
    pub alias: Option<String>,
    /// Uuid of the device that made the last observed change.
    pub modifier: String,
    /// When the row was written, milliseconds since the epoch.
    pub timestamp_ms: i64,
}

impl FileMeta {
    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_tombstone(&self) -> bool {
        self.status == FileStatus::Removed
    }

    /// Do two rows describe the same bytes on disk?
    pub fn same_content(&self, other: &FileMeta) -> bool {
        self.kind == other.kind && self.length == other.length && self.sha1 == other.sha1
    }

    /// The absolute location of this row under `root`.
    pub fn abs_path(&self, root: &Utf8Path) -> Utf8PathBuf {
        join_rel(root, &self.path)
    }
}

/// Join a `/`-rooted relative path onto a tree root.
pub fn join_rel(root: &Utf8Path, rel: &str) -> Utf8PathBuf {
    debug_assert!(rel.starts_with('/'));
    if rel == "/" {
        return root.to_owned();
    }
    root.join(rel.trim_start_matches('/'))
}

/// Validate and normalize a user-supplied relative path.
/// `/` alone names the whole tree.
pub fn check_rel(rel: &str) -> Result<&str> {
    if !rel.starts_with('/') {
        return Err(Error::config(format!("path {rel} must start with /")));
    }
    if rel == "/" {
        return Ok(rel);
    }
    if rel.len() > 1 && rel.ends_with('/') {
        return Err(Error::config(format!("path {rel} must not end with /")));
    }
    for component in rel.split('/').skip(1) {
        if component.is_empty() || component == "." || component == ".." {
            return Err(Error::config(format!("path {rel} has a bad component")));
        }
    }
    Ok(rel)
}

/// The parent of a relative path, or `None` for top-level entries.
pub fn parent_rel(rel: &str) -> Option<&str> {
    let cut = rel.rfind('/')?;
    if cut == 0 { None } else { Some(&rel[..cut]) }
}

/// Is `ancestor` a strict path-prefix of `rel` on a component boundary?
pub fn is_ancestor(ancestor: &str, rel: &str) -> bool {
    rel.len() > ancestor.len()
        && rel.starts_with(ancestor)
        && (ancestor == "/" || rel.as_bytes()[ancestor.len()] == b'/')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rel_paths_join_onto_roots() {
        let root = Utf8Path::new("/home/me/Sync");
        assert_eq!(join_rel(root, "/a/b.txt"), "/home/me/Sync/a/b.txt");
        assert_eq!(join_rel(root, "/"), "/home/me/Sync");
    }

    #[test]
    fn bad_rel_paths_are_rejected() {
        assert!(check_rel("/a/b").is_ok());
        assert!(check_rel("/").is_ok());
        assert!(check_rel("a/b").is_err());
        assert!(check_rel("/a/").is_err());
        assert!(check_rel("/a//b").is_err());
        assert!(check_rel("/a/../b").is_err());
    }

    #[test]
    fn parents() {
        assert_eq!(parent_rel("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_rel("/a"), None);
    }

    #[test]
    fn ancestry_respects_component_boundaries() {
        assert!(is_ancestor("/a", "/a/b"));
        assert!(is_ancestor("/", "/a"));
        assert!(!is_ancestor("/a", "/ab"));
        assert!(!is_ancestor("/a/b", "/a"));
        assert!(!is_ancestor("/a", "/a"));
    }
}
