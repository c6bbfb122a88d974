//! Wire records: the `.zisync.meta` manifest, metadata snapshots, and the
//! path list a GET request carries. All CBOR.

use serde_derive::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::hashing::ContentHash;
use crate::meta::{FileKind, FileMeta, FileStatus};
use crate::vclock::VClock;

/// One file stat as transferred. The vclock is a counter list aligned
/// against the carrying record's `tree_uuids`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct MsgStat {
    pub path: String,
    pub kind: FileKind,
    pub status: FileStatus,
    pub mtime_ms: i64,
    pub length: i64,
    pub usn: i64,
    pub sha1: Option<ContentHash>,
    pub win_attr: u32,
    pub unix_attr: u32,
    pub android_attr: u32,
    pub modifier: String,
    pub timestamp_ms: i64,
    pub vclock: Vec<u64>,
}

impl MsgStat {
    pub fn from_meta(meta: &FileMeta, tree_uuids: &[String]) -> Self {
        Self {
            path: meta.path.clone(),
            kind: meta.kind,
            status: meta.status,
            mtime_ms: meta.mtime_ms,
            length: meta.length,
            usn: meta.usn,
            sha1: meta.sha1,
            win_attr: meta.win_attr,
            unix_attr: meta.unix_attr,
            android_attr: meta.android_attr,
            modifier: meta.modifier.clone(),
            timestamp_ms: meta.timestamp_ms,
            vclock: meta.vclock.to_aligned(tree_uuids),
        }
    }

    pub fn into_meta(self, tree_uuids: &[String]) -> FileMeta {
        FileMeta {
            path: self.path,
            kind: self.kind,
            status: self.status,
            mtime_ms: self.mtime_ms,
            length: self.length,
            sha1: self.sha1,
            usn: self.usn,
            vclock: VClock::from_aligned(tree_uuids, &self.vclock),
            win_attr: self.win_attr,
            unix_attr: self.unix_attr,
            android_attr: self.android_attr,
            alias: None,
            modifier: self.modifier,
            timestamp_ms: self.timestamp_ms,
        }
    }
}

/// The `.zisync.meta` record: the first entry of every PUT stream,
/// carrying the remote-side effects of the session.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// The pushing tree.
    pub sender_tree: String,
    /// The tree being pushed into.
    pub receiver_tree: String,
    /// Every tree participating in the sync, for vclock alignment.
    pub tree_uuids: Vec<String>,
    pub stats: Vec<MsgStat>,
}

/// What `GET meta` returns: the remote tree's current table plus the
/// whitelist the pushing side must respect.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct MetaSnapshot {
    pub tree_uuid: String,
    pub tree_uuids: Vec<String>,
    pub synclist: Vec<String>,
    pub stats: Vec<MsgStat>,
}

/// The body of a `GET tar` request.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PathList {
    pub paths: Vec<String>,
}

pub fn encode<T: serde::Serialize>(record: &T) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes)
        .map_err(|e| Error::content(format!("couldn't encode record: {e}")))?;
    Ok(bytes)
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| Error::content(format!("undecodable record: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;

    fn uuids() -> Vec<String> {
        vec!["t1".into(), "t2".into()]
    }

    fn meta() -> FileMeta {
        let mut vclock = VClock::first("t1");
        vclock.increment("t2");
        FileMeta {
            path: "/a.txt".into(),
            kind: FileKind::Regular,
            status: FileStatus::Normal,
            mtime_ms: 123,
            length: 5,
            sha1: Some(ContentHash::hash(b"hello")),
            usn: 7,
            vclock,
            win_attr: 0,
            unix_attr: 0o644,
            android_attr: 0,
            alias: None,
            modifier: "dev1".into(),
            timestamp_ms: 456,
        }
    }

    #[test]
    fn stats_round_trip_through_alignment() {
        let uuids = uuids();
        let original = meta();
        let stat = MsgStat::from_meta(&original, &uuids);
        assert_eq!(stat.vclock, vec![1, 1]);
        let back = stat.into_meta(&uuids);
        assert_eq!(back, original);
    }

    #[test]
    fn manifest_round_trips_as_cbor() {
        let uuids = uuids();
        let manifest = Manifest {
            sender_tree: "t1".into(),
            receiver_tree: "t2".into(),
            tree_uuids: uuids.clone(),
            stats: vec![MsgStat::from_meta(&meta(), &uuids)],
        };
        let bytes = encode(&manifest).unwrap();
        let back: Manifest = decode(&bytes).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn garbage_is_a_content_error() {
        let err = decode::<Manifest>(b"not cbor at all").unwrap_err();
        assert_eq!(err.category(), "content");
    }
}
