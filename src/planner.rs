//! Decide what must move between two trees.
//!
//! A pairwise, path-ordered walk over two metadata snapshots classifies
//! every path into push/pull meta or data actions, filters them by
//! permission, whitelist, and backup role, folds renames, and partitions
//! the result into execution order.

use tracing::*;

use crate::db::{SyncFolder, SyncKind, SyncPerm, Tree, TreeRole};
use crate::meta::{FileMeta, FileStatus};
use crate::rename::{self, Rename};
use crate::synclist::SyncList;
use crate::vclock::Causality;

/// Which way the bytes (or metadata) flow for one action.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncMode {
    Push,
    Pull,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ActionKind {
    /// Self-contained row change: directory create, any remove, or a
    /// regular file whose bytes the receiver already has.
    Meta,
    /// Bytes must move.
    Data,
}

/// One planned action, seen from the receiving side:
/// apply `src` where `dst` currently is.
#[derive(Debug, Clone)]
pub struct SyncFile {
    pub mode: SyncMode,
    pub kind: ActionKind,
    /// Vclocks diverged; the receiver preserves its local copy under a
    /// conflict name before applying.
    pub conflict: bool,
    /// The receiving side's current row, if any.
    pub dst: Option<FileMeta>,
    /// The row to apply. For conflicts and backup restores its vclock has
    /// already been adjusted to dominate.
    pub src: FileMeta,
}

impl SyncFile {
    pub fn path(&self) -> &str {
        &self.src.path
    }

    pub fn is_remove(&self) -> bool {
        self.src.status == FileStatus::Removed
    }
}

/// The planner's output, in execution order: tombstones children-first,
/// creations parents-first, then renames, then bulk data.
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub pull_remove_metas: Vec<SyncFile>,
    pub pull_make_metas: Vec<SyncFile>,
    pub pull_renames: Vec<Rename>,
    pub pull_datas: Vec<SyncFile>,
    pub push_remove_metas: Vec<SyncFile>,
    pub push_make_metas: Vec<SyncFile>,
    pub push_renames: Vec<Rename>,
    pub push_datas: Vec<SyncFile>,
    /// Rows that matched exactly; reported, not executed.
    pub consistent_files: u32,
    pub consistent_bytes: i64,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.pull_remove_metas.is_empty()
            && self.pull_make_metas.is_empty()
            && self.pull_renames.is_empty()
            && self.pull_datas.is_empty()
            && self.push_remove_metas.is_empty()
            && self.push_make_metas.is_empty()
            && self.push_renames.is_empty()
            && self.push_datas.is_empty()
    }

    pub fn action_count(&self) -> usize {
        self.pull_remove_metas.len()
            + self.pull_make_metas.len()
            + self.pull_renames.len() * 2
            + self.pull_datas.len()
            + self.push_remove_metas.len()
            + self.push_make_metas.len()
            + self.push_renames.len() * 2
            + self.push_datas.len()
    }
}

/// Keep any one plan bounded; what doesn't fit waits for the next cycle.
pub const PLAN_ACTION_LIMIT: usize = 10_000;

pub struct PlanInput<'a> {
    pub sync: &'a SyncFolder,
    pub local_tree: &'a Tree,
    pub remote_tree: &'a Tree,
    /// Lexicographic by path, tombstones included.
    pub local_rows: Vec<FileMeta>,
    pub remote_rows: Vec<FileMeta>,
    pub local_list: &'a SyncList,
    pub remote_list: &'a SyncList,
}

pub fn plan(input: PlanInput) -> SyncPlan {
    let mut walk = Walker::new(&input);
    let mut candidates = Vec::new();

    let mut local_iter = input.local_rows.iter().peekable();
    let mut remote_iter = input.remote_rows.iter().peekable();
    loop {
        if candidates.len() >= PLAN_ACTION_LIMIT {
            debug!("plan hit the action limit; the rest waits for the next cycle");
            break;
        }
        let (local, remote) = match (local_iter.peek(), remote_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => (local_iter.next(), None),
            (None, Some(_)) => (None, remote_iter.next()),
            (Some(l), Some(r)) => match l.path.cmp(&r.path) {
                std::cmp::Ordering::Less => (local_iter.next(), None),
                std::cmp::Ordering::Greater => (None, remote_iter.next()),
                std::cmp::Ordering::Equal => (local_iter.next(), remote_iter.next()),
            },
        };
        if let Some(c) = walk.classify(local, remote) {
            candidates.push(c);
        }
    }

    partition(candidates, walk.consistent_files, walk.consistent_bytes)
}

struct Walker<'a> {
    perm: SyncPerm,
    backup: BackupSide,
    local_tree: &'a str,
    remote_tree: &'a str,
    local_list: &'a SyncList,
    remote_list: &'a SyncList,
    consistent_files: u32,
    consistent_bytes: i64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum BackupSide {
    NotBackup,
    /// We hold the source: never pull, re-assert over divergence.
    Source,
    /// We hold the destination: never push, accept restores.
    Destination,
}

impl<'a> Walker<'a> {
    fn new(input: &'a PlanInput) -> Self {
        let backup = if input.sync.kind == SyncKind::Backup {
            match (input.local_tree.role, input.remote_tree.role) {
                (TreeRole::BackupSrc, _) | (_, TreeRole::BackupDst) => BackupSide::Source,
                (TreeRole::BackupDst, _) | (_, TreeRole::BackupSrc) => BackupSide::Destination,
                _ => BackupSide::NotBackup,
            }
        } else {
            BackupSide::NotBackup
        };
        Self {
            perm: input.sync.perm,
            backup,
            local_tree: &input.local_tree.uuid,
            remote_tree: &input.remote_tree.uuid,
            local_list: input.local_list,
            remote_list: input.remote_list,
            consistent_files: 0,
            consistent_bytes: 0,
        }
    }

    fn count_consistent(&mut self, row: &FileMeta) {
        if row.is_regular() && row.status == FileStatus::Normal {
            self.consistent_files += 1;
            self.consistent_bytes += row.length;
        }
    }

    /// Classify one path. Returns the surviving candidate, if any.
    fn classify(&mut self, local: Option<&FileMeta>, remote: Option<&FileMeta>) -> Option<SyncFile> {
        let (mut mode, mut conflict) = match (local, remote) {
            (Some(_), None) => (SyncMode::Push, false),
            (None, Some(_)) => (SyncMode::Pull, false),
            (Some(l), Some(r)) => match l.vclock.compare(&r.vclock) {
                Causality::Equal => {
                    self.count_consistent(l);
                    return None;
                }
                Causality::Greater => (SyncMode::Push, false),
                Causality::Less => (SyncMode::Pull, false),
                Causality::Conflict => (SyncMode::Pull, true),
            },
            (None, None) => unreachable!(),
        };

        // Backup syncs are one-way: the source always wins.
        let mut restore = false;
        match self.backup {
            BackupSide::NotBackup => {}
            BackupSide::Source => {
                if mode == SyncMode::Pull {
                    let (Some(l), Some(r)) = (local, remote) else {
                        // A file existing only on the destination never
                        // flows back.
                        return None;
                    };
                    if l.same_content(r) && l.status == r.status {
                        self.count_consistent(l);
                        return None;
                    }
                    // The destination diverged; re-assert our row.
                    mode = SyncMode::Push;
                    conflict = false;
                    restore = true;
                }
            }
            BackupSide::Destination => {
                if mode == SyncMode::Push {
                    let (Some(l), Some(r)) = (local, remote) else {
                        return None;
                    };
                    if l.same_content(r) && l.status == r.status {
                        self.count_consistent(l);
                        return None;
                    }
                    // We diverged; take the source's row back.
                    mode = SyncMode::Pull;
                    conflict = false;
                    restore = true;
                }
            }
        }

        // Our permission on the sync gates each direction.
        match mode {
            SyncMode::Pull if self.perm == SyncPerm::WriteOnly => return None,
            SyncMode::Push if self.perm == SyncPerm::ReadOnly => return None,
            _ if self.perm == SyncPerm::Disconnected => return None,
            _ => {}
        }

        // Receiving side's whitelist.
        let (src, dst, receiving_list) = match mode {
            SyncMode::Pull => (remote.unwrap(), local, self.local_list),
            SyncMode::Push => (local.unwrap(), remote, self.remote_list),
        };
        if !receiving_list.find(&src.path).syncable() {
            return None;
        }

        let kind = if src.is_directory() || src.status == FileStatus::Removed {
            ActionKind::Meta
        } else if dst.is_some_and(|d| {
            d.is_regular() && d.status == FileStatus::Normal && d.sha1 == src.sha1
        }) {
            ActionKind::Meta
        } else {
            ActionKind::Data
        };

        // Conflict rows go over with their own history; the receiving
        // applier preserves its diverged copy, merges the clocks, and the
        // merged row dominates both sides. Restores mint their dominating
        // clock here, since the applier can't know the source must win.
        let mut src = src.clone();
        if restore {
            if let Some(d) = dst {
                src.vclock.merge(&d.vclock);
            }
            let source_tree = match mode {
                SyncMode::Pull => self.remote_tree,
                SyncMode::Push => self.local_tree,
            };
            src.vclock.increment(source_tree);
        }

        trace!(
            "{:?} {:?} {}{}",
            mode,
            kind,
            src.path,
            if conflict { " (conflict)" } else { "" }
        );
        Some(SyncFile {
            mode,
            kind,
            conflict,
            dst: dst.cloned(),
            src,
        })
    }
}

fn partition(candidates: Vec<SyncFile>, consistent_files: u32, consistent_bytes: i64) -> SyncPlan {
    let mut plan = SyncPlan {
        consistent_files,
        consistent_bytes,
        ..Default::default()
    };

    let mut pull_removes = Vec::new();
    let mut pull_inserts = Vec::new();
    let mut push_removes = Vec::new();
    let mut push_inserts = Vec::new();

    for c in candidates {
        let (removes, inserts, makes, datas) = match c.mode {
            SyncMode::Pull => (
                &mut pull_removes,
                &mut pull_inserts,
                &mut plan.pull_make_metas,
                &mut plan.pull_datas,
            ),
            SyncMode::Push => (
                &mut push_removes,
                &mut push_inserts,
                &mut plan.push_make_metas,
                &mut plan.push_datas,
            ),
        };
        match c.kind {
            ActionKind::Meta if c.is_remove() => removes.push(c),
            ActionKind::Meta => makes.push(c),
            ActionKind::Data if c.dst.is_none() => inserts.push(c),
            ActionKind::Data => datas.push(c),
        }
    }

    // Fold REMOVE+INSERT pairs sharing content into renames; leftovers
    // drain back into their queues.
    let pull_outcome = rename::detect_renames(pull_removes, pull_inserts);
    plan.pull_renames = pull_outcome.renames;
    plan.pull_remove_metas = pull_outcome.removes;
    plan.pull_datas.extend(pull_outcome.inserts);

    let push_outcome = rename::detect_renames(push_removes, push_inserts);
    plan.push_renames = push_outcome.renames;
    plan.push_remove_metas = push_outcome.removes;
    plan.push_datas.extend(push_outcome.inserts);

    // Children tombstone before their parents; parents exist before their
    // children; data in path order for predictability.
    plan.pull_remove_metas
        .sort_by(|a, b| b.path().cmp(a.path()));
    plan.push_remove_metas
        .sort_by(|a, b| b.path().cmp(a.path()));
    plan.pull_make_metas.sort_by(|a, b| a.path().cmp(b.path()));
    plan.push_make_metas.sort_by(|a, b| a.path().cmp(b.path()));
    plan.pull_datas.sort_by(|a, b| a.path().cmp(b.path()));
    plan.push_datas.sort_by(|a, b| a.path().cmp(b.path()));

    plan
}
