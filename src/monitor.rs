//! Observability: process-wide op counters, plus the per-task monitors
//! that feed tree status and the active-transfer list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Instant;

use enum_map::{Enum, EnumMap};
use rustc_hash::FxHashMap;
use tracing::*;

/// Count how many times we do various important operations.
#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    IndexRun,
    SyncRun,
    FileTransferred,
    FileSkipped,
    RenameApplied,
    ConflictPreserved,
    StagingReclaimed,
    CacheHit,
    CacheMiss,
}

static COUNTER_MAP: LazyLock<EnumMap<Op, AtomicUsize>> = LazyLock::new(EnumMap::default);

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

pub fn log_counts() {
    // Probably not needed; but we're probably calling this once at exit.
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0) // Ignore things we didn't do
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::IndexRun => "index runs",
        Op::SyncRun => "sync runs",
        Op::FileTransferred => "files transferred",
        Op::FileSkipped => "files skipped",
        Op::RenameApplied => "renames applied",
        Op::ConflictPreserved => "conflict copies preserved",
        Op::StagingReclaimed => "staging dirs reclaimed",
        Op::CacheHit => "download cache hits",
        Op::CacheMiss => "download cache misses",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransferKind {
    Put,
    Get,
}

/// One row of the active-transfer list.
#[derive(Debug, Clone)]
pub struct TransferEntry {
    pub id: u64,
    pub kind: TransferKind,
    pub local_tree: String,
    pub remote_tree: String,
    pub active_path: String,
    pub total_files: u32,
    pub done_files: u32,
    pub skipped_files: u32,
    pub total_bytes: i64,
    pub done_bytes: i64,
}

/// Rolled-up counters for one tree.
#[derive(Debug, Clone, Default)]
pub struct TreeStatus {
    pub files_transferred: u64,
    pub files_skipped: u64,
    pub bytes_transferred: u64,
    pub bytes_skipped: u64,
    /// Bytes per second over the last few seconds of activity.
    pub speed_bps: u64,
}

const SPEED_WINDOW_SECS: u64 = 3;
/// The transfer list shown to UIs is bounded; finished entries fall off.
const TRANSFER_LIST_CAP: usize = 64;

#[derive(Default)]
struct Shared {
    transfers: Mutex<VecDeque<TransferEntry>>,
    trees: Mutex<FxHashMap<String, TreeStatus>>,
    ticks: Mutex<FxHashMap<String, VecDeque<(Instant, u64)>>>,
}

/// Engine-owned registry. Clones share state.
#[derive(Clone, Default)]
pub struct Monitor {
    shared: Arc<Shared>,
    next_id: Arc<AtomicU64>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking one transfer task.
    pub fn start_task(
        &self,
        kind: TransferKind,
        local_tree: &str,
        remote_tree: &str,
        total_files: u32,
        total_bytes: i64,
    ) -> TaskMonitor {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = TransferEntry {
            id,
            kind,
            local_tree: local_tree.to_owned(),
            remote_tree: remote_tree.to_owned(),
            active_path: String::new(),
            total_files,
            done_files: 0,
            skipped_files: 0,
            total_bytes,
            done_bytes: 0,
        };
        {
            let mut list = self.shared.transfers.lock().unwrap();
            if list.len() >= TRANSFER_LIST_CAP {
                list.pop_front();
            }
            list.push_back(entry);
        }
        TaskMonitor {
            monitor: self.clone(),
            id,
            local_tree: local_tree.to_owned(),
        }
    }

    pub fn tree_status(&self, tree: &str) -> TreeStatus {
        let mut status = self
            .shared
            .trees
            .lock()
            .unwrap()
            .get(tree)
            .cloned()
            .unwrap_or_default();
        status.speed_bps = self.speed(tree);
        status
    }

    pub fn transfer_list(&self) -> Vec<TransferEntry> {
        self.shared.transfers.lock().unwrap().iter().cloned().collect()
    }

    fn with_entry(&self, id: u64, f: impl FnOnce(&mut TransferEntry)) {
        let mut list = self.shared.transfers.lock().unwrap();
        if let Some(entry) = list.iter_mut().find(|e| e.id == id) {
            f(entry);
        }
    }

    fn tick_bytes(&self, tree: &str, bytes: u64) {
        let now = Instant::now();
        let mut ticks = self.shared.ticks.lock().unwrap();
        let window = ticks.entry(tree.to_owned()).or_default();
        window.push_back((now, bytes));
        while let Some((t, _)) = window.front() {
            if now.duration_since(*t).as_secs() >= SPEED_WINDOW_SECS {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    fn speed(&self, tree: &str) -> u64 {
        let ticks = self.shared.ticks.lock().unwrap();
        let Some(window) = ticks.get(tree) else {
            return 0;
        };
        let now = Instant::now();
        let in_window: u64 = window
            .iter()
            .filter(|(t, _)| now.duration_since(*t).as_secs() < SPEED_WINDOW_SECS)
            .map(|(_, b)| b)
            .sum();
        in_window / SPEED_WINDOW_SECS
    }
}

/// Per-task event sink handed to the executor.
pub struct TaskMonitor {
    monitor: Monitor,
    id: u64,
    local_tree: String,
}

impl TaskMonitor {
    /// A new file started moving.
    pub fn on_file_transfer(&self, path: &str) {
        self.monitor.with_entry(self.id, |e| {
            e.active_path = path.to_owned();
        });
    }

    pub fn on_file_transferred(&self, count: u32) {
        add(Op::FileTransferred, count as usize);
        self.monitor.with_entry(self.id, |e| e.done_files += count);
        let mut trees = self.monitor.shared.trees.lock().unwrap();
        trees.entry(self.local_tree.clone()).or_default().files_transferred += count as u64;
    }

    pub fn on_file_skipped(&self, count: u32) {
        add(Op::FileSkipped, count as usize);
        self.monitor.with_entry(self.id, |e| e.skipped_files += count);
        let mut trees = self.monitor.shared.trees.lock().unwrap();
        trees.entry(self.local_tree.clone()).or_default().files_skipped += count as u64;
    }

    pub fn on_byte_transferred(&self, nbytes: u64) {
        self.monitor
            .with_entry(self.id, |e| e.done_bytes += nbytes as i64);
        {
            let mut trees = self.monitor.shared.trees.lock().unwrap();
            trees.entry(self.local_tree.clone()).or_default().bytes_transferred += nbytes;
        }
        self.monitor.tick_bytes(&self.local_tree, nbytes);
    }

    pub fn on_byte_skipped(&self, nbytes: u64) {
        let mut trees = self.monitor.shared.trees.lock().unwrap();
        trees.entry(self.local_tree.clone()).or_default().bytes_skipped += nbytes;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tasks_feed_tree_and_list() {
        let monitor = Monitor::new();
        let task = monitor.start_task(TransferKind::Get, "t1", "t2", 3, 300);

        task.on_file_transfer("/a.txt");
        task.on_byte_transferred(100);
        task.on_file_transferred(1);
        task.on_file_skipped(1);
        task.on_byte_skipped(100);

        let list = monitor.transfer_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].active_path, "/a.txt");
        assert_eq!(list[0].done_files, 1);
        assert_eq!(list[0].skipped_files, 1);
        assert_eq!(list[0].done_bytes, 100);

        let status = monitor.tree_status("t1");
        assert_eq!(status.files_transferred, 1);
        assert_eq!(status.bytes_transferred, 100);
        assert_eq!(status.bytes_skipped, 100);

        assert_eq!(monitor.tree_status("other").files_transferred, 0);
    }

    #[test]
    fn transfer_list_is_bounded() {
        let monitor = Monitor::new();
        for i in 0..(TRANSFER_LIST_CAP + 10) {
            let _ = monitor.start_task(TransferKind::Put, &format!("t{i}"), "r", 0, 0);
        }
        assert_eq!(monitor.transfer_list().len(), TRANSFER_LIST_CAP);
    }
}
