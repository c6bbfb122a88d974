//! Cooperative cancellation.
//!
//! Three scopes set flags; indexer and executor loops poll them at every
//! boundary and unwind at the next safe point: global shutdown, a destroyed
//! tree, and a destroyed tree pair.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Inner {
    shutdown: AtomicBool,
    dead_trees: Mutex<BTreeSet<String>>,
    dead_pairs: Mutex<BTreeSet<(String, String)>>,
}

#[derive(Debug, Clone, Default)]
pub struct Abort {
    inner: Arc<Inner>,
}

impl Abort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Flag every task touching `tree` to unwind.
    pub fn kill_tree(&self, tree: &str) {
        self.inner
            .dead_trees
            .lock()
            .unwrap()
            .insert(tree.to_owned());
    }

    pub fn kill_pair(&self, local: &str, remote: &str) {
        self.inner
            .dead_pairs
            .lock()
            .unwrap()
            .insert((local.to_owned(), remote.to_owned()));
    }

    /// Forget a tree kill once its tasks have unwound. A cancel-without-
    /// destroy (user hit stop) needs this before the next sync can run.
    pub fn revive_tree(&self, tree: &str) {
        self.inner.dead_trees.lock().unwrap().remove(tree);
    }

    /// Forget a pair kill once its tasks have unwound, so future syncs of
    /// the pair can run.
    pub fn revive_pair(&self, local: &str, remote: &str) {
        self.inner
            .dead_pairs
            .lock()
            .unwrap()
            .remove(&(local.to_owned(), remote.to_owned()));
    }

    /// Should work on `tree` (alone) stop?
    pub fn tree_aborted(&self, tree: &str) -> bool {
        self.is_shutdown() || self.inner.dead_trees.lock().unwrap().contains(tree)
    }

    /// Should work on the `(local, remote)` pair stop?
    pub fn pair_aborted(&self, local: &str, remote: &str) -> bool {
        if self.is_shutdown() {
            return true;
        }
        {
            let trees = self.inner.dead_trees.lock().unwrap();
            if trees.contains(local) || trees.contains(remote) {
                return true;
            }
        }
        self.inner
            .dead_pairs
            .lock()
            .unwrap()
            .contains(&(local.to_owned(), remote.to_owned()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scopes_nest() {
        let abort = Abort::new();
        assert!(!abort.pair_aborted("a", "b"));

        abort.kill_pair("a", "b");
        assert!(abort.pair_aborted("a", "b"));
        assert!(!abort.pair_aborted("b", "a"));
        assert!(!abort.tree_aborted("a"));
        abort.revive_pair("a", "b");
        assert!(!abort.pair_aborted("a", "b"));

        abort.kill_tree("a");
        assert!(abort.tree_aborted("a"));
        assert!(abort.pair_aborted("a", "z"));
        assert!(abort.pair_aborted("z", "a"));
        abort.revive_tree("a");
        assert!(!abort.tree_aborted("a"));
        abort.kill_tree("a");

        abort.shutdown();
        assert!(abort.tree_aborted("anything"));
        assert!(abort.pair_aborted("x", "y"));
    }
}
