//! Process-local locking over ordered tree pairs.
//!
//! A sync against `(local, remote)` and an index of `tree` (a self-pair
//! `(tree, tree)`) share one table of held pairs. There is no blocking
//! `lock` - callers handle refusal by rescheduling.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::*;

/// The lock table. Clone freely; clones share the table.
#[derive(Debug, Clone, Default)]
pub struct TreeMutex {
    held: Arc<Mutex<BTreeSet<(String, String)>>>,
}

/// A held pair; unlocks on drop.
pub struct TreeLock {
    table: TreeMutex,
    pair: (String, String),
}

impl TreeMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take `(local, remote)`. Use the same uuid twice for a
    /// self-lock. Returns `None` if the pair is already held.
    pub fn try_lock(&self, local: &str, remote: &str) -> Option<TreeLock> {
        let pair = (local.to_owned(), remote.to_owned());
        let inserted = self.held.lock().unwrap().insert(pair.clone());
        if inserted {
            trace!("locked ({local}, {remote})");
            Some(TreeLock {
                table: self.clone(),
                pair,
            })
        } else {
            trace!("({local}, {remote}) already held");
            None
        }
    }

    /// Is any sync or index in flight?
    pub fn is_idle(&self) -> bool {
        self.held.lock().unwrap().is_empty()
    }

    /// Drop every held pair. Only for shutdown, after workers have quit;
    /// outstanding guards unlock no-ops afterwards.
    pub fn clear(&self) {
        self.held.lock().unwrap().clear();
    }
}

impl Drop for TreeLock {
    fn drop(&mut self) {
        let (local, remote) = &self.pair;
        trace!("unlocked ({local}, {remote})");
        self.table.held.lock().unwrap().remove(&self.pair);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pairs_exclude_only_themselves() {
        let table = TreeMutex::new();
        let ab = table.try_lock("a", "b").unwrap();
        // Same pair refuses...
        assert!(table.try_lock("a", "b").is_none());
        // ...but the reversed pair and self-pairs are distinct.
        let _ba = table.try_lock("b", "a").unwrap();
        let _aa = table.try_lock("a", "a").unwrap();
        assert!(!table.is_idle());

        drop(ab);
        assert!(table.try_lock("a", "b").is_some());
    }

    #[test]
    fn guards_unlock_on_drop() {
        let table = TreeMutex::new();
        {
            let _guard = table.try_lock("t", "t").unwrap();
            assert!(!table.is_idle());
        }
        assert!(table.is_idle());
    }
}
