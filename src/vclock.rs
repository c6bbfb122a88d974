//! Version vectors - the causal-order witness carried by every metadata row.

use std::collections::BTreeMap;
use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// Outcome of comparing two vclocks under the standard partial order.
///
/// `Equal` means byte-identical causal history; callers short-circuit all
/// further work for that pair of rows.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Causality {
    Equal,
    Less,
    Greater,
    Conflict,
}

/// An ordered mapping from tree uuid to a non-negative edit counter.
///
/// Components absent from one side read as zero, which makes [`compare`]
/// total over any two vclocks regardless of which trees were participating
/// when each row was written.
///
/// [`compare`]: VClock::compare
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct VClock {
    components: BTreeMap<String, u64>,
}

impl VClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh clock for a row first observed by `self_tree`: `{self: 1}`.
    pub fn first(self_tree: &str) -> Self {
        let mut v = Self::new();
        v.increment(self_tree);
        v
    }

    pub fn get(&self, tree: &str) -> u64 {
        self.components.get(tree).copied().unwrap_or(0)
    }

    /// Bump the self component by one; all others unchanged.
    pub fn increment(&mut self, self_tree: &str) {
        *self.components.entry(self_tree.to_owned()).or_insert(0) += 1;
    }

    /// Component-wise max, used when two histories join.
    pub fn merge(&mut self, other: &VClock) {
        for (tree, &count) in &other.components {
            let mine = self.components.entry(tree.clone()).or_insert(0);
            *mine = (*mine).max(count);
        }
    }

    pub fn compare(&self, other: &VClock) -> Causality {
        let mut less = false;
        let mut greater = false;
        // Walk the union of both key sets.
        for tree in self.components.keys().chain(other.components.keys()) {
            let a = self.get(tree);
            let b = other.get(tree);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }
        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Less,
            (false, true) => Causality::Greater,
            (true, true) => Causality::Conflict,
        }
    }

    /// Wire form: counters aligned against an ordered tree-uuid list.
    /// Trees we have no component for encode as zero.
    pub fn to_aligned(&self, tree_uuids: &[String]) -> Vec<u64> {
        tree_uuids.iter().map(|t| self.get(t)).collect()
    }

    /// Rebuild from the wire form. Extra counters past the uuid list are
    /// ignored; zero counters are dropped so the map stays minimal.
    pub fn from_aligned(tree_uuids: &[String], counts: &[u64]) -> Self {
        let components = tree_uuids
            .iter()
            .zip(counts.iter())
            .filter(|&(_, &c)| c > 0)
            .map(|(t, &c)| (t.clone(), c))
            .collect();
        Self { components }
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.components.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

impl fmt::Display for VClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (tree, count)) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            // Eight chars of uuid is plenty for logs.
            write!(f, "{}:{}", &tree[..tree.len().min(8)], count)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn clock(pairs: &[(&str, u64)]) -> VClock {
        let mut v = VClock::new();
        for (tree, count) in pairs {
            for _ in 0..*count {
                v.increment(tree);
            }
        }
        v
    }

    #[test]
    fn fresh_rows_start_at_one() {
        let v = VClock::first("a");
        assert_eq!(v.get("a"), 1);
        assert_eq!(v.get("b"), 0);
    }

    #[test]
    fn compare_covers_all_four_outcomes() {
        let a = clock(&[("a", 2), ("b", 1)]);
        let b = clock(&[("a", 2), ("b", 1)]);
        assert_eq!(a.compare(&b), Causality::Equal);

        let newer = clock(&[("a", 3), ("b", 1)]);
        assert_eq!(a.compare(&newer), Causality::Less);
        assert_eq!(newer.compare(&a), Causality::Greater);

        let sideways = clock(&[("a", 1), ("b", 2)]);
        assert_eq!(a.compare(&sideways), Causality::Conflict);
        assert_eq!(sideways.compare(&a), Causality::Conflict);
    }

    #[test]
    fn absent_components_read_as_zero() {
        let a = clock(&[("a", 1)]);
        let b = clock(&[("a", 1), ("b", 1)]);
        assert_eq!(a.compare(&b), Causality::Less);
        assert_eq!(VClock::new().compare(&a), Causality::Less);
        assert_eq!(VClock::new().compare(&VClock::new()), Causality::Equal);
    }

    #[test]
    fn merge_takes_component_wise_max() {
        let mut a = clock(&[("a", 3), ("b", 1)]);
        let b = clock(&[("a", 1), ("b", 2), ("c", 1)]);
        a.merge(&b);
        assert_eq!(a.get("a"), 3);
        assert_eq!(a.get("b"), 2);
        assert_eq!(a.get("c"), 1);
    }

    #[test]
    fn merge_of_conflict_dominates_both() {
        let a = clock(&[("a", 2), ("b", 1)]);
        let b = clock(&[("a", 1), ("b", 3)]);
        assert_eq!(a.compare(&b), Causality::Conflict);

        let mut merged = a.clone();
        merged.merge(&b);
        assert_eq!(merged.compare(&a), Causality::Greater);
        assert_eq!(merged.compare(&b), Causality::Greater);
    }

    #[test]
    fn wire_alignment_round_trips() {
        let uuids: Vec<String> = ["t1", "t2", "t3"].iter().map(|s| s.to_string()).collect();
        let v = clock(&[("t1", 4), ("t3", 2)]);
        let aligned = v.to_aligned(&uuids);
        assert_eq!(aligned, vec![4, 0, 2]);
        assert_eq!(VClock::from_aligned(&uuids, &aligned), v);
    }
}
