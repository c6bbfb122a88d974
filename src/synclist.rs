//! The per-tree whitelist of paths the user wants synced.
//!
//! Entries form a prefix tree over path components: an entry `/a`
//! implicitly covers `/a/b`, and adding `/a` while `/a/b` exists collapses
//! the pair down to `/a`. Push and pull candidates must resolve to
//! [`Coverage::Exact`] or [`Coverage::Covered`] on the receiving side.

use std::collections::BTreeMap;

/// Where a queried path falls relative to the whitelist.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Coverage {
    /// The path is an entry itself.
    Exact,
    /// The path is below some entry.
    Covered,
    /// The path is above one or more entries (an ancestor directory).
    Ancestor,
    /// The path shares nothing with any entry.
    Unrelated,
}

impl Coverage {
    /// Should a row at this path move between trees?
    pub fn syncable(self) -> bool {
        matches!(self, Coverage::Exact | Coverage::Covered)
    }

    /// Should a tree walk descend into this directory?
    pub fn walkable(self) -> bool {
        self != Coverage::Unrelated
    }
}

#[derive(Debug, Default)]
struct Node {
    children: BTreeMap<String, Node>,
    /// A terminal node is a whitelist entry; everything below it is covered
    /// and the trie stores nothing further down.
    terminal: bool,
}

/// The whitelist itself. An empty list covers nothing.
#[derive(Debug, Default)]
pub struct SyncList {
    root: Node,
    /// `/` itself was added - everything is covered.
    whole_tree: bool,
}

fn components(rel: &str) -> impl Iterator<Item = &str> {
    rel.split('/').filter(|c| !c.is_empty())
}

impl SyncList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored entries.
    pub fn from_entries<S: AsRef<str>>(entries: impl IntoIterator<Item = S>) -> Self {
        let mut list = Self::new();
        for e in entries {
            list.add(e.as_ref());
        }
        list
    }

    /// Add an entry. Returns false if the path was already covered.
    /// Descendant entries collapse into the new one.
    pub fn add(&mut self, rel: &str) -> bool {
        if self.whole_tree {
            return false;
        }
        if rel == "/" {
            self.whole_tree = true;
            self.root = Node::default();
            return true;
        }
        let mut node = &mut self.root;
        for part in components(rel) {
            if node.terminal {
                return false;
            }
            node = node.children.entry(part.to_owned()).or_default();
        }
        if node.terminal {
            return false;
        }
        node.terminal = true;
        node.children.clear();
        true
    }

    /// Remove an exact entry. Returns false if `rel` isn't one.
    pub fn del(&mut self, rel: &str) -> bool {
        if rel == "/" {
            let was = self.whole_tree;
            self.whole_tree = false;
            return was;
        }
        fn recurse(node: &mut Node, mut parts: impl Iterator<Item = String>) -> (bool, bool) {
            match parts.next() {
                None => {
                    let was = node.terminal;
                    node.terminal = false;
                    (was, !node.terminal && node.children.is_empty())
                }
                Some(part) => {
                    let Some(child) = node.children.get_mut(&part) else {
                        return (false, false);
                    };
                    let (removed, prune) = recurse(child, parts);
                    if prune {
                        node.children.remove(&part);
                    }
                    (removed, removed && !node.terminal && node.children.is_empty())
                }
            }
        }
        let parts: Vec<String> = components(rel).map(str::to_owned).collect();
        recurse(&mut self.root, parts.into_iter()).0
    }

    pub fn find(&self, rel: &str) -> Coverage {
        if self.whole_tree {
            return if rel == "/" {
                Coverage::Exact
            } else {
                Coverage::Covered
            };
        }
        if rel == "/" {
            return if self.root.children.is_empty() {
                Coverage::Unrelated
            } else {
                Coverage::Ancestor
            };
        }
        let mut node = &self.root;
        for part in components(rel) {
            if node.terminal {
                return Coverage::Covered;
            }
            match node.children.get(part) {
                Some(child) => node = child,
                None => return Coverage::Unrelated,
            }
        }
        if node.terminal {
            Coverage::Exact
        } else {
            Coverage::Ancestor
        }
    }

    /// The stored (trie-compressed) entries, in path order.
    pub fn entries(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.whole_tree {
            out.push("/".to_owned());
            return out;
        }
        fn walk(node: &Node, prefix: &str, out: &mut Vec<String>) {
            if node.terminal {
                out.push(prefix.to_owned());
                return;
            }
            for (part, child) in &node.children {
                walk(child, &format!("{prefix}/{part}"), out);
            }
        }
        walk(&self.root, "", &mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        !self.whole_tree && self.root.children.is_empty()
    }
}
