//! Remembered synced-tree snapshot
//!
//! The tree lives in an arena; nodes refer to each other through
//! [`NodeId`] handles, so there are no raw backreferences and detach or
//! purge never leaves a dangling parent pointer. Children are kept in a
//! `BTreeMap` for deterministic iteration order.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::error;

use crate::fingerprint::Fingerprint;
use crate::fsaccess::{EntryKind, Fsid};
use crate::remote::{RemoteHandle, TransferId};

/// Arena handle for a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

/// How much of a subtree still needs attention.
///
/// Ordered so that widening is a `max`: `HereAndBelow` subsumes
/// `HereOnly`, which subsumes `Resolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AgainScope {
    Resolved,
    HereOnly,
    HereAndBelow,
}

impl AgainScope {
    /// Widen this scope to cover at least `other`
    pub fn widen(&mut self, other: AgainScope) {
        *self = (*self).max(other);
    }

    #[must_use]
    pub fn pending(self) -> bool {
        self != AgainScope::Resolved
    }
}

/// One remembered entry of the synchronized tree
#[derive(Debug)]
pub struct SyncedEntry {
    pub kind: EntryKind,
    /// Leaf name, also the key in the parent's children map
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: BTreeMap<String, NodeId>,
    /// Remote counterpart, once bound
    pub remote: Option<RemoteHandle>,
    /// Filesystem identity, unique per session (see [`FsidRegistry`])
    pub fsid: Option<Fsid>,
    /// Last synced content fingerprint (files only)
    pub fingerprint: Option<Fingerprint>,
    pub size: i64,
    pub mtime: i64,
    /// Scan generation in which this entry was last seen on disk
    pub seen_generation: u64,
    /// Scan generation in which this folder itself was last scanned
    pub scanned_generation: u64,
    /// In-flight transfer, if any
    pub transfer: Option<TransferId>,
    /// Row id in the state cache; `None` until first flushed
    pub dbid: Option<u64>,
    /// Filesystem short-name hint, persisted alongside the entry
    pub shortname: Option<String>,
    pub scan_again: AgainScope,
    pub sync_again: AgainScope,
    /// Clock tick of the last completed scan of this folder
    pub last_scan_ds: Option<u64>,
}

impl SyncedEntry {
    #[must_use]
    pub fn new(kind: EntryKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            parent: None,
            children: BTreeMap::new(),
            remote: None,
            fsid: None,
            fingerprint: None,
            size: 0,
            mtime: 0,
            seen_generation: 0,
            scanned_generation: 0,
            transfer: None,
            dbid: None,
            shortname: None,
            scan_again: AgainScope::Resolved,
            sync_again: AgainScope::Resolved,
            last_scan_ds: None,
        }
    }
}

/// Arena of [`SyncedEntry`] nodes rooted at a synthetic folder entry
#[derive(Debug)]
pub struct SyncedTree {
    slots: Vec<Option<SyncedEntry>>,
    free: Vec<NodeId>,
    root: NodeId,
}

impl SyncedTree {
    /// Create a tree holding only the (nameless) root folder
    #[must_use]
    pub fn new() -> Self {
        let root_entry = SyncedEntry::new(EntryKind::Folder, "");
        Self {
            slots: vec![Some(root_entry)],
            free: Vec::new(),
            root: NodeId(0),
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&SyncedEntry> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut SyncedEntry> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// Insert `entry` as a child of `parent` under its own name.
    ///
    /// Returns `None` when the parent is gone or already has a child of
    /// that name.
    pub fn insert(&mut self, parent: NodeId, entry: SyncedEntry) -> Option<NodeId> {
        let name = entry.name.clone();
        let parent_entry = self.get(parent)?;
        if parent_entry.children.contains_key(&name) {
            return None;
        }

        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id.0 as usize] = Some(entry);
                id
            }
            None => {
                let id = NodeId(self.slots.len() as u32);
                self.slots.push(Some(entry));
                id
            }
        };
        if let Some(e) = self.get_mut(id) {
            e.parent = Some(parent);
        }
        if let Some(p) = self.get_mut(parent) {
            p.children.insert(name, id);
        }
        Some(id)
    }

    /// Child of `parent` with the exact name, if any
    #[must_use]
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.get(parent)?.children.get(name).copied()
    }

    /// Detach a node from its parent, leaving it parentless
    pub fn detach(&mut self, id: NodeId) {
        let Some((parent, name)) = self
            .get(id)
            .and_then(|e| e.parent.map(|p| (p, e.name.clone())))
        else {
            return;
        };
        if let Some(p) = self.get_mut(parent) {
            p.children.remove(&name);
        }
        if let Some(e) = self.get_mut(id) {
            e.parent = None;
        }
    }

    /// Reattach a detached node under a new parent with a new name.
    ///
    /// Fails (returning false) if the target name is taken or the node
    /// still has a parent.
    pub fn attach(&mut self, id: NodeId, parent: NodeId, name: &str) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        if entry.parent.is_some() {
            error!("attach of node that still has a parent");
            debug_assert!(false, "attach requires a detached node");
            return false;
        }
        let Some(parent_entry) = self.get(parent) else {
            return false;
        };
        if parent_entry.children.contains_key(name) {
            return false;
        }
        if let Some(e) = self.get_mut(id) {
            e.name = name.to_owned();
            e.parent = Some(parent);
        }
        if let Some(p) = self.get_mut(parent) {
            p.children.insert(name.to_owned(), id);
        }
        true
    }

    /// Collect a subtree bottom-up (children strictly before parents)
    #[must_use]
    pub fn collect_subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_subtree_into(id, &mut out);
        out
    }

    fn collect_subtree_into(&self, id: NodeId, out: &mut Vec<NodeId>) {
        if let Some(entry) = self.get(id) {
            for child in entry.children.values() {
                self.collect_subtree_into(*child, out);
            }
            out.push(id);
        }
    }

    /// Remove a node and its descendants from the arena.
    ///
    /// The root cannot be removed. Returns the removed entries
    /// children-first so the caller can unwind registries and cache rows.
    pub fn remove_subtree(&mut self, id: NodeId) -> Vec<(NodeId, SyncedEntry)> {
        if id == self.root {
            error!("attempted to remove the tree root");
            debug_assert!(false, "root is not removable");
            return Vec::new();
        }
        self.detach(id);
        let order = self.collect_subtree(id);
        let mut removed = Vec::with_capacity(order.len());
        for node in order {
            if let Some(entry) = self.slots[node.0 as usize].take() {
                self.free.push(node);
                removed.push((node, entry));
            }
        }
        removed
    }

    /// Absolute path of a node below `root_path`
    #[must_use]
    pub fn path_of(&self, id: NodeId, root_path: &Path) -> PathBuf {
        let mut segments = Vec::new();
        let mut cursor = Some(id);
        while let Some(node) = cursor {
            if node == self.root {
                break;
            }
            match self.get(node) {
                Some(entry) => {
                    segments.push(entry.name.clone());
                    cursor = entry.parent;
                }
                None => break,
            }
        }
        let mut path = root_path.to_path_buf();
        for segment in segments.iter().rev() {
            path.push(segment);
        }
        path
    }

    /// Number of live nodes, root included
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether the tree holds nothing besides the root
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    /// All live node ids, root included, parents before children
    #[must_use]
    pub fn all_nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Some(entry) = self.get(id) {
                out.push(id);
                stack.extend(entry.children.values().copied());
            }
        }
        out
    }
}

impl Default for SyncedTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Reverse fsid index enforcing per-volume uniqueness.
///
/// The root never carries an fsid, and an fsid maps to at most one node.
#[derive(Debug, Default)]
pub struct FsidRegistry {
    by_fsid: HashMap<Fsid, NodeId>,
}

impl FsidRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `fsid` to `node`, updating the entry's fsid field.
    ///
    /// Rejects the root and any fsid already bound to a different node.
    pub fn bind(&mut self, tree: &mut SyncedTree, node: NodeId, fsid: Fsid) -> bool {
        if node == tree.root() {
            error!(fsid, "refusing to bind an fsid to the root");
            return false;
        }
        match self.by_fsid.get(&fsid) {
            Some(existing) if *existing != node => {
                error!(fsid, "fsid already bound to another node");
                return false;
            }
            _ => {}
        }
        let Some(entry) = tree.get_mut(node) else {
            return false;
        };
        if let Some(old) = entry.fsid.replace(fsid) {
            if old != fsid {
                self.by_fsid.remove(&old);
            }
        }
        self.by_fsid.insert(fsid, node);
        true
    }

    /// Drop the binding for a node being purged or re-identified
    pub fn unbind(&mut self, tree: &mut SyncedTree, node: NodeId) {
        if let Some(entry) = tree.get_mut(node) {
            if let Some(fsid) = entry.fsid.take() {
                self.by_fsid.remove(&fsid);
            }
        }
    }

    /// Forget a binding for an already-removed entry
    pub fn forget(&mut self, fsid: Fsid) {
        self.by_fsid.remove(&fsid);
    }

    #[must_use]
    pub fn lookup(&self, fsid: Fsid) -> Option<NodeId> {
        self.by_fsid.get(&fsid).copied()
    }

    pub fn clear(&mut self) {
        self.by_fsid.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(name: &str) -> SyncedEntry {
        SyncedEntry::new(EntryKind::Folder, name)
    }

    fn file(name: &str) -> SyncedEntry {
        SyncedEntry::new(EntryKind::File, name)
    }

    #[test]
    fn test_insert_and_path() {
        let mut tree = SyncedTree::new();
        let docs = tree.insert(tree.root(), folder("docs")).unwrap();
        let a = tree.insert(docs, file("a.txt")).unwrap();

        assert_eq!(tree.child(tree.root(), "docs"), Some(docs));
        assert_eq!(
            tree.path_of(a, Path::new("/sync")),
            PathBuf::from("/sync/docs/a.txt")
        );
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_insert_duplicate_name_fails() {
        let mut tree = SyncedTree::new();
        tree.insert(tree.root(), file("a.txt")).unwrap();
        assert!(tree.insert(tree.root(), file("a.txt")).is_none());
    }

    #[test]
    fn test_detach_attach_moves_node() {
        let mut tree = SyncedTree::new();
        let docs = tree.insert(tree.root(), folder("docs")).unwrap();
        let pics = tree.insert(tree.root(), folder("pics")).unwrap();
        let a = tree.insert(docs, file("a.txt")).unwrap();

        tree.detach(a);
        assert!(tree.child(docs, "a.txt").is_none());
        assert!(tree.attach(a, pics, "b.txt"));

        assert_eq!(tree.child(pics, "b.txt"), Some(a));
        assert_eq!(tree.get(a).unwrap().parent, Some(pics));
        assert_eq!(tree.get(a).unwrap().name, "b.txt");
    }

    #[test]
    fn test_remove_subtree_children_first() {
        let mut tree = SyncedTree::new();
        let docs = tree.insert(tree.root(), folder("docs")).unwrap();
        let sub = tree.insert(docs, folder("sub")).unwrap();
        let a = tree.insert(sub, file("a.txt")).unwrap();

        assert!(!tree.is_empty());
        let removed = tree.remove_subtree(docs);
        let order: Vec<_> = removed.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![a, sub, docs]);
        assert_eq!(tree.len(), 1);
        assert!(tree.is_empty());
        assert!(tree.get(docs).is_none());

        // freed slots are reused
        let again = tree.insert(tree.root(), folder("docs")).unwrap();
        assert!(tree.get(again).is_some());
    }

    #[test]
    fn test_registry_rejects_duplicates_and_root() {
        let mut tree = SyncedTree::new();
        let mut registry = FsidRegistry::new();
        let a = tree.insert(tree.root(), file("a.txt")).unwrap();
        let b = tree.insert(tree.root(), file("b.txt")).unwrap();

        assert!(registry.bind(&mut tree, a, 42));
        assert!(!registry.bind(&mut tree, b, 42));
        assert_eq!(registry.lookup(42), Some(a));

        // rebinding the same node to a new fsid releases the old one
        assert!(registry.bind(&mut tree, a, 43));
        assert_eq!(registry.lookup(42), None);
        assert_eq!(registry.lookup(43), Some(a));

        registry.unbind(&mut tree, a);
        assert_eq!(registry.lookup(43), None);
        assert!(tree.get(a).unwrap().fsid.is_none());
    }

    #[test]
    fn test_registry_never_binds_root() {
        let mut tree = SyncedTree::new();
        let mut registry = FsidRegistry::new();
        let root = tree.root();
        assert!(!registry.bind(&mut tree, root, 1));
    }
}
