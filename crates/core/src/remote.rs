//! Remote-storage collaborator interface
//!
//! The engine never talks to the cloud directly; the embedder supplies a
//! [`RemoteStore`] that exposes the remote tree and the transfer queue.
//! [`MemoryRemote`] is a self-contained implementation for tests and
//! embedding experiments.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use color_eyre::eyre::eyre;
use color_eyre::Result;

use crate::fsaccess::EntryKind;

/// Opaque identifier of a remote node
pub type RemoteHandle = u64;

/// Opaque identifier of a queued transfer
pub type TransferId = u64;

/// Snapshot of one remote node, as reported by the store
#[derive(Debug, Clone)]
pub struct RemoteNodeInfo {
    pub handle: RemoteHandle,
    /// Canonical name; `None` when the name attribute is unavailable
    pub name: Option<String>,
    pub kind: EntryKind,
    /// Size in bytes (0 for folders)
    pub size: i64,
    /// Modification time, seconds since UNIX epoch
    pub mtime: i64,
    /// Whether the node's attributes decrypted successfully
    pub decrypted: bool,
    /// Whether the node sits in the remote trash
    pub trash: bool,
}

impl RemoteNodeInfo {
    /// Whether this node participates in synchronization. Undecrypted
    /// and trashed nodes, and nodes without a usable name, are skipped.
    #[must_use]
    pub fn syncable(&self) -> bool {
        self.decrypted && !self.trash && self.name.is_some()
    }
}

/// Remote tree plus transfer queue, as seen by the sync core
pub trait RemoteStore {
    /// Look up one node by handle
    fn node(&self, handle: RemoteHandle) -> Option<RemoteNodeInfo>;

    /// Immediate children of a folder node
    fn children(&self, handle: RemoteHandle) -> Vec<RemoteNodeInfo>;

    /// Whether unapplied server-side changes are pending for this
    /// subtree; reconciliation of the subtree is deferred while true
    fn has_pending_changes(&self, handle: RemoteHandle) -> bool;

    /// Whether a previously started transfer is still running
    fn transfer_active(&self, transfer: TransferId) -> bool;

    /// Queue an upload of a local file into `parent` under `name`
    fn start_upload(
        &mut self,
        parent: RemoteHandle,
        name: &str,
        local_path: &Path,
    ) -> Result<TransferId>;

    /// Queue a download of a remote file to `local_path`
    fn start_download(&mut self, handle: RemoteHandle, local_path: &Path) -> Result<TransferId>;

    /// Create a remote folder, returning its handle
    fn create_folder(&mut self, parent: RemoteHandle, name: &str) -> Result<RemoteHandle>;

    /// Move and/or rename a node
    fn move_node(
        &mut self,
        handle: RemoteHandle,
        new_parent: RemoteHandle,
        new_name: &str,
    ) -> Result<()>;

    /// Remove a node (and its descendants)
    fn remove_node(&mut self, handle: RemoteHandle) -> Result<()>;

    /// Cancel a queued or running transfer
    fn cancel_transfer(&mut self, transfer: TransferId);
}

/// Recorded upload request (inspection hook on [`MemoryRemote`])
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub parent: RemoteHandle,
    pub name: String,
    pub local_path: PathBuf,
}

/// Recorded download request (inspection hook on [`MemoryRemote`])
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub handle: RemoteHandle,
    pub local_path: PathBuf,
}

#[derive(Debug)]
struct MemoryNode {
    info: RemoteNodeInfo,
    parent: Option<RemoteHandle>,
    children: BTreeMap<String, RemoteHandle>,
}

/// In-memory remote store.
///
/// Tracks a real tree, records every transfer request, and lets the
/// caller mark transfers finished and subtrees dirty.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    nodes: HashMap<RemoteHandle, MemoryNode>,
    root: RemoteHandle,
    next_handle: RemoteHandle,
    next_transfer: TransferId,
    active_transfers: HashSet<TransferId>,
    pending: HashSet<RemoteHandle>,
    pub uploads: Vec<UploadRequest>,
    pub downloads: Vec<DownloadRequest>,
    pub cancelled: Vec<TransferId>,
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        let mut remote = Self {
            next_handle: 1,
            next_transfer: 1,
            ..Self::default()
        };
        remote.root = remote.insert_node(None, "", EntryKind::Folder, 0, 0);
        remote
    }

    #[must_use]
    pub fn root(&self) -> RemoteHandle {
        self.root
    }

    /// Add a folder under `parent`, for test setup
    pub fn add_folder(&mut self, parent: RemoteHandle, name: &str) -> RemoteHandle {
        self.insert_node(Some(parent), name, EntryKind::Folder, 0, 0)
    }

    /// Add a file under `parent`, for test setup
    pub fn add_file(
        &mut self,
        parent: RemoteHandle,
        name: &str,
        size: i64,
        mtime: i64,
    ) -> RemoteHandle {
        self.insert_node(Some(parent), name, EntryKind::File, size, mtime)
    }

    /// Mark a transfer as finished
    pub fn finish_transfer(&mut self, transfer: TransferId) {
        self.active_transfers.remove(&transfer);
    }

    /// Toggle the pending-changes indicator for a subtree root
    pub fn set_pending_changes(&mut self, handle: RemoteHandle, pending: bool) {
        if pending {
            self.pending.insert(handle);
        } else {
            self.pending.remove(&handle);
        }
    }

    fn insert_node(
        &mut self,
        parent: Option<RemoteHandle>,
        name: &str,
        kind: EntryKind,
        size: i64,
        mtime: i64,
    ) -> RemoteHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.nodes.insert(
            handle,
            MemoryNode {
                info: RemoteNodeInfo {
                    handle,
                    name: Some(name.to_owned()),
                    kind,
                    size,
                    mtime,
                    decrypted: true,
                    trash: false,
                },
                parent,
                children: BTreeMap::new(),
            },
        );
        if let Some(p) = parent {
            if let Some(parent_node) = self.nodes.get_mut(&p) {
                parent_node.children.insert(name.to_owned(), handle);
            }
        }
        handle
    }

    fn next_transfer_id(&mut self) -> TransferId {
        let id = self.next_transfer;
        self.next_transfer += 1;
        self.active_transfers.insert(id);
        id
    }
}

impl RemoteStore for MemoryRemote {
    fn node(&self, handle: RemoteHandle) -> Option<RemoteNodeInfo> {
        self.nodes.get(&handle).map(|n| n.info.clone())
    }

    fn children(&self, handle: RemoteHandle) -> Vec<RemoteNodeInfo> {
        let Some(node) = self.nodes.get(&handle) else {
            return Vec::new();
        };
        node.children
            .values()
            .filter_map(|h| self.nodes.get(h))
            .map(|n| n.info.clone())
            .collect()
    }

    fn has_pending_changes(&self, handle: RemoteHandle) -> bool {
        self.pending.contains(&handle)
    }

    fn transfer_active(&self, transfer: TransferId) -> bool {
        self.active_transfers.contains(&transfer)
    }

    fn start_upload(
        &mut self,
        parent: RemoteHandle,
        name: &str,
        local_path: &Path,
    ) -> Result<TransferId> {
        if !self.nodes.contains_key(&parent) {
            return Err(eyre!("upload parent {parent} does not exist"));
        }
        self.uploads.push(UploadRequest {
            parent,
            name: name.to_owned(),
            local_path: local_path.to_owned(),
        });
        Ok(self.next_transfer_id())
    }

    fn start_download(&mut self, handle: RemoteHandle, local_path: &Path) -> Result<TransferId> {
        if !self.nodes.contains_key(&handle) {
            return Err(eyre!("download source {handle} does not exist"));
        }
        self.downloads.push(DownloadRequest {
            handle,
            local_path: local_path.to_owned(),
        });
        Ok(self.next_transfer_id())
    }

    fn create_folder(&mut self, parent: RemoteHandle, name: &str) -> Result<RemoteHandle> {
        if !self.nodes.contains_key(&parent) {
            return Err(eyre!("folder parent {parent} does not exist"));
        }
        Ok(self.insert_node(Some(parent), name, EntryKind::Folder, 0, 0))
    }

    fn move_node(
        &mut self,
        handle: RemoteHandle,
        new_parent: RemoteHandle,
        new_name: &str,
    ) -> Result<()> {
        let old = {
            let node = self
                .nodes
                .get(&handle)
                .ok_or_else(|| eyre!("moved node {handle} does not exist"))?;
            (node.parent, node.info.name.clone())
        };
        if let (Some(p), Some(name)) = old {
            if let Some(parent_node) = self.nodes.get_mut(&p) {
                parent_node.children.remove(&name);
            }
        }
        let target = self
            .nodes
            .get_mut(&new_parent)
            .ok_or_else(|| eyre!("move target {new_parent} does not exist"))?;
        target.children.insert(new_name.to_owned(), handle);
        if let Some(node) = self.nodes.get_mut(&handle) {
            node.parent = Some(new_parent);
            node.info.name = Some(new_name.to_owned());
        }
        Ok(())
    }

    fn remove_node(&mut self, handle: RemoteHandle) -> Result<()> {
        let node = self
            .nodes
            .remove(&handle)
            .ok_or_else(|| eyre!("removed node {handle} does not exist"))?;
        if let (Some(p), Some(name)) = (node.parent, node.info.name.as_ref()) {
            if let Some(parent_node) = self.nodes.get_mut(&p) {
                parent_node.children.remove(name);
            }
        }
        for child in node.children.into_values() {
            let _ = self.remove_node(child);
        }
        Ok(())
    }

    fn cancel_transfer(&mut self, transfer: TransferId) {
        self.active_transfers.remove(&transfer);
        self.cancelled.push(transfer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syncable_filters() {
        let mut info = RemoteNodeInfo {
            handle: 7,
            name: Some("a".into()),
            kind: EntryKind::File,
            size: 1,
            mtime: 2,
            decrypted: true,
            trash: false,
        };
        assert!(info.syncable());

        info.trash = true;
        assert!(!info.syncable());

        info.trash = false;
        info.decrypted = false;
        assert!(!info.syncable());

        info.decrypted = true;
        info.name = None;
        assert!(!info.syncable());
    }

    #[test]
    fn test_memory_remote_tree_ops() {
        let mut remote = MemoryRemote::new();
        let docs = remote.add_folder(remote.root(), "docs");
        let file = remote.add_file(docs, "a.txt", 5, 100);

        let names: Vec<_> = remote
            .children(remote.root())
            .into_iter()
            .filter_map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["docs"]);

        remote.move_node(file, remote.root(), "b.txt").unwrap();
        assert!(remote.children(docs).is_empty());
        assert_eq!(remote.node(file).unwrap().name.as_deref(), Some("b.txt"));

        remote.remove_node(docs).unwrap();
        assert!(remote.node(docs).is_none());
        assert!(remote.node(file).is_some());
    }

    #[test]
    fn test_transfer_lifecycle() {
        let mut remote = MemoryRemote::new();
        let root = remote.root();
        let t = remote
            .start_upload(root, "a.txt", Path::new("/tmp/a.txt"))
            .unwrap();
        assert!(remote.transfer_active(t));

        remote.finish_transfer(t);
        assert!(!remote.transfer_active(t));

        let t2 = remote.start_download(root, Path::new("/tmp/b")).unwrap();
        remote.cancel_transfer(t2);
        assert!(!remote.transfer_active(t2));
        assert_eq!(remote.cancelled, vec![t2]);
    }
}
