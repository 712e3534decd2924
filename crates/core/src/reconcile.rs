//! Recursive three-way reconciliation
//!
//! Each directory level aligns three views: the remote children, the
//! remembered synced entries, and the local filesystem (a fresh scan
//! when one is due, otherwise descriptors rebuilt from the remembered
//! entries). Rows of the resulting table are resolved one at a time by
//! [`Reconciler::sync_item`]; folders present on all sides are
//! descended into depth-first.
//!
//! Work is tracked per folder with scan/sync "again" scopes that are
//! widened by change notifications and narrowed as levels resolve, so a
//! steady-state tree costs one flag check per tick.

use std::collections::HashMap;
use std::path::Path;

use color_eyre::Result;
use tracing::{debug, error, warn};

use crate::cache::{StateTable, SyncedTreeCache};
use crate::clock::Clock;
use crate::debris::DebrisArchiver;
use crate::fsaccess::{EntryKind, FsAccess, FsError};
use crate::remote::{RemoteHandle, RemoteNodeInfo, RemoteStore};
use crate::scan::{DirectoryScanner, ScannedItem};
use crate::tree::{AgainScope, FsidRegistry, NodeId, SyncedEntry, SyncedTree};

/// Minimum spacing between scans of the same folder, in deciseconds
pub const SCAN_INTERVAL_DS: u64 = 20;

/// How the local filesystem compares names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameComparison {
    CaseSensitive,
    CaseInsensitive,
}

impl NameComparison {
    /// Fold a name into its comparison key
    #[must_use]
    pub fn key(self, name: &str) -> String {
        match self {
            Self::CaseSensitive => name.to_owned(),
            Self::CaseInsensitive => name.to_lowercase(),
        }
    }
}

/// One aligned (remote, synced, scanned) triple
#[derive(Debug, Default)]
pub struct ReconcileRow {
    pub synced: Option<NodeId>,
    pub scanned: Option<ScannedItem>,
    pub remote: Option<RemoteNodeInfo>,
    /// Duplicate names collided while pairing; the row is skipped and
    /// retried once the user resolves the clash
    pub conflict: bool,
}

/// Borrowed collaborators for one reconciliation pass
pub struct Reconciler<'a, T: StateTable> {
    pub tree: &'a mut SyncedTree,
    pub registry: &'a mut FsidRegistry,
    pub cache: &'a mut SyncedTreeCache<T>,
    pub remote: &'a mut dyn RemoteStore,
    pub fs: &'a dyn FsAccess,
    pub clock: &'a dyn Clock,
    pub root_path: &'a Path,
    pub debris: &'a Path,
    pub name_cmp: NameComparison,
    /// Current scan generation, stamped onto every entry seen on disk
    pub generation: u64,
}

impl<'a, T: StateTable> Reconciler<'a, T> {
    /// Reconcile the folder `dir` and, depth-first, any pending
    /// descendants.
    ///
    /// Only the disk scan itself is rate-limited; a level whose scan is
    /// not due (or only has sync work flagged) is reconciled from its
    /// last known child descriptors, so remote-side work never waits on
    /// the scan interval.
    ///
    /// Returns false when the level could not be completed and must be
    /// revisited; its `sync_again` scope is re-widened in that case and
    /// remaining siblings at the failed level are skipped.
    pub fn reconcile(&mut self, dir: NodeId) -> Result<bool> {
        let Some(entry) = self.tree.get(dir) else {
            return Ok(true);
        };
        let scan_scope = entry.scan_again;
        let sync_scope = entry.sync_again;
        let dir_remote = entry.remote;
        let last_scan = entry.last_scan_ds;

        if !scan_scope.pending() && !sync_scope.pending() {
            return Ok(true);
        }

        // server-side changes still settling; come back later
        if let Some(rh) = dir_remote {
            if self.remote.has_pending_changes(rh) {
                debug!(?dir, "remote changes pending, deferring");
                return Ok(true);
            }
        }

        let dir_path = self.tree.path_of(dir, self.root_path);
        let now = self.clock.now_ds();
        let scan_due = scan_scope.pending()
            && last_scan.map_or(true, |last| now.saturating_sub(last) >= SCAN_INTERVAL_DS);

        let mut fresh = false;
        let mut retry = false;
        let mut items = if scan_due {
            let scanner = DirectoryScanner::new(self.fs, self.debris);
            match scanner.scan_one(&dir_path) {
                Ok(outcome) => {
                    fresh = true;
                    retry = outcome.retry;
                    outcome.items
                }
                Err(e) => {
                    if e.downcast_ref::<FsError>().is_some_and(FsError::is_transient) {
                        warn!(path = %dir_path.display(), "folder busy, scan deferred");
                        if let Some(entry) = self.tree.get_mut(dir) {
                            entry.last_scan_ds = Some(now);
                        }
                        self.remembered_items(dir)
                    } else {
                        warn!(path = %dir_path.display(), error = %e, "folder scan failed");
                        return Ok(false);
                    }
                }
            }
        } else {
            self.remembered_items(dir)
        };
        // siblings are processed in name order, never in the order the
        // directory listing happened to return them
        items.sort_by_cached_key(|item| self.name_cmp.key(&item.name));

        let descend_scan = fresh && scan_scope == AgainScope::HereAndBelow;
        let descend_sync = sync_scope == AgainScope::HereAndBelow;
        let children: Vec<NodeId> = {
            let Some(entry) = self.tree.get_mut(dir) else {
                return Ok(true);
            };
            if fresh {
                entry.last_scan_ds = Some(now);
                entry.scanned_generation = self.generation;
                entry.scan_again = if retry {
                    AgainScope::HereOnly
                } else {
                    AgainScope::Resolved
                };
            }
            entry.sync_again = AgainScope::Resolved;
            entry.children.values().copied().collect()
        };
        for child in children {
            if let Some(child_entry) = self.tree.get_mut(child) {
                if descend_scan {
                    child_entry.scan_again.widen(AgainScope::HereAndBelow);
                }
                if descend_sync {
                    child_entry.sync_again.widen(AgainScope::HereAndBelow);
                }
            }
        }

        let rows = self.build_rows(dir, dir_remote, items);
        for row in rows {
            if row.conflict {
                warn!(path = %dir_path.display(), "name clash at this level, row skipped");
                self.mark_sync_again(dir);
                continue;
            }
            if let Err(e) = self.sync_item(dir, &dir_path, dir_remote, row, fresh) {
                warn!(path = %dir_path.display(), error = %e, "row failed, level queued again");
                self.mark_sync_again(dir);
            }
        }

        // depth-first into folder children; a failed child aborts the
        // remaining siblings and re-queues this level
        let children: Vec<NodeId> = self
            .tree
            .get(dir)
            .map(|e| e.children.values().copied().collect())
            .unwrap_or_default();
        for child in children {
            let is_folder = self
                .tree
                .get(child)
                .is_some_and(|e| e.kind == EntryKind::Folder);
            if !is_folder {
                continue;
            }
            if !self.reconcile(child)? {
                self.mark_sync_again(dir);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn mark_sync_again(&mut self, dir: NodeId) {
        if let Some(entry) = self.tree.get_mut(dir) {
            entry.sync_again.widen(AgainScope::HereOnly);
        }
    }

    fn mark_scan_again(&mut self, dir: NodeId) {
        if let Some(entry) = self.tree.get_mut(dir) {
            entry.scan_again.widen(AgainScope::HereOnly);
        }
    }

    /// Child descriptors rebuilt from the remembered entries, standing
    /// in for a scan that is not due
    fn remembered_items(&self, dir: NodeId) -> Vec<ScannedItem> {
        let Some(entry) = self.tree.get(dir) else {
            return Vec::new();
        };
        entry
            .children
            .values()
            .filter_map(|&child| self.tree.get(child))
            .map(|e| ScannedItem {
                name: e.name.clone(),
                kind: e.kind,
                fsid: e.fsid,
                fingerprint: e.fingerprint,
                size: e.size,
                mtime: e.mtime,
                is_symlink: false,
            })
            .collect()
    }

    /// Align the three child lists into rows.
    ///
    /// Pass 1 pairs remembered entries with scanned items under the
    /// filesystem's name comparison; duplicate scanned names folding to
    /// the same key flag the row as a conflict. Pass 2 pairs rows with
    /// remote children by canonical name, always case-sensitive.
    fn build_rows(
        &self,
        dir: NodeId,
        dir_remote: Option<RemoteHandle>,
        items: Vec<ScannedItem>,
    ) -> Vec<ReconcileRow> {
        let mut rows: Vec<ReconcileRow> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();

        if let Some(entry) = self.tree.get(dir) {
            for (name, child) in &entry.children {
                let key = self.name_cmp.key(name);
                let row = ReconcileRow {
                    synced: Some(*child),
                    ..ReconcileRow::default()
                };
                if let Some(&i) = by_key.get(&key) {
                    // two remembered names folding together
                    rows[i].conflict = true;
                    rows.push(ReconcileRow {
                        conflict: true,
                        ..row
                    });
                } else {
                    by_key.insert(key, rows.len());
                    rows.push(row);
                }
            }
        }

        for item in items {
            if item.is_symlink {
                debug!(name = %item.name, "symlink excluded from sync");
                continue;
            }
            let key = self.name_cmp.key(&item.name);
            match by_key.get(&key) {
                Some(&i) => {
                    if rows[i].scanned.is_some() {
                        rows[i].conflict = true;
                    } else {
                        rows[i].scanned = Some(item);
                    }
                }
                None => {
                    by_key.insert(key, rows.len());
                    rows.push(ReconcileRow {
                        scanned: Some(item),
                        ..ReconcileRow::default()
                    });
                }
            }
        }

        let mut by_name: HashMap<String, usize> = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            let name = row
                .synced
                .and_then(|n| self.tree.get(n).map(|e| e.name.clone()))
                .or_else(|| row.scanned.as_ref().map(|s| s.name.clone()));
            if let Some(name) = name {
                by_name.entry(name).or_insert(i);
            }
        }
        if let Some(rh) = dir_remote {
            for rnode in self.remote.children(rh) {
                if !rnode.syncable() {
                    debug!(handle = rnode.handle, "remote child not syncable, skipped");
                    continue;
                }
                let name = rnode.name.clone().unwrap_or_default();
                match by_name.get(&name) {
                    Some(&i) => {
                        if rows[i].remote.is_some() {
                            rows[i].conflict = true;
                        } else {
                            rows[i].remote = Some(rnode);
                        }
                    }
                    None => {
                        by_name.insert(name, rows.len());
                        rows.push(ReconcileRow {
                            remote: Some(rnode),
                            ..ReconcileRow::default()
                        });
                    }
                }
            }
        }
        rows
    }

    /// Resolve one aligned row. `fresh` is true when the scanned side
    /// came from a real disk scan rather than remembered descriptors.
    fn sync_item(
        &mut self,
        dir: NodeId,
        dir_path: &Path,
        dir_remote: Option<RemoteHandle>,
        row: ReconcileRow,
        fresh: bool,
    ) -> Result<()> {
        match (row.synced, row.scanned, row.remote) {
            (Some(node), Some(item), Some(rnode)) => {
                self.converge(dir, node, &item, &rnode, dir_remote, fresh)
            }
            (Some(node), Some(item), None) => {
                self.local_only_known(dir, node, &item, dir_remote, fresh)
            }
            (Some(node), None, Some(_rnode)) => {
                // local side vanished; no action until missing
                // detection confirms across generations, and a move of
                // the same fsid elsewhere rescues the entry first
                debug!(?node, "local file absent, awaiting confirmation");
                Ok(())
            }
            (Some(node), None, None) => {
                debug!(?node, "entry stale on both sides, discarding");
                self.purge(node);
                Ok(())
            }
            (None, Some(item), Some(rnode)) => self.bind_both(dir, &item, &rnode),
            (None, Some(item), None) => self.local_new(dir, dir_path, item, dir_remote),
            (None, None, Some(rnode)) => self.remote_new(dir, dir_path, &rnode),
            (None, None, None) => {
                error!("reconciliation row with no sides");
                debug_assert!(false, "empty reconciliation row");
                Ok(())
            }
        }
    }

    /// All three sides present: refresh identity and push or pull edits
    fn converge(
        &mut self,
        dir: NodeId,
        node: NodeId,
        item: &ScannedItem,
        rnode: &RemoteNodeInfo,
        dir_remote: Option<RemoteHandle>,
        fresh: bool,
    ) -> Result<()> {
        let (kind, synced_fp, synced_size, synced_mtime, transfer, had_remote, fsid_known, name) = {
            let Some(entry) = self.tree.get_mut(node) else {
                return Ok(());
            };
            if fresh {
                entry.seen_generation = self.generation;
            }
            (
                entry.kind,
                entry.fingerprint,
                entry.size,
                entry.mtime,
                entry.transfer,
                entry.remote.is_some(),
                entry.fsid,
                entry.name.clone(),
            )
        };

        if let Some(fsid) = item.fsid {
            if fsid_known != Some(fsid) {
                self.registry.unbind(self.tree, node);
                self.registry.bind(self.tree, node, fsid);
                self.cache.add(self.tree, node);
            }
        }
        if !had_remote {
            if let Some(entry) = self.tree.get_mut(node) {
                entry.remote = Some(rnode.handle);
            }
            self.cache.add(self.tree, node);
        }

        if kind != EntryKind::File {
            return Ok(());
        }

        if let Some(t) = transfer {
            if self.remote.transfer_active(t) {
                return Ok(());
            }
            if !fresh {
                // the result is adopted from a real scan only
                self.mark_scan_again(dir);
                return Ok(());
            }
            // transfer finished; what is on disk is now the synced state
            if let Some(entry) = self.tree.get_mut(node) {
                entry.transfer = None;
                entry.fingerprint = item.fingerprint;
                entry.size = item.size;
                entry.mtime = item.mtime;
            }
            self.cache.add(self.tree, node);
            return Ok(());
        }

        let path = self.tree.path_of(node, self.root_path);
        if item.fingerprint != synced_fp {
            let Some(parent_rh) = dir_remote else {
                return Ok(());
            };
            debug!(path = %path.display(), "local edit, uploading");
            let t = self.remote.start_upload(parent_rh, &name, &path)?;
            if let Some(entry) = self.tree.get_mut(node) {
                entry.transfer = Some(t);
            }
        } else if rnode.size != synced_size || rnode.mtime != synced_mtime {
            debug!(path = %path.display(), "remote edit, downloading");
            let t = self.remote.start_download(rnode.handle, &path)?;
            if let Some(entry) = self.tree.get_mut(node) {
                entry.transfer = Some(t);
            }
        }
        Ok(())
    }

    /// Known entry with a local file but no remote counterpart
    fn local_only_known(
        &mut self,
        dir: NodeId,
        node: NodeId,
        item: &ScannedItem,
        dir_remote: Option<RemoteHandle>,
        fresh: bool,
    ) -> Result<()> {
        let (kind, had_remote, transfer, name) = {
            let Some(entry) = self.tree.get_mut(node) else {
                return Ok(());
            };
            if fresh {
                entry.seen_generation = self.generation;
            }
            (entry.kind, entry.remote.is_some(), entry.transfer, entry.name.clone())
        };
        if let Some(fsid) = item.fsid {
            self.registry.bind(self.tree, node, fsid);
        }

        if had_remote {
            // the remote side was deleted elsewhere; quarantine the
            // local copy and forget the entry
            let path = self.tree.path_of(node, self.root_path);
            let archiver = DebrisArchiver::new(self.fs, self.debris);
            match archiver.archive(&path) {
                Ok(resting) => {
                    debug!(from = %path.display(), to = %resting.display(), "remote deletion applied locally");
                    self.purge(node);
                }
                Err(e) if e.is_transient() => {
                    warn!(path = %path.display(), "debris move blocked, retrying later");
                    self.mark_sync_again(dir);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "debris move failed");
                    self.mark_sync_again(dir);
                }
            }
            return Ok(());
        }

        // never reached the remote side yet
        let Some(parent_rh) = dir_remote else {
            self.mark_sync_again(dir);
            return Ok(());
        };
        match kind {
            EntryKind::Folder => {
                let handle = self.remote.create_folder(parent_rh, &name)?;
                if let Some(entry) = self.tree.get_mut(node) {
                    entry.remote = Some(handle);
                }
                self.cache.add(self.tree, node);
            }
            EntryKind::File => {
                if let Some(t) = transfer {
                    if self.remote.transfer_active(t) {
                        return Ok(());
                    }
                    // upload done; the node binds once it appears in
                    // the remote listing
                    if let Some(entry) = self.tree.get_mut(node) {
                        entry.transfer = None;
                    }
                    return Ok(());
                }
                let path = self.tree.path_of(node, self.root_path);
                debug!(path = %path.display(), "uploading new file");
                let t = self.remote.start_upload(parent_rh, &name, &path)?;
                if let Some(entry) = self.tree.get_mut(node) {
                    entry.transfer = Some(t);
                }
            }
        }
        Ok(())
    }

    /// Local file and remote node agree on a name the tree has never
    /// seen: remember the pairing
    fn bind_both(&mut self, dir: NodeId, item: &ScannedItem, rnode: &RemoteNodeInfo) -> Result<()> {
        let mut entry = SyncedEntry::new(item.kind, &item.name);
        entry.fingerprint = item.fingerprint;
        entry.size = item.size;
        entry.mtime = item.mtime;
        entry.remote = Some(rnode.handle);
        entry.seen_generation = self.generation;
        if item.kind == EntryKind::Folder {
            entry.scan_again = AgainScope::HereAndBelow;
            entry.sync_again = AgainScope::HereAndBelow;
        }
        let Some(node) = self.tree.insert(dir, entry) else {
            error!(name = %item.name, "binding collided with an existing child");
            debug_assert!(false, "bind target name already present");
            return Ok(());
        };
        if let Some(fsid) = item.fsid {
            self.registry.bind(self.tree, node, fsid);
        }
        self.cache.add(self.tree, node);
        Ok(())
    }

    /// Brand-new local item: rescue a moved entry when its fsid is
    /// already known, otherwise create and push
    fn local_new(
        &mut self,
        dir: NodeId,
        dir_path: &Path,
        item: ScannedItem,
        dir_remote: Option<RemoteHandle>,
    ) -> Result<()> {
        if let Some(fsid) = item.fsid {
            if self.try_apply_move(dir, fsid, &item, dir_remote)? {
                return Ok(());
            }
        }

        let mut entry = SyncedEntry::new(item.kind, &item.name);
        entry.fingerprint = item.fingerprint;
        entry.size = item.size;
        entry.mtime = item.mtime;
        entry.seen_generation = self.generation;
        if item.kind == EntryKind::Folder {
            entry.scan_again = AgainScope::HereAndBelow;
            entry.sync_again = AgainScope::HereAndBelow;
        }
        let Some(node) = self.tree.insert(dir, entry) else {
            error!(name = %item.name, "new item collided with an existing child");
            debug_assert!(false, "new item name already present");
            return Ok(());
        };
        if let Some(fsid) = item.fsid {
            self.registry.bind(self.tree, node, fsid);
        }
        self.cache.add(self.tree, node);

        let Some(parent_rh) = dir_remote else {
            // pushed once this folder has a remote counterpart
            self.mark_sync_again(dir);
            return Ok(());
        };
        match item.kind {
            EntryKind::File => {
                let path = dir_path.join(&item.name);
                debug!(path = %path.display(), "uploading new file");
                let t = self.remote.start_upload(parent_rh, &item.name, &path)?;
                if let Some(e) = self.tree.get_mut(node) {
                    e.transfer = Some(t);
                }
            }
            EntryKind::Folder => {
                let handle = self.remote.create_folder(parent_rh, &item.name)?;
                if let Some(e) = self.tree.get_mut(node) {
                    e.remote = Some(handle);
                }
                self.cache.add(self.tree, node);
            }
        }
        Ok(())
    }

    /// A scanned fsid matching an unseen remembered entry of the same
    /// shape means the item moved, not that a copy appeared
    fn try_apply_move(
        &mut self,
        dir: NodeId,
        fsid: u64,
        item: &ScannedItem,
        dir_remote: Option<RemoteHandle>,
    ) -> Result<bool> {
        let Some(prev) = self.registry.lookup(fsid) else {
            return Ok(false);
        };
        let Some(prev_entry) = self.tree.get(prev) else {
            self.registry.forget(fsid);
            return Ok(false);
        };
        let same_kind = prev_entry.kind == item.kind;
        let content_matches = item.kind == EntryKind::Folder
            || (prev_entry.size == item.size && prev_entry.mtime == item.mtime);
        let unseen = prev_entry.seen_generation < self.generation;
        if !(same_kind && content_matches && unseen) {
            return Ok(false);
        }
        let old_parent = prev_entry.parent;
        let old_name = prev_entry.name.clone();
        let prev_remote = prev_entry.remote;

        self.tree.detach(prev);
        if !self.tree.attach(prev, dir, &item.name) {
            // target name occupied; put the entry back and fall
            // through to creation
            if let Some(p) = old_parent {
                self.tree.attach(prev, p, &old_name);
            }
            return Ok(false);
        }
        if let Some(entry) = self.tree.get_mut(prev) {
            entry.seen_generation = self.generation;
        }
        debug!(?prev, name = %item.name, "move detected, entry reparented");
        self.cache.add(self.tree, prev);

        if let (Some(rh), Some(parent_rh)) = (prev_remote, dir_remote) {
            self.remote.move_node(rh, parent_rh, &item.name)?;
        }
        Ok(true)
    }

    /// Remote-only node: mirror it locally
    fn remote_new(&mut self, dir: NodeId, dir_path: &Path, rnode: &RemoteNodeInfo) -> Result<()> {
        let name = rnode.name.clone().unwrap_or_default();
        let path = dir_path.join(&name);

        let mut entry = SyncedEntry::new(rnode.kind, &name);
        entry.remote = Some(rnode.handle);
        entry.seen_generation = self.generation;

        match rnode.kind {
            EntryKind::Folder => {
                if let Err(e) = self.fs.mkdir(&path, false) {
                    warn!(path = %path.display(), error = %e, "could not create local folder");
                    self.mark_sync_again(dir);
                    return Ok(());
                }
                entry.scan_again = AgainScope::HereAndBelow;
                entry.sync_again = AgainScope::HereAndBelow;
                let fsid = self.fs.open(&path, true, false).ok().and_then(|i| i.fsid);
                let Some(node) = self.tree.insert(dir, entry) else {
                    error!(name = %name, "remote folder collided with an existing child");
                    return Ok(());
                };
                if let Some(fsid) = fsid {
                    self.registry.bind(self.tree, node, fsid);
                }
                self.cache.add(self.tree, node);
            }
            EntryKind::File => {
                let Some(node) = self.tree.insert(dir, entry) else {
                    error!(name = %name, "remote file collided with an existing child");
                    return Ok(());
                };
                debug!(path = %path.display(), "downloading new remote file");
                let t = self.remote.start_download(rnode.handle, &path)?;
                if let Some(e) = self.tree.get_mut(node) {
                    e.transfer = Some(t);
                }
                self.cache.add(self.tree, node);
            }
        }
        Ok(())
    }

    /// Drop a subtree from the tree, the registry, and the cache
    pub(crate) fn purge(&mut self, node: NodeId) {
        for (id, entry) in self.tree.remove_subtree(node) {
            if let Some(fsid) = entry.fsid {
                self.registry.forget(fsid);
            }
            if let Some(t) = entry.transfer {
                self.remote.cancel_transfer(t);
            }
            self.cache.del(id, entry.dbid);
        }
    }
}
