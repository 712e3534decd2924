//! One configured sync pair, driven cooperatively
//!
//! A session owns the remembered tree, the fsid registry, and the state
//! cache for a single local-root/remote-root pair. The embedder calls
//! [`SyncSession::tick`] from its event loop (one folder's scan work per
//! call) and [`SyncSession::notify_path_changed`] when its filesystem
//! watcher reports activity.

use std::path::{Path, PathBuf};

use color_eyre::Result;
use tracing::{debug, info, warn};

use crate::assign::assign_filesystem_ids;
use crate::cache::{StateTable, SyncedTreeCache};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::debris::DebrisArchiver;
use crate::fsaccess::{EntryKind, FsAccess};
use crate::reconcile::{NameComparison, Reconciler};
use crate::remote::RemoteStore;
use crate::tree::{AgainScope, FsidRegistry, NodeId, SyncedTree};

/// Name of the quarantine folder inside the local root
pub const DEBRIS_FOLDER: &str = ".debris";

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// First full pass after startup or resume
    InitialScan,
    Active,
    Failed,
    Disabled,
    Cancelled,
}

impl SessionState {
    /// Terminal states stop ticking and reject further cache writes
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

/// A running sync pair
pub struct SyncSession<T: StateTable> {
    config: SyncConfig,
    root_path: PathBuf,
    debris: PathBuf,
    tree: SyncedTree,
    registry: FsidRegistry,
    cache: SyncedTreeCache<T>,
    state: SessionState,
    generation: u64,
    name_cmp: NameComparison,
}

impl<T: StateTable> SyncSession<T> {
    /// Create or resume a session.
    ///
    /// The remembered tree is restored from `table`, filesystem ids are
    /// re-derived by fingerprint matching, and the whole tree is marked
    /// for a full scan.
    ///
    /// # Errors
    /// Returns an error if the cached snapshot cannot be read.
    pub fn open(
        config: SyncConfig,
        table: T,
        fs: &dyn FsAccess,
        name_cmp: NameComparison,
    ) -> Result<Self> {
        let root_path = PathBuf::from(&config.local_root);
        let debris = root_path.join(DEBRIS_FOLDER);

        let mut tree = SyncedTree::new();
        let mut cache = SyncedTreeCache::new(table);
        let loaded = cache.load(&mut tree, fs, &root_path)?;

        let mut registry = FsidRegistry::new();
        let assignment = assign_filesystem_ids(&mut tree, &mut registry, fs, &root_path, &debris);
        info!(
            tag = config.tag,
            loaded,
            assigned = assignment.assigned,
            complete = assignment.complete,
            "sync session opened"
        );

        let root = tree.root();
        if let Some(entry) = tree.get_mut(root) {
            entry.remote = Some(config.remote_root);
            entry.scan_again = AgainScope::HereAndBelow;
            entry.sync_again = AgainScope::HereAndBelow;
        }

        Ok(Self {
            config,
            root_path,
            debris,
            tree,
            registry,
            cache,
            state: SessionState::InitialScan,
            generation: 0,
            name_cmp,
        })
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn tree(&self) -> &SyncedTree {
        &self.tree
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Transition the lifecycle state, gating cache writes on terminal
    /// states
    pub fn change_state(&mut self, next: SessionState) {
        if next == self.state {
            return;
        }
        info!(tag = self.config.tag, from = ?self.state, to = ?next, "session state change");
        self.state = next;
        if next.is_terminal() {
            self.cache.set_enabled(false);
        }
    }

    /// Filesystem activity reported by the embedder's watcher.
    ///
    /// Widens the work scopes of the deepest remembered folder covering
    /// `path`: to the folder itself when the path is fully known, to
    /// the whole subtree when unknown deeper components exist.
    pub fn notify_path_changed(&mut self, path: &Path) {
        let Ok(rel) = path.strip_prefix(&self.root_path) else {
            debug!(path = %path.display(), "change outside the sync root ignored");
            return;
        };

        let mut node = self.tree.root();
        let mut components = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned());
        let mut pending: Vec<String> = Vec::new();
        for name in components.by_ref() {
            match self.tree.child(node, &name) {
                Some(child)
                    if self
                        .tree
                        .get(child)
                        .is_some_and(|e| e.kind == EntryKind::Folder) =>
                {
                    node = child;
                }
                Some(_) | None => {
                    pending.push(name);
                    break;
                }
            }
        }
        let remaining = pending.len() + components.count();

        let scope = if remaining > 1 {
            AgainScope::HereAndBelow
        } else {
            AgainScope::HereOnly
        };
        if let Some(entry) = self.tree.get_mut(node) {
            entry.scan_again.widen(scope);
            entry.sync_again.widen(scope);
        }
        debug!(path = %path.display(), ?scope, "change notification applied");
    }

    /// One unit of sync work: a reconciliation pass over whatever is
    /// flagged, missing-entry confirmation, and a cache flush.
    ///
    /// # Errors
    /// A persistence error fails the session; reconciliation errors are
    /// retried on later ticks.
    pub fn tick(
        &mut self,
        fs: &dyn FsAccess,
        remote: &mut dyn RemoteStore,
        clock: &dyn Clock,
    ) -> Result<()> {
        if self.state.is_terminal() || self.state == SessionState::Disabled {
            return Ok(());
        }

        self.generation += 1;
        let root = self.tree.root();
        let mut reconciler = Reconciler {
            tree: &mut self.tree,
            registry: &mut self.registry,
            cache: &mut self.cache,
            remote,
            fs,
            clock,
            root_path: &self.root_path,
            debris: &self.debris,
            name_cmp: self.name_cmp,
            generation: self.generation,
        };
        let completed = match reconciler.reconcile(root) {
            Ok(done) => done,
            Err(e) => {
                warn!(tag = self.config.tag, error = %e, "reconciliation pass failed");
                false
            }
        };

        self.delete_missing(self.tree.root(), fs, remote);

        if let Err(e) = self.cache.flush(&mut self.tree) {
            warn!(tag = self.config.tag, error = %e, "state cache flush failed");
            self.change_state(SessionState::Failed);
            return Err(e);
        }

        if completed && self.state == SessionState::InitialScan {
            self.change_state(SessionState::Active);
        }
        Ok(())
    }

    /// Purge entries that have missed two consecutive scan generations.
    ///
    /// Recurses children-first and only under folders whose scan
    /// actually ran this generation, so a deferred scan can never fake
    /// a deletion. A purged entry still present on disk is quarantined
    /// to debris; a bound remote node is removed.
    fn delete_missing(&mut self, node: NodeId, fs: &dyn FsAccess, remote: &mut dyn RemoteStore) {
        let Some(entry) = self.tree.get(node) else {
            return;
        };
        if entry.kind != EntryKind::Folder {
            return;
        }
        let scanned_here = entry.scanned_generation == self.generation;
        let children: Vec<NodeId> = entry.children.values().copied().collect();

        for child in children {
            let missing = scanned_here
                && self
                    .tree
                    .get(child)
                    .is_some_and(|e| e.seen_generation + 1 < self.generation);
            if missing {
                self.purge_missing(child, fs, remote);
            } else {
                self.delete_missing(child, fs, remote);
            }
        }
    }

    fn purge_missing(&mut self, node: NodeId, fs: &dyn FsAccess, remote: &mut dyn RemoteStore) {
        let path = self.tree.path_of(node, &self.root_path);
        let remote_handle = self.tree.get(node).and_then(|e| e.remote);

        // scans stopped seeing it, but if something is still on disk
        // under that name it is quarantined, never destroyed
        if fs.open(&path, true, false).is_ok() {
            let archiver = DebrisArchiver::new(fs, &self.debris);
            match archiver.archive(&path) {
                Ok(resting) => {
                    debug!(from = %path.display(), to = %resting.display(), "stale entry quarantined")
                }
                Err(e) => warn!(path = %path.display(), error = %e, "could not quarantine stale entry"),
            }
        }

        if let Some(handle) = remote_handle {
            if let Err(e) = remote.remove_node(handle) {
                warn!(path = %path.display(), error = %e, "remote removal failed");
            }
        }

        info!(path = %path.display(), "entry confirmed missing, purged");
        for (id, entry) in self.tree.remove_subtree(node) {
            if let Some(fsid) = entry.fsid {
                self.registry.forget(fsid);
            }
            if let Some(t) = entry.transfer {
                remote.cancel_transfer(t);
            }
            self.cache.del(id, entry.dbid);
        }
    }

    /// Shut the session down: cancel in-flight transfers, write the
    /// final snapshot, then release the tree.
    pub fn teardown(&mut self, remote: &mut dyn RemoteStore) {
        for node in self.tree.all_nodes() {
            if let Some(entry) = self.tree.get_mut(node) {
                if let Some(t) = entry.transfer.take() {
                    remote.cancel_transfer(t);
                }
            }
        }
        if let Err(e) = self.cache.flush(&mut self.tree) {
            warn!(tag = self.config.tag, error = %e, "final flush failed during teardown");
        }
        self.change_state(SessionState::Cancelled);
        self.tree = SyncedTree::new();
        self.registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryTable;
    use crate::clock::FakeClock;
    use crate::fsaccess::StdFs;
    use crate::reconcile::SCAN_INTERVAL_DS;
    use crate::remote::MemoryRemote;
    use std::fs;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir, remote: &MemoryRemote) -> SyncConfig {
        SyncConfig {
            tag: 1,
            local_root: dir.path().to_string_lossy().into_owned(),
            remote_root: remote.root(),
            fsfp: 0,
            enabled: true,
            error: None,
        }
    }

    struct Harness {
        dir: TempDir,
        session: SyncSession<MemoryTable>,
        remote: MemoryRemote,
        fs: StdFs,
        clock: FakeClock,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let remote = MemoryRemote::new();
            let fs = StdFs::new();
            let session = SyncSession::open(
                config_for(&dir, &remote),
                MemoryTable::new(),
                &fs,
                NameComparison::CaseSensitive,
            )
            .unwrap();
            Self {
                dir,
                session,
                remote,
                fs,
                clock: FakeClock::new(100),
            }
        }

        fn tick(&mut self) {
            self.session
                .tick(&self.fs, &mut self.remote, &self.clock)
                .unwrap();
            self.clock.advance(SCAN_INTERVAL_DS + 1);
        }

        fn notify(&mut self, rel: &str) {
            let path = self.dir.path().join(rel);
            self.session.notify_path_changed(&path);
        }
    }

    #[test]
    fn test_initial_scan_goes_active_and_uploads() {
        let mut h = Harness::new();
        fs::write(h.dir.path().join("a.txt"), b"hello").unwrap();

        assert_eq!(h.session.state(), SessionState::InitialScan);
        h.tick();
        assert_eq!(h.session.state(), SessionState::Active);

        let root = h.session.tree().root();
        assert!(h.session.tree().child(root, "a.txt").is_some());
        assert_eq!(h.remote.uploads.len(), 1);
    }

    #[test]
    fn test_notification_triggers_rescan() {
        let mut h = Harness::new();
        h.tick();

        fs::write(h.dir.path().join("late.txt"), b"x").unwrap();
        // without a notification the steady-state tick does nothing
        h.tick();
        let root = h.session.tree().root();
        assert!(h.session.tree().child(root, "late.txt").is_none());

        h.notify("late.txt");
        h.tick();
        assert!(h.session.tree().child(root, "late.txt").is_some());
    }

    #[test]
    fn test_notification_outside_root_ignored() {
        let mut h = Harness::new();
        h.tick();
        h.session.notify_path_changed(Path::new("/elsewhere/file.txt"));
        let root = h.session.tree().root();
        assert!(!h.session.tree().get(root).unwrap().scan_again.pending());
    }

    #[test]
    fn test_missing_file_purged_after_two_generations() {
        let mut h = Harness::new();
        fs::write(h.dir.path().join("gone.txt"), b"bye").unwrap();
        h.tick();

        let root = h.session.tree().root();
        let node = h.session.tree().child(root, "gone.txt").unwrap();
        let t = h.session.tree().get(node).unwrap().transfer.unwrap();
        h.remote.finish_transfer(t);
        let rfile = h.remote.add_file(h.remote.root(), "gone.txt", 3, 0);
        h.notify("gone.txt");
        h.tick();

        fs::remove_file(h.dir.path().join("gone.txt")).unwrap();

        // first generation without the file: entry survives
        h.notify("gone.txt");
        h.tick();
        assert!(h.session.tree().child(root, "gone.txt").is_some());

        // second consecutive miss confirms the deletion
        h.notify("gone.txt");
        h.tick();
        assert!(h.session.tree().child(root, "gone.txt").is_none());
        assert!(h.remote.node(rfile).is_none(), "deletion must propagate");
    }

    #[test]
    fn test_deferred_scan_never_fakes_a_deletion() {
        let mut h = Harness::new();
        fs::write(h.dir.path().join("keep.txt"), b"keep").unwrap();
        h.tick();
        let root = h.session.tree().root();
        assert!(h.session.tree().child(root, "keep.txt").is_some());

        // flags set but the scan is rate-limited each time: entries
        // must never be purged on the strength of a skipped scan
        for _ in 0..4 {
            h.notify("keep.txt");
            h.session
                .tick(&h.fs, &mut h.remote, &h.clock)
                .unwrap();
        }
        assert!(h.session.tree().child(root, "keep.txt").is_some());
    }

    #[test]
    fn test_teardown_cancels_and_gates_cache() {
        let mut h = Harness::new();
        fs::write(h.dir.path().join("a.txt"), b"upload me").unwrap();
        h.tick();
        assert_eq!(h.remote.uploads.len(), 1);

        h.session.teardown(&mut h.remote);
        assert_eq!(h.session.state(), SessionState::Cancelled);
        assert_eq!(h.remote.cancelled.len(), 1);

        // a cancelled session no longer ticks
        fs::write(h.dir.path().join("b.txt"), b"ignored").unwrap();
        h.tick();
        assert_eq!(h.remote.uploads.len(), 1);
    }

    #[test]
    fn test_disabled_session_skips_work() {
        let mut h = Harness::new();
        fs::write(h.dir.path().join("a.txt"), b"x").unwrap();
        h.session.change_state(SessionState::Disabled);
        h.tick();
        assert!(h.remote.uploads.is_empty());
        assert_eq!(h.session.state(), SessionState::Disabled);
    }

    #[test]
    fn test_remote_folder_mirrored_through_session() {
        let mut h = Harness::new();
        let shared = h.remote.add_folder(h.remote.root(), "shared");
        h.remote.add_file(shared, "inside.txt", 6, 42);

        h.tick();
        h.tick();

        assert!(h.dir.path().join("shared").is_dir());
        assert_eq!(h.remote.downloads.len(), 1);
        assert_eq!(
            h.remote.downloads[0].local_path,
            h.dir.path().join("shared/inside.txt")
        );
    }
}
