//! Persistent snapshot of the synced tree using heed (LMDB) + rkyv
//!
//! Entries are rows keyed by an allocated dbid, each carrying the dbid
//! of its parent (0 means the tree root, which itself is never written).
//! Writes are batched through [`SyncedTreeCache`] and applied in one
//! table transaction per flush, deletes first, then inserts ordered so
//! that a parent row always lands before its children. A crash
//! therefore leaves either the previous snapshot or the new one.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use rkyv::rancor::Error as RkyvError;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::fingerprint::Fingerprint;
use crate::fsaccess::{EntryKind, FsAccess};
use crate::tree::{NodeId, SyncedEntry, SyncedTree};

/// Pending inserts beyond this count trigger an early flush
pub const INSERT_HIGH_WATER: usize = 100;

/// Subtrees nested deeper than this are dropped on load
const MAX_LOAD_DEPTH: usize = 100;

/// Flat, transactional row table keyed by u64 ids.
///
/// `begin`/`commit`/`abort` bracket a batch; between them `put`/`del`
/// are staged and applied atomically at commit. Outside a batch each
/// write is its own transaction.
pub trait StateTable {
    /// Reset the read cursor to the first row
    fn rewind(&mut self);

    /// Next `(id, payload)` row, or `None` at the end
    fn next_row(&mut self) -> Option<(u64, Vec<u8>)>;

    fn put(&mut self, id: u64, data: &[u8]) -> Result<()>;

    fn del(&mut self, id: u64) -> Result<()>;

    /// Drop every row
    fn truncate(&mut self) -> Result<()>;

    /// Allocate a fresh, never-before-returned row id (never 0)
    fn alloc_id(&mut self) -> u64;

    fn begin(&mut self);

    fn commit(&mut self) -> Result<()>;

    fn abort(&mut self);
}

/// Committed table operation, recorded by [`MemoryTable`] so tests can
/// assert on write ordering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOp {
    Put(u64),
    Del(u64),
    Truncate,
}

#[derive(Debug, Clone)]
enum StagedOp {
    Put(u64, Vec<u8>),
    Del(u64),
    Truncate,
}

/// In-memory [`StateTable`] for tests and non-persistent embeddings
#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: std::collections::BTreeMap<u64, Vec<u8>>,
    staged: Option<Vec<StagedOp>>,
    cursor: VecDeque<(u64, Vec<u8>)>,
    next_id: u64,
    /// Every committed operation in application order
    pub ops: Vec<TableOp>,
}

impl MemoryTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&mut self, op: StagedOp) {
        match op {
            StagedOp::Put(id, data) => {
                self.rows.insert(id, data);
                self.ops.push(TableOp::Put(id));
            }
            StagedOp::Del(id) => {
                self.rows.remove(&id);
                self.ops.push(TableOp::Del(id));
            }
            StagedOp::Truncate => {
                self.rows.clear();
                self.ops.push(TableOp::Truncate);
            }
        }
    }

    fn stage_or_apply(&mut self, op: StagedOp) {
        match self.staged.as_mut() {
            Some(batch) => batch.push(op),
            None => self.apply(op),
        }
    }
}

impl StateTable for MemoryTable {
    fn rewind(&mut self) {
        self.cursor = self
            .rows
            .iter()
            .map(|(id, data)| (*id, data.clone()))
            .collect();
    }

    fn next_row(&mut self) -> Option<(u64, Vec<u8>)> {
        self.cursor.pop_front()
    }

    fn put(&mut self, id: u64, data: &[u8]) -> Result<()> {
        self.stage_or_apply(StagedOp::Put(id, data.to_vec()));
        Ok(())
    }

    fn del(&mut self, id: u64) -> Result<()> {
        self.stage_or_apply(StagedOp::Del(id));
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        self.stage_or_apply(StagedOp::Truncate);
        Ok(())
    }

    fn alloc_id(&mut self) -> u64 {
        let floor = self.rows.keys().next_back().copied().unwrap_or(0);
        self.next_id = self.next_id.max(floor) + 1;
        self.next_id
    }

    fn begin(&mut self) {
        debug_assert!(self.staged.is_none(), "nested table transaction");
        self.staged = Some(Vec::new());
    }

    fn commit(&mut self) -> Result<()> {
        let batch = self.staged.take().unwrap_or_default();
        for op in batch {
            self.apply(op);
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.staged = None;
    }
}

/// LMDB-backed [`StateTable`], one named database per table
pub struct HeedTable {
    env: Env,
    db: Database<Bytes, Bytes>,
    staged: Option<Vec<StagedOp>>,
    cursor: VecDeque<(u64, Vec<u8>)>,
    next_id: u64,
}

impl HeedTable {
    /// Open or create a table named `name` in the LMDB environment at
    /// `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or created.
    #[allow(unsafe_code)]
    pub fn open(path: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        // SAFETY: standard settings; heed requires unsafe for the
        // memory map. The file must not be modified externally while
        // the Env is open.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(256 * 1024 * 1024)
                .max_dbs(4)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let db: Database<Bytes, Bytes> = env
            .database_options()
            .types::<Bytes, Bytes>()
            .name(name)
            .create(&mut wtxn)?;
        wtxn.commit()?;

        let rtxn = env.read_txn()?;
        let next_id = db
            .last(&rtxn)?
            .map(|(key, _)| decode_id(key))
            .unwrap_or(0);
        drop(rtxn);

        Ok(Self {
            env,
            db,
            staged: None,
            cursor: VecDeque::new(),
            next_id,
        })
    }

    fn apply_all(&self, ops: &[StagedOp]) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        for op in ops {
            match op {
                StagedOp::Put(id, data) => {
                    self.db.put(&mut wtxn, &id.to_be_bytes(), data)?;
                }
                StagedOp::Del(id) => {
                    self.db.delete(&mut wtxn, &id.to_be_bytes())?;
                }
                StagedOp::Truncate => {
                    self.db.clear(&mut wtxn)?;
                }
            }
        }
        wtxn.commit()?;
        Ok(())
    }
}

fn decode_id(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = key.len().min(8);
    buf[8 - len..].copy_from_slice(&key[key.len() - len..]);
    u64::from_be_bytes(buf)
}

impl StateTable for HeedTable {
    fn rewind(&mut self) {
        self.cursor.clear();
        let Ok(rtxn) = self.env.read_txn() else {
            return;
        };
        let Ok(iter) = self.db.iter(&rtxn) else {
            return;
        };
        for row in iter {
            match row {
                Ok((key, data)) => self.cursor.push_back((decode_id(key), data.to_vec())),
                Err(e) => {
                    error!(error = %e, "state table iteration failed");
                    break;
                }
            }
        }
    }

    fn next_row(&mut self) -> Option<(u64, Vec<u8>)> {
        self.cursor.pop_front()
    }

    fn put(&mut self, id: u64, data: &[u8]) -> Result<()> {
        let op = StagedOp::Put(id, data.to_vec());
        match self.staged.as_mut() {
            Some(batch) => {
                batch.push(op);
                Ok(())
            }
            None => self.apply_all(std::slice::from_ref(&op)),
        }
    }

    fn del(&mut self, id: u64) -> Result<()> {
        let op = StagedOp::Del(id);
        match self.staged.as_mut() {
            Some(batch) => {
                batch.push(op);
                Ok(())
            }
            None => self.apply_all(std::slice::from_ref(&op)),
        }
    }

    fn truncate(&mut self) -> Result<()> {
        let op = StagedOp::Truncate;
        match self.staged.as_mut() {
            Some(batch) => {
                batch.push(op);
                Ok(())
            }
            None => self.apply_all(std::slice::from_ref(&op)),
        }
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn begin(&mut self) {
        debug_assert!(self.staged.is_none(), "nested table transaction");
        self.staged = Some(Vec::new());
    }

    fn commit(&mut self) -> Result<()> {
        let batch = self.staged.take().unwrap_or_default();
        self.apply_all(&batch)
    }

    fn abort(&mut self) {
        self.staged = None;
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
struct FingerprintRecord {
    size: i64,
    mtime: i64,
}

/// Serialized form of one tree entry
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
struct EntryRecord {
    /// dbid of the parent row; 0 for children of the root
    parent_dbid: u64,
    is_folder: bool,
    name: String,
    remote: Option<u64>,
    fsid: Option<u64>,
    fingerprint: Option<FingerprintRecord>,
    size: i64,
    mtime: i64,
    shortname: Option<String>,
}

impl EntryRecord {
    fn from_entry(entry: &SyncedEntry, parent_dbid: u64) -> Self {
        Self {
            parent_dbid,
            is_folder: entry.kind == EntryKind::Folder,
            name: entry.name.clone(),
            remote: entry.remote,
            fsid: entry.fsid,
            fingerprint: entry.fingerprint.map(|fp| FingerprintRecord {
                size: fp.size,
                mtime: fp.mtime,
            }),
            size: entry.size,
            mtime: entry.mtime,
            shortname: entry.shortname.clone(),
        }
    }

    fn into_entry(self) -> SyncedEntry {
        let kind = if self.is_folder {
            EntryKind::Folder
        } else {
            EntryKind::File
        };
        let mut entry = SyncedEntry::new(kind, self.name);
        entry.remote = self.remote;
        entry.fsid = self.fsid;
        entry.fingerprint = self
            .fingerprint
            .map(|fp| Fingerprint::of_file(fp.size, fp.mtime));
        entry.size = self.size;
        entry.mtime = self.mtime;
        entry.shortname = self.shortname;
        entry
    }
}

/// Batched writer and loader for the synced-tree snapshot
pub struct SyncedTreeCache<T: StateTable> {
    table: T,
    insert_pending: BTreeSet<NodeId>,
    delete_pending: Vec<u64>,
    enabled: bool,
}

impl<T: StateTable> SyncedTreeCache<T> {
    #[must_use]
    pub fn new(table: T) -> Self {
        Self {
            table,
            insert_pending: BTreeSet::new(),
            delete_pending: Vec::new(),
            enabled: true,
        }
    }

    /// Disable further writes; terminal session states call this so a
    /// cancelled sync stops mutating its snapshot
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Queue an entry for (re-)serialization at the next flush
    pub fn add(&mut self, tree: &SyncedTree, node: NodeId) {
        if !self.enabled || node == tree.root() {
            return;
        }
        self.insert_pending.insert(node);
    }

    /// Queue removal of a purged entry's row. `dbid` comes from the
    /// removed [`SyncedEntry`]; entries never flushed have none.
    pub fn del(&mut self, node: NodeId, dbid: Option<u64>) {
        if !self.enabled {
            return;
        }
        self.insert_pending.remove(&node);
        if let Some(dbid) = dbid {
            self.delete_pending.push(dbid);
        }
    }

    /// Whether pending inserts crossed the high-water mark
    #[must_use]
    pub fn needs_flush(&self) -> bool {
        self.insert_pending.len() >= INSERT_HIGH_WATER || !self.delete_pending.is_empty()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.insert_pending.len() + self.delete_pending.len()
    }

    /// Apply all pending operations in one table transaction.
    ///
    /// Deletes run first; inserts are ordered parent before child by
    /// iterating to a fixed point, so a freshly created subtree is
    /// written top-down.
    ///
    /// # Errors
    /// On a table error the transaction is aborted and the in-memory
    /// tree is left untouched.
    pub fn flush(&mut self, tree: &mut SyncedTree) -> Result<()> {
        if !self.enabled || (self.insert_pending.is_empty() && self.delete_pending.is_empty()) {
            return Ok(());
        }

        self.table.begin();
        match self.flush_inner(tree) {
            Ok(()) => self.table.commit(),
            Err(e) => {
                error!(error = %e, "state cache flush failed, aborting transaction");
                self.table.abort();
                Err(e)
            }
        }
    }

    fn flush_inner(&mut self, tree: &mut SyncedTree) -> Result<()> {
        for dbid in self.delete_pending.drain(..) {
            self.table.del(dbid)?;
        }

        let mut pending: Vec<NodeId> = self.insert_pending.iter().copied().collect();
        self.insert_pending.clear();

        while !pending.is_empty() {
            let mut deferred = Vec::new();
            let mut progressed = false;

            for node in pending {
                // queued, then purged before the flush
                let Some(entry) = tree.get(node) else {
                    continue;
                };
                let parent_dbid = match entry.parent {
                    Some(p) if p == tree.root() => Some(0),
                    Some(p) => tree.get(p).and_then(|e| e.dbid),
                    None => None,
                };
                let Some(parent_dbid) = parent_dbid else {
                    deferred.push(node);
                    continue;
                };

                let dbid = match entry.dbid {
                    Some(dbid) => dbid,
                    None => self.table.alloc_id(),
                };
                let record = EntryRecord::from_entry(entry, parent_dbid);
                let bytes = rkyv::to_bytes::<RkyvError>(&record)
                    .map_err(|e| eyre!("entry serialization failed: {e}"))?;
                self.table.put(dbid, &bytes)?;
                if let Some(e) = tree.get_mut(node) {
                    e.dbid = Some(dbid);
                }
                progressed = true;
            }

            if !deferred.is_empty() && !progressed {
                // parents were never queued; keep the orphans for the
                // next flush rather than writing unreachable rows
                error!(orphans = deferred.len(), "cache rows without a committed parent");
                debug_assert!(false, "insert queue contained orphaned entries");
                self.insert_pending.extend(deferred);
                break;
            }
            pending = deferred;
        }
        Ok(())
    }

    /// Rebuild the tree from the table.
    ///
    /// Rows link to parents by dbid; rows whose parent row is missing,
    /// or deeper than the nesting limit, are dropped with a warning.
    /// Missing shortname hints are recomputed through `fs` and the
    /// affected entries requeued for persistence. Returns the number of
    /// entries restored. The caller marks the whole tree for rescan.
    ///
    /// # Errors
    /// Returns an error if a row fails to deserialize.
    pub fn load(
        &mut self,
        tree: &mut SyncedTree,
        fs: &dyn FsAccess,
        root_path: &Path,
    ) -> Result<usize> {
        let mut by_parent: HashMap<u64, Vec<(u64, EntryRecord)>> = HashMap::new();
        let mut total_rows = 0usize;

        self.table.rewind();
        while let Some((dbid, data)) = self.table.next_row() {
            let record = rkyv::from_bytes::<EntryRecord, RkyvError>(&data)
                .map_err(|e| eyre!("entry row {dbid} failed to deserialize: {e}"))?;
            by_parent.entry(record.parent_dbid).or_default().push((dbid, record));
            total_rows += 1;
        }

        let mut restored = 0usize;
        let mut queue = VecDeque::new();
        queue.push_back((0u64, tree.root(), 0usize));

        while let Some((parent_dbid, parent_node, depth)) = queue.pop_front() {
            let Some(records) = by_parent.remove(&parent_dbid) else {
                continue;
            };
            if depth >= MAX_LOAD_DEPTH {
                warn!(parent_dbid, "dropping cached subtree beyond nesting limit");
                continue;
            }
            for (dbid, record) in records {
                let mut entry = record.into_entry();
                entry.dbid = Some(dbid);
                let is_folder = entry.kind == EntryKind::Folder;
                let needs_shortname = entry.shortname.is_none();
                let name = entry.name.clone();
                let Some(node) = tree.insert(parent_node, entry) else {
                    warn!(dbid, name = %name, "duplicate cached entry name, dropping row");
                    self.delete_pending.push(dbid);
                    continue;
                };
                if needs_shortname {
                    let path = tree.path_of(node, root_path);
                    if let Some(short) = fs.shortname(&path) {
                        if let Some(e) = tree.get_mut(node) {
                            e.shortname = Some(short);
                        }
                        self.insert_pending.insert(node);
                    }
                }
                restored += 1;
                if is_folder {
                    queue.push_back((dbid, node, depth + 1));
                }
            }
        }

        let dropped = total_rows - restored;
        if dropped > 0 {
            warn!(dropped, "cached rows unreachable from the root were ignored");
        }
        debug!(restored, "state cache loaded");
        Ok(restored)
    }

    /// Drop every persisted row and all pending operations
    ///
    /// # Errors
    /// Returns an error if the table truncation fails.
    pub fn truncate(&mut self) -> Result<()> {
        self.insert_pending.clear();
        self.delete_pending.clear();
        self.table.truncate()
    }

    #[must_use]
    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut T {
        &mut self.table
    }
}
