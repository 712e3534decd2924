//! trisync-core: Bidirectional tree-sync engine
//!
//! Reconciles a local filesystem subtree with a remote hierarchical
//! store through three-way comparison against a persistent snapshot of
//! the last synced state. The embedder supplies the filesystem, remote
//! store, clock, and state table through narrow trait seams and drives
//! the engine cooperatively, one tick at a time.

pub mod assign;
pub mod cache;
pub mod clock;
pub mod config;
pub mod debris;
pub mod fingerprint;
pub mod fsaccess;
pub mod reconcile;
pub mod remote;
pub mod scan;
pub mod session;
pub mod tree;

pub use assign::{assign_filesystem_ids, AssignOutcome};
pub use cache::{HeedTable, MemoryTable, StateTable, SyncedTreeCache};
pub use clock::{Clock, FakeClock, MonotonicClock};
pub use config::{ConfigStore, SyncConfig};
pub use debris::DebrisArchiver;
pub use fingerprint::{Fingerprint, FingerprintIndex};
pub use fsaccess::{EntryKind, FileInfo, FsAccess, FsError, Fsid, MkdirOutcome, StdFs};
pub use reconcile::{NameComparison, ReconcileRow, Reconciler};
pub use remote::{MemoryRemote, RemoteHandle, RemoteNodeInfo, RemoteStore, TransferId};
pub use scan::{DirectoryScanner, ScanOutcome, ScannedItem};
pub use session::{SessionState, SyncSession};
pub use tree::{AgainScope, FsidRegistry, NodeId, SyncedEntry, SyncedTree};
