//! Filesystem identity re-assignment after restart
//!
//! Filesystem ids are not persisted reliably across restarts, so on
//! startup the remembered tree is matched against the live filesystem
//! by fingerprint, and the best path match per fingerprint wins the
//! observed fsid. Folders fingerprint as the combine of their file
//! children, so they regain identity the same way files do.
//! Fingerprints with no observed counterpart are simply dropped; the
//! matching is lossy and the scan pass corrects anything it missed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::fingerprint::{Fingerprint, FingerprintIndex};
use crate::fsaccess::{EntryKind, FsAccess, Fsid};
use crate::tree::{FsidRegistry, NodeId, SyncedTree};

/// Result of one assignment pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignOutcome {
    /// Number of fsids bound to remembered entries
    pub assigned: usize,
    /// False when a directory could not be listed; partial results are
    /// kept either way
    pub complete: bool,
}

/// Similarity of two paths, walking backwards from their ends.
///
/// Matched characters score one each; separators score nothing.
/// Characters matched after the last common separator do not count
/// unless the match is total. Paths whose leaf names differ score zero:
/// a shared ".txt" suffix is not evidence of identity.
#[must_use]
pub fn reverse_path_match_score(a: &str, b: &str) -> i32 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let a = a.as_bytes();
    let b = b.as_bytes();

    let mut index = 0usize;
    let mut separator_bias = 0usize;
    let mut accumulated = 0usize;
    while index < a.len() && index < b.len() {
        let c1 = a[a.len() - index - 1];
        let c2 = b[b.len() - index - 1];
        if c1 != c2 {
            break;
        }
        index += 1;
        accumulated += 1;
        if c1 == b'/' {
            separator_bias += 1;
            accumulated = 0;
        }
    }

    if index == a.len() && index == b.len() {
        (index - separator_bias) as i32
    } else if separator_bias == 0 {
        // the mismatch is inside the leaf names
        0
    } else {
        (index - separator_bias - accumulated) as i32
    }
}

/// Clear and re-derive the fsid of every remembered entry.
///
/// Files carry their own fingerprint; a folder's is the
/// order-independent combine of its file children, computed on both
/// sides. Remembered entries and observed paths are grouped by
/// fingerprint; for every fingerprint present on both sides all
/// same-kind cross pairs are scored with [`reverse_path_match_score`]
/// and assigned greedily, best score first, never reusing an fsid and
/// never touching the root.
pub fn assign_filesystem_ids(
    tree: &mut SyncedTree,
    registry: &mut FsidRegistry,
    fs: &dyn FsAccess,
    root_path: &Path,
    debris: &Path,
) -> AssignOutcome {
    registry.clear();
    for node in tree.all_nodes() {
        if let Some(entry) = tree.get_mut(node) {
            entry.fsid = None;
        }
    }

    let mut index = FingerprintIndex::new();
    let mut remembered: HashMap<Fingerprint, Vec<(NodeId, String, EntryKind)>> = HashMap::new();
    let root = tree.root();
    for node in tree.all_nodes() {
        if node == root {
            continue;
        }
        let Some(entry) = tree.get(node) else {
            continue;
        };
        let fp = match entry.kind {
            EntryKind::File => entry.fingerprint,
            EntryKind::Folder => Fingerprint::combined(entry.children.values().filter_map(
                |&child| {
                    tree.get(child)
                        .filter(|e| e.kind == EntryKind::File)
                        .and_then(|e| e.fingerprint)
                },
            )),
        };
        let Some(fp) = fp else {
            continue;
        };
        let key = index.add(fp);
        let path = tree.path_of(node, root_path).to_string_lossy().into_owned();
        remembered.entry(key).or_default().push((node, path, entry.kind));
    }

    let (observed, complete) = collect_observed(fs, root_path, debris);

    let mut pairs: Vec<(i32, NodeId, Fsid)> = Vec::new();
    for fp in index.all() {
        let (Some(nodes), Some(found)) = (remembered.get(&fp), observed.get(&fp)) else {
            continue;
        };
        for (node, node_path, kind) in nodes {
            for (found_path, fsid, found_kind) in found {
                if kind != found_kind {
                    continue;
                }
                let score = reverse_path_match_score(node_path, found_path);
                if score > 0 {
                    pairs.push((score, *node, *fsid));
                }
            }
        }
    }
    pairs.sort_by(|a, b| b.0.cmp(&a.0));

    let mut assigned = 0usize;
    let mut taken_nodes = std::collections::HashSet::new();
    for (score, node, fsid) in pairs {
        if taken_nodes.contains(&node) || registry.lookup(fsid).is_some() {
            continue;
        }
        if registry.bind(tree, node, fsid) {
            debug!(?node, fsid, score, "fsid re-assigned");
            taken_nodes.insert(node);
            assigned += 1;
        }
    }

    info!(assigned, complete, "filesystem identity assignment finished");
    AssignOutcome { assigned, complete }
}

/// Recursively gather on-disk paths by fingerprint, skipping the debris
/// folder and symlinks.
///
/// Each directory contributes its own combined fingerprint alongside
/// its file children; the sync root itself never carries an fsid.
fn collect_observed(
    fs: &dyn FsAccess,
    root_path: &Path,
    debris: &Path,
) -> (HashMap<Fingerprint, Vec<(String, Fsid, EntryKind)>>, bool) {
    let mut observed: HashMap<Fingerprint, Vec<(String, Fsid, EntryKind)>> = HashMap::new();
    let mut complete = true;
    let mut stack: Vec<(PathBuf, Option<Fsid>)> = vec![(root_path.to_path_buf(), None)];

    while let Some((dir, dir_fsid)) = stack.pop() {
        if dir.starts_with(debris) {
            continue;
        }
        let names = match fs.list_dir(&dir) {
            Ok(names) => names,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "directory unreadable during fsid scan");
                complete = false;
                continue;
            }
        };
        let mut child_fps = Vec::new();
        for name in names {
            let path = dir.join(&name);
            if path.starts_with(debris) {
                continue;
            }
            let info = match fs.open(&path, true, false) {
                Ok(info) => info,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if info.is_symlink {
                continue;
            }
            match info.kind {
                EntryKind::Folder => stack.push((path, info.fsid)),
                EntryKind::File => {
                    let fp = Fingerprint::of_file(info.size, info.mtime);
                    child_fps.push(fp);
                    if let Some(fsid) = info.fsid {
                        observed.entry(fp).or_default().push((
                            path.to_string_lossy().into_owned(),
                            fsid,
                            EntryKind::File,
                        ));
                    }
                }
            }
        }
        if let (Some(fsid), Some(fp)) = (dir_fsid, Fingerprint::combined(child_fps)) {
            observed.entry(fp).or_default().push((
                dir.to_string_lossy().into_owned(),
                fsid,
                EntryKind::Folder,
            ));
        }
    }
    (observed, complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsaccess::StdFs;
    use crate::tree::SyncedEntry;
    use std::fs as stdfs;
    use tempfile::TempDir;

    #[test]
    fn test_score_identity() {
        let p = "/sync/docs/report.txt";
        let separators = p.matches('/').count();
        assert_eq!(
            reverse_path_match_score(p, p),
            (p.len() - separators) as i32
        );
    }

    #[test]
    fn test_score_leaf_mismatch_is_zero() {
        // shared ".txt" suffix alone must not score
        assert_eq!(reverse_path_match_score("/a/report.txt", "/a/summary.txt"), 0);
    }

    #[test]
    fn test_score_partial_prefers_closer_path() {
        let remembered = "/sync/docs/a.txt";
        let same_dir = "/backup/docs/a.txt";
        let other_dir = "/backup/pics/a.txt";
        assert!(
            reverse_path_match_score(remembered, same_dir)
                > reverse_path_match_score(remembered, other_dir)
        );
    }

    #[test]
    fn test_score_empty_is_zero() {
        assert_eq!(reverse_path_match_score("", "/a"), 0);
        assert_eq!(reverse_path_match_score("/a", ""), 0);
    }

    fn remember_file(tree: &mut SyncedTree, parent: NodeId, name: &str, fp: Fingerprint) -> NodeId {
        let mut e = SyncedEntry::new(EntryKind::File, name);
        e.fingerprint = Some(fp);
        tree.insert(parent, e).unwrap()
    }

    fn fingerprint_on_disk(fs: &StdFs, path: &Path) -> Fingerprint {
        let info = fs.open(path, true, false).unwrap();
        Fingerprint::of_file(info.size, info.mtime)
    }

    #[test]
    fn test_assignment_matches_by_path() {
        let dir = TempDir::new().unwrap();
        stdfs::create_dir(dir.path().join("docs")).unwrap();
        stdfs::write(dir.path().join("docs/a.txt"), b"alpha").unwrap();
        stdfs::write(dir.path().join("b.txt"), b"beta!").unwrap();

        let fs = StdFs::new();
        let fp_a = fingerprint_on_disk(&fs, &dir.path().join("docs/a.txt"));
        let fp_b = fingerprint_on_disk(&fs, &dir.path().join("b.txt"));

        let mut tree = SyncedTree::new();
        let root = tree.root();
        let docs = tree
            .insert(root, SyncedEntry::new(EntryKind::Folder, "docs"))
            .unwrap();
        let a = remember_file(&mut tree, docs, "a.txt", fp_a);
        let b = remember_file(&mut tree, root, "b.txt", fp_b);

        let mut registry = FsidRegistry::new();
        let debris = dir.path().join(".debris");
        let outcome = assign_filesystem_ids(&mut tree, &mut registry, &fs, dir.path(), &debris);

        assert!(outcome.complete);
        // both files plus the docs folder itself
        assert_eq!(outcome.assigned, 3);

        let ino_docs = fs.open(&dir.path().join("docs"), true, false).unwrap().fsid;
        let ino_a = fs.open(&dir.path().join("docs/a.txt"), true, false).unwrap().fsid;
        let ino_b = fs.open(&dir.path().join("b.txt"), true, false).unwrap().fsid;
        assert_eq!(tree.get(docs).unwrap().fsid, ino_docs);
        assert_eq!(tree.get(a).unwrap().fsid, ino_a);
        assert_eq!(tree.get(b).unwrap().fsid, ino_b);
    }

    #[test]
    fn test_assignment_disambiguates_identical_fingerprints() {
        // two files with identical content metadata: each remembered
        // entry must win the fsid of its own path
        let dir = TempDir::new().unwrap();
        stdfs::create_dir(dir.path().join("one")).unwrap();
        stdfs::create_dir(dir.path().join("two")).unwrap();
        stdfs::write(dir.path().join("one/same.txt"), b"12345").unwrap();
        stdfs::write(dir.path().join("two/same.txt"), b"12345").unwrap();
        // force identical mtimes
        let t = filetime_of(&dir.path().join("one/same.txt"));
        set_mtime(&dir.path().join("two/same.txt"), t);

        let fs = StdFs::new();
        let fp = fingerprint_on_disk(&fs, &dir.path().join("one/same.txt"));
        assert_eq!(fp, fingerprint_on_disk(&fs, &dir.path().join("two/same.txt")));

        let mut tree = SyncedTree::new();
        let one = tree
            .insert(tree.root(), SyncedEntry::new(EntryKind::Folder, "one"))
            .unwrap();
        let two = tree
            .insert(tree.root(), SyncedEntry::new(EntryKind::Folder, "two"))
            .unwrap();
        let f1 = remember_file(&mut tree, one, "same.txt", fp);
        let f2 = remember_file(&mut tree, two, "same.txt", fp);

        let mut registry = FsidRegistry::new();
        let debris = dir.path().join(".debris");
        let outcome = assign_filesystem_ids(&mut tree, &mut registry, &fs, dir.path(), &debris);
        // both files and both folders; the folders also share a
        // combined fingerprint and disambiguate the same way
        assert_eq!(outcome.assigned, 4);

        let ino1 = fs.open(&dir.path().join("one/same.txt"), true, false).unwrap().fsid;
        let ino2 = fs.open(&dir.path().join("two/same.txt"), true, false).unwrap().fsid;
        assert_eq!(tree.get(f1).unwrap().fsid, ino1);
        assert_eq!(tree.get(f2).unwrap().fsid, ino2);
        assert_ne!(tree.get(f1).unwrap().fsid, tree.get(f2).unwrap().fsid);
    }

    #[test]
    fn test_folder_regains_fsid_after_restart() {
        let dir = TempDir::new().unwrap();
        stdfs::create_dir(dir.path().join("docs")).unwrap();
        stdfs::write(dir.path().join("docs/a.txt"), b"alpha").unwrap();
        stdfs::create_dir(dir.path().join("empty")).unwrap();

        let fs = StdFs::new();
        let fp_a = fingerprint_on_disk(&fs, &dir.path().join("docs/a.txt"));

        let mut tree = SyncedTree::new();
        let root = tree.root();
        let docs = tree
            .insert(root, SyncedEntry::new(EntryKind::Folder, "docs"))
            .unwrap();
        remember_file(&mut tree, docs, "a.txt", fp_a);
        let empty = tree
            .insert(root, SyncedEntry::new(EntryKind::Folder, "empty"))
            .unwrap();

        let mut registry = FsidRegistry::new();
        let debris = dir.path().join(".debris");
        let outcome = assign_filesystem_ids(&mut tree, &mut registry, &fs, dir.path(), &debris);
        assert!(outcome.complete);

        // the folder combines its file child and finds its own inode,
        // so a post-restart folder move is recognizable by fsid
        let ino_docs = fs.open(&dir.path().join("docs"), true, false).unwrap().fsid;
        assert!(ino_docs.is_some());
        assert_eq!(tree.get(docs).unwrap().fsid, ino_docs);
        assert_eq!(ino_docs.and_then(|f| registry.lookup(f)), Some(docs));

        // a folder without file children has no usable fingerprint
        assert_eq!(tree.get(empty).unwrap().fsid, None);
    }

    #[test]
    fn test_unreadable_root_reports_incomplete() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone");

        let mut tree = SyncedTree::new();
        let mut registry = FsidRegistry::new();
        let debris = missing.join(".debris");
        let outcome =
            assign_filesystem_ids(&mut tree, &mut registry, &StdFs::new(), &missing, &debris);
        assert!(!outcome.complete);
        assert_eq!(outcome.assigned, 0);
    }

    fn filetime_of(path: &Path) -> std::time::SystemTime {
        stdfs::metadata(path).unwrap().modified().unwrap()
    }

    fn set_mtime(path: &Path, t: std::time::SystemTime) {
        let f = stdfs::OpenOptions::new().write(true).open(path).unwrap();
        f.set_modified(t).unwrap();
    }
}
