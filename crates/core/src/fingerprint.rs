//! Cheap content identity: size + modification time
//!
//! Fingerprints are a heuristic "likely the same content" summary, not
//! a cryptographic hash. A directory's fingerprint is an
//! order-independent combination of the fingerprints of its immediate
//! file children, so combining in any order yields the same value.

use std::collections::BTreeSet;

/// Content fingerprint for a file or folder
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Fingerprint {
    /// File size in bytes (accumulator for folders)
    pub size: i64,
    /// Modification time, seconds since UNIX epoch (accumulator for folders)
    pub mtime: i64,
}

impl Fingerprint {
    /// Fingerprint of a single file
    #[must_use]
    pub fn of_file(size: i64, mtime: i64) -> Self {
        Self { size, mtime }
    }

    /// Fold another fingerprint into this one.
    ///
    /// The combine is associative and commutative: each operand is
    /// diffused through a splitmix64-style mix and the results are
    /// summed with wrapping arithmetic, so child order never matters.
    pub fn combine(&mut self, other: Fingerprint) {
        self.size = self.size.wrapping_add(diffuse(other.size));
        self.mtime = self.mtime.wrapping_add(diffuse(other.mtime));
    }

    /// Combined fingerprint of the given file fingerprints.
    ///
    /// Returns `None` for an empty set: a folder with no file children
    /// has no usable content identity.
    #[must_use]
    pub fn combined<I: IntoIterator<Item = Fingerprint>>(children: I) -> Option<Fingerprint> {
        let mut acc = Fingerprint { size: 0, mtime: 0 };
        let mut any = false;
        for child in children {
            acc.combine(child);
            any = true;
        }
        any.then_some(acc)
    }
}

/// splitmix64 finalizer, applied before summing so that permuting
/// which field a value lands in still changes the result
fn diffuse(v: i64) -> i64 {
    let mut z = (v as u64).wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    (z ^ (z >> 31)) as i64
}

/// Sorted set of unique fingerprints, built fresh per identity
/// assignment pass.
///
/// `add` deduplicates; the returned value is the canonical key to use
/// in the per-fingerprint multimaps. `all` iterates in ascending
/// comparison order (size, then mtime). There is no removal.
#[derive(Debug, Default)]
pub struct FingerprintIndex {
    set: BTreeSet<Fingerprint>,
}

impl FingerprintIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fingerprint, returning the canonical (deduplicated) value
    pub fn add(&mut self, fp: Fingerprint) -> Fingerprint {
        self.set.insert(fp);
        fp
    }

    /// All distinct fingerprints in ascending order
    pub fn all(&self) -> impl Iterator<Item = Fingerprint> + '_ {
        self.set.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_commutative() {
        let a = Fingerprint::of_file(100, 1_700_000_000);
        let b = Fingerprint::of_file(250, 1_700_000_100);
        let c = Fingerprint::of_file(9, 12);

        let ab_c = Fingerprint::combined([a, b, c]).unwrap();
        let c_ba = Fingerprint::combined([c, b, a]).unwrap();
        let b_ac = Fingerprint::combined([b, a, c]).unwrap();

        assert_eq!(ab_c, c_ba);
        assert_eq!(ab_c, b_ac);
    }

    #[test]
    fn test_combine_associative() {
        let a = Fingerprint::of_file(1, 2);
        let b = Fingerprint::of_file(3, 4);
        let c = Fingerprint::of_file(5, 6);

        // (a + b) + c
        let mut left = Fingerprint { size: 0, mtime: 0 };
        left.combine(a);
        left.combine(b);
        left.combine(c);

        // a + (b + c) folded in a different grouping order
        let mut right = Fingerprint { size: 0, mtime: 0 };
        right.combine(c);
        right.combine(a);
        right.combine(b);

        assert_eq!(left, right);
    }

    #[test]
    fn test_combined_empty_is_none() {
        assert_eq!(Fingerprint::combined([]), None);
    }

    #[test]
    fn test_swapped_fields_differ() {
        // diffusion must keep {size: x, mtime: y} distinct from {size: y, mtime: x}
        let a = Fingerprint::combined([Fingerprint::of_file(10, 20)]).unwrap();
        let b = Fingerprint::combined([Fingerprint::of_file(20, 10)]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_index_dedup_and_order() {
        let mut index = FingerprintIndex::new();
        let a = Fingerprint::of_file(200, 5);
        let b = Fingerprint::of_file(100, 9);
        let c = Fingerprint::of_file(100, 3);

        index.add(a);
        index.add(b);
        index.add(c);
        index.add(b); // duplicate

        assert_eq!(index.len(), 3);
        let order: Vec<_> = index.all().collect();
        // ascending by size, then mtime
        assert_eq!(order, vec![c, b, a]);
    }
}
