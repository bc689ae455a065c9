//! Subtree choice during insertion.

use std::fmt::Debug;
use std::sync::Arc;

use super::{Mbr, SpatialEntry};

/// Picks the directory entry an object (or subtree) descends into.
pub trait InsertionStrategy: Debug + Send + Sync {
    /// `entries` are the entries of a directory node, never empty.
    /// `children_are_leaves` is set when the node sits directly above the
    /// leaf level.
    fn choose(&self, entries: &[SpatialEntry], object: &Mbr, children_are_leaves: bool) -> usize;
}

fn enlargement_and_volume(entry: &SpatialEntry, object: &Mbr) -> (f64, f64) {
    let mbr = entry.mbr();
    let volume = mbr.volume();
    (mbr.union(object).volume() - volume, volume)
}

/// Sum over all other entries of the overlap gained by enlarging
/// `entries[index]` to cover `object`.
fn overlap_enlargement(entries: &[SpatialEntry], index: usize, object: &Mbr) -> f64 {
    let current = entries[index].mbr();
    let grown = current.union(object);
    entries
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != index)
        .map(|(_, other)| {
            let other = other.mbr();
            grown.overlap(&other) - current.overlap(&other)
        })
        .sum()
}

/// Least volume enlargement, ties broken by smaller volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastEnlargement;

impl InsertionStrategy for LeastEnlargement {
    fn choose(&self, entries: &[SpatialEntry], object: &Mbr, _children_are_leaves: bool) -> usize {
        let mut best = 0;
        let mut best_key = (f64::INFINITY, f64::INFINITY);
        for (i, entry) in entries.iter().enumerate() {
            let key = enlargement_and_volume(entry, object);
            if key.0 < best_key.0 || (key.0 == best_key.0 && key.1 < best_key.1) {
                best = i;
                best_key = key;
            }
        }
        best
    }
}

/// Least overlap enlargement against all siblings. Quadratic in the number
/// of entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastOverlap;

impl InsertionStrategy for LeastOverlap {
    fn choose(&self, entries: &[SpatialEntry], object: &Mbr, _children_are_leaves: bool) -> usize {
        let mut best = 0;
        let mut best_key = (f64::INFINITY, f64::INFINITY, f64::INFINITY);
        for i in 0..entries.len() {
            let (enlargement, volume) = enlargement_and_volume(&entries[i], object);
            let key = (overlap_enlargement(entries, i, object), enlargement, volume);
            if key.partial_cmp(&best_key) == Some(std::cmp::Ordering::Less) {
                best = i;
                best_key = key;
            }
        }
        best
    }
}

/// Least overlap enlargement, evaluated only for the `candidates` entries
/// with the least volume enlargement.
#[derive(Debug, Clone, Copy)]
pub struct ApproximativeLeastOverlap {
    pub candidates: usize,
}

impl Default for ApproximativeLeastOverlap {
    fn default() -> Self {
        Self { candidates: 32 }
    }
}

impl InsertionStrategy for ApproximativeLeastOverlap {
    fn choose(&self, entries: &[SpatialEntry], object: &Mbr, _children_are_leaves: bool) -> usize {
        let mut by_enlargement: Vec<(usize, f64, f64)> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let (enlargement, volume) = enlargement_and_volume(e, object);
                (i, enlargement, volume)
            })
            .collect();
        by_enlargement.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.2.total_cmp(&b.2)));
        by_enlargement.truncate(self.candidates.max(1));

        let mut best = by_enlargement[0].0;
        let mut best_overlap = f64::INFINITY;
        for (i, _, _) in by_enlargement {
            let overlap = overlap_enlargement(entries, i, object);
            if overlap < best_overlap {
                best = i;
                best_overlap = overlap;
            }
        }
        best
    }
}

/// One strategy for nodes right above the leaves, another for the rest.
#[derive(Debug, Clone)]
pub struct Combined {
    pub directory: Arc<dyn InsertionStrategy>,
    pub leaf: Arc<dyn InsertionStrategy>,
}

impl Default for Combined {
    fn default() -> Self {
        Self {
            directory: Arc::new(LeastEnlargement),
            leaf: Arc::new(ApproximativeLeastOverlap::default()),
        }
    }
}

impl InsertionStrategy for Combined {
    fn choose(&self, entries: &[SpatialEntry], object: &Mbr, children_are_leaves: bool) -> usize {
        if children_are_leaves {
            self.leaf.choose(entries, object, children_are_leaves)
        } else {
            self.directory.choose(entries, object, children_are_leaves)
        }
    }
}
