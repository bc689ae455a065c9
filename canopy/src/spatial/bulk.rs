//! Partitioning for bulk loading.
//!
//! A bulk split cuts a full set of entries into contiguous, page-sized groups
//! that are spatially compact. The tree builds one node per group, then runs
//! the same split over the resulting directory entries until a single root
//! group remains.

use std::fmt::Debug;

use super::curves::{hilbert_key, quantize, z_order_key, CURVE_BITS};
use super::{Mbr, SpatialEntry};

pub trait BulkSplit: Debug + Send + Sync {
    /// Groups of entry indexes, each holding at most `max` entries and, when
    /// more than one group is produced, normally at least `min`.
    fn partition(&self, entries: &[SpatialEntry], min: usize, max: usize) -> Vec<Vec<usize>>;
}

/// Cut `order` into `ceil(len / max)` runs of nearly equal length.
pub fn trivial_partition(order: &[usize], max: usize) -> Vec<Vec<usize>> {
    if order.is_empty() {
        return Vec::new();
    }
    let len = order.len();
    let groups = len.div_ceil(max.max(1));
    let mut out = Vec::with_capacity(groups);
    let mut start = 0;
    for g in 1..=groups {
        let end = len * g / groups;
        out.push(order[start..end].to_vec());
        start = end;
    }
    out
}

fn sort_along(order: &mut [usize], entries: &[SpatialEntry], d: usize) {
    order.sort_by(|&a, &b| entries[a].center_along(d).total_cmp(&entries[b].center_along(d)));
}

/// Bounding rectangle of the entry centers.
fn center_bounds(entries: &[SpatialEntry]) -> Option<Mbr> {
    let mut iter = entries.iter();
    let mut bounds = Mbr::point(&iter.next()?.center());
    for entry in iter {
        bounds.extend_point(&entry.center());
    }
    Some(bounds)
}

/// Sort by the first dimension and cut.
#[derive(Debug, Clone, Copy, Default)]
pub struct OneDimSort;

impl BulkSplit for OneDimSort {
    fn partition(&self, entries: &[SpatialEntry], _min: usize, max: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..entries.len()).collect();
        sort_along(&mut order, entries, 0);
        trivial_partition(&order, max)
    }
}

/// Sort-tile-recursive: slice along one dimension, then tile each slice along
/// the next.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortTileRecursive;

impl SortTileRecursive {
    fn tile(
        order: &mut [usize],
        entries: &[SpatialEntry],
        depth: usize,
        dims: usize,
        max: usize,
        out: &mut Vec<Vec<usize>>,
    ) {
        sort_along(order, entries, depth);
        let pages = order.len().div_ceil(max);
        if depth + 1 >= dims || pages <= 1 {
            out.extend(trivial_partition(order, max));
            return;
        }

        let remaining_dims = (dims - depth) as f64;
        let slices = ((pages as f64).powf(1.0 / remaining_dims).ceil() as usize).clamp(1, pages);
        let len = order.len();
        let mut start = 0;
        for s in 1..=slices {
            let end = len * s / slices;
            Self::tile(&mut order[start..end], entries, depth + 1, dims, max, out);
            start = end;
        }
    }
}

impl BulkSplit for SortTileRecursive {
    fn partition(&self, entries: &[SpatialEntry], _min: usize, max: usize) -> Vec<Vec<usize>> {
        if entries.is_empty() {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..entries.len()).collect();
        let mut out = Vec::new();
        Self::tile(&mut order, entries, 0, entries[0].dim(), max.max(1), &mut out);
        out
    }
}

/// Recursively halve along the dimension with the widest spread of centers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxExtension;

impl MaxExtension {
    fn halve(
        order: &mut [usize],
        entries: &[SpatialEntry],
        max: usize,
        out: &mut Vec<Vec<usize>>,
    ) {
        let pages = order.len().div_ceil(max);
        if pages <= 1 {
            out.push(order.to_vec());
            return;
        }

        let dims = entries[order[0]].dim();
        let mut widest = 0;
        let mut best_extent = f64::NEG_INFINITY;
        for d in 0..dims {
            let (lo, hi) = order.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                let c = entries[i].center_along(d);
                (lo.min(c), hi.max(c))
            });
            if hi - lo > best_extent {
                best_extent = hi - lo;
                widest = d;
            }
        }
        sort_along(order, entries, widest);

        // keep whole pages on each side
        let split = order.len() * (pages / 2) / pages;
        let (left, right) = order.split_at_mut(split);
        Self::halve(left, entries, max, out);
        Self::halve(right, entries, max, out);
    }
}

impl BulkSplit for MaxExtension {
    fn partition(&self, entries: &[SpatialEntry], _min: usize, max: usize) -> Vec<Vec<usize>> {
        if entries.is_empty() {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..entries.len()).collect();
        let mut out = Vec::new();
        Self::halve(&mut order, entries, max.max(1), &mut out);
        out
    }
}

fn curve_partition(
    entries: &[SpatialEntry],
    max: usize,
    key: fn(&[u32], u32) -> Vec<u64>,
) -> Vec<Vec<usize>> {
    let Some(bounds) = center_bounds(entries) else {
        return Vec::new();
    };
    let mut keyed: Vec<(Vec<u64>, usize)> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (key(&quantize(&e.center(), &bounds, CURVE_BITS), CURVE_BITS), i))
        .collect();
    keyed.sort();
    let order: Vec<usize> = keyed.into_iter().map(|(_, i)| i).collect();
    trivial_partition(&order, max)
}

/// Sort along the Z-order (Morton) curve and cut.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZCurve;

impl BulkSplit for ZCurve {
    fn partition(&self, entries: &[SpatialEntry], _min: usize, max: usize) -> Vec<Vec<usize>> {
        curve_partition(entries, max, z_order_key)
    }
}

/// Sort along the Hilbert curve and cut.
#[derive(Debug, Clone, Copy, Default)]
pub struct HilbertCurve;

impl BulkSplit for HilbertCurve {
    fn partition(&self, entries: &[SpatialEntry], _min: usize, max: usize) -> Vec<Vec<usize>> {
        curve_partition(entries, max, hilbert_key)
    }
}
