//! Node split strategies.
//!
//! A split receives the entries of an overflowing node and returns two index
//! groups, each holding at least `min_fill` entries.

use std::fmt::Debug;

use super::{Mbr, SpatialEntry};

pub trait SplitStrategy: Debug + Send + Sync {
    fn split(&self, entries: &[SpatialEntry], min_fill: usize) -> (Vec<usize>, Vec<usize>);
}

fn entry_mbrs(entries: &[SpatialEntry]) -> Vec<Mbr> {
    entries.iter().map(|e| e.mbr().into_owned()).collect()
}

/// `prefix[i]` bounds `order[..=i]`, `suffix[i]` bounds `order[i..]`.
fn prefix_suffix(mbrs: &[Mbr], order: &[usize]) -> (Vec<Mbr>, Vec<Mbr>) {
    let mut prefix = Vec::with_capacity(order.len());
    let mut acc = mbrs[order[0]].clone();
    for &i in order {
        acc.extend(&mbrs[i]);
        prefix.push(acc.clone());
    }

    let mut suffix = Vec::with_capacity(order.len());
    let mut acc = mbrs[order[order.len() - 1]].clone();
    for &i in order.iter().rev() {
        acc.extend(&mbrs[i]);
        suffix.push(acc.clone());
    }
    suffix.reverse();
    (prefix, suffix)
}

fn sorted_orders(mbrs: &[Mbr], d: usize) -> [Vec<usize>; 2] {
    let mut by_lo: Vec<usize> = (0..mbrs.len()).collect();
    by_lo.sort_by(|&a, &b| {
        mbrs[a]
            .min(d)
            .total_cmp(&mbrs[b].min(d))
            .then(mbrs[a].max(d).total_cmp(&mbrs[b].max(d)))
    });
    let mut by_hi: Vec<usize> = (0..mbrs.len()).collect();
    by_hi.sort_by(|&a, &b| {
        mbrs[a]
            .max(d)
            .total_cmp(&mbrs[b].max(d))
            .then(mbrs[a].min(d).total_cmp(&mbrs[b].min(d)))
    });
    [by_lo, by_hi]
}

/// The R*-tree split: pick the axis with the smallest margin sum over all
/// legal distributions, then the distribution along it with the least
/// overlap, ties broken by the smaller total volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopologicalSplit;

impl SplitStrategy for TopologicalSplit {
    fn split(&self, entries: &[SpatialEntry], min_fill: usize) -> (Vec<usize>, Vec<usize>) {
        let n = entries.len();
        let min_fill = min_fill.clamp(1, n / 2);
        let mbrs = entry_mbrs(entries);
        let dim = mbrs[0].dim();

        let mut best_axis = 0;
        let mut best_margin = f64::INFINITY;
        for d in 0..dim {
            let mut margin = 0.0;
            for order in sorted_orders(&mbrs, d) {
                let (prefix, suffix) = prefix_suffix(&mbrs, &order);
                for k in min_fill..=(n - min_fill) {
                    margin += prefix[k - 1].margin() + suffix[k].margin();
                }
            }
            if margin < best_margin {
                best_margin = margin;
                best_axis = d;
            }
        }

        let mut best: Option<(Vec<usize>, usize)> = None;
        let mut best_key = (f64::INFINITY, f64::INFINITY);
        for order in sorted_orders(&mbrs, best_axis) {
            let (prefix, suffix) = prefix_suffix(&mbrs, &order);
            for k in min_fill..=(n - min_fill) {
                let key = (
                    prefix[k - 1].overlap(&suffix[k]),
                    prefix[k - 1].volume() + suffix[k].volume(),
                );
                if best.is_none() || key.0 < best_key.0 || (key.0 == best_key.0 && key.1 < best_key.1)
                {
                    best_key = key;
                    best = Some((order.clone(), k));
                }
            }
        }

        match best {
            Some((order, k)) => (order[..k].to_vec(), order[k..].to_vec()),
            None => ((0..n / 2).collect(), (n / 2..n).collect()),
        }
    }
}

/// Grows two groups from their seeds, handing every other entry to the group
/// it enlarges least. `pick_next` decides the order entries are handed out.
fn distribute(
    mbrs: &[Mbr],
    seeds: (usize, usize),
    min_fill: usize,
    pick_next: bool,
) -> (Vec<usize>, Vec<usize>) {
    let mut groups = (vec![seeds.0], vec![seeds.1]);
    let mut bounds = (mbrs[seeds.0].clone(), mbrs[seeds.1].clone());
    let mut remaining: Vec<usize> = (0..mbrs.len())
        .filter(|&i| i != seeds.0 && i != seeds.1)
        .collect();

    while !remaining.is_empty() {
        if groups.0.len() + remaining.len() <= min_fill {
            groups.0.append(&mut remaining);
            break;
        }
        if groups.1.len() + remaining.len() <= min_fill {
            groups.1.append(&mut remaining);
            break;
        }

        let position = if pick_next {
            // the entry with the strongest preference for one group
            let mut best = 0;
            let mut best_diff = f64::NEG_INFINITY;
            for (pos, &i) in remaining.iter().enumerate() {
                let diff =
                    (bounds.0.enlargement(&mbrs[i]) - bounds.1.enlargement(&mbrs[i])).abs();
                if diff > best_diff {
                    best_diff = diff;
                    best = pos;
                }
            }
            best
        } else {
            0
        };
        let i = remaining.remove(position);

        let e0 = bounds.0.enlargement(&mbrs[i]);
        let e1 = bounds.1.enlargement(&mbrs[i]);
        let to_first = if e0 != e1 {
            e0 < e1
        } else if bounds.0.volume() != bounds.1.volume() {
            bounds.0.volume() < bounds.1.volume()
        } else {
            groups.0.len() <= groups.1.len()
        };
        if to_first {
            groups.0.push(i);
            bounds.0.extend(&mbrs[i]);
        } else {
            groups.1.push(i);
            bounds.1.extend(&mbrs[i]);
        }
    }
    groups
}

/// Guttman's quadratic split.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticSplit;

impl SplitStrategy for QuadraticSplit {
    fn split(&self, entries: &[SpatialEntry], min_fill: usize) -> (Vec<usize>, Vec<usize>) {
        let mbrs = entry_mbrs(entries);
        let min_fill = min_fill.clamp(1, mbrs.len() / 2);

        // the pair wasting the most space when put together
        let mut seeds = (0, 1);
        let mut worst = f64::NEG_INFINITY;
        for i in 0..mbrs.len() {
            for j in (i + 1)..mbrs.len() {
                let waste = mbrs[i].union(&mbrs[j]).volume() - mbrs[i].volume() - mbrs[j].volume();
                if waste > worst {
                    worst = waste;
                    seeds = (i, j);
                }
            }
        }
        distribute(&mbrs, seeds, min_fill, true)
    }
}

/// Guttman's linear split.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearSplit;

impl SplitStrategy for LinearSplit {
    fn split(&self, entries: &[SpatialEntry], min_fill: usize) -> (Vec<usize>, Vec<usize>) {
        let mbrs = entry_mbrs(entries);
        let n = mbrs.len();
        let min_fill = min_fill.clamp(1, n / 2);
        let dim = mbrs[0].dim();

        let mut seeds = (0, 1);
        let mut best_separation = f64::NEG_INFINITY;
        for d in 0..dim {
            let mut highest_low = 0;
            let mut lowest_high = 0;
            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for (i, mbr) in mbrs.iter().enumerate() {
                if mbr.min(d) > mbrs[highest_low].min(d) {
                    highest_low = i;
                }
                if mbr.max(d) < mbrs[lowest_high].max(d) {
                    lowest_high = i;
                }
                lo = lo.min(mbr.min(d));
                hi = hi.max(mbr.max(d));
            }
            if highest_low == lowest_high {
                lowest_high = if highest_low == 0 { 1 } else { 0 };
            }
            let width = hi - lo;
            let separation = if width > 0.0 {
                (mbrs[highest_low].min(d) - mbrs[lowest_high].max(d)) / width
            } else {
                0.0
            };
            if separation > best_separation {
                best_separation = separation;
                seeds = (lowest_high, highest_low);
            }
        }
        distribute(&mbrs, seeds, min_fill, false)
    }
}
