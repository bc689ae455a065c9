//! Overflow handling by forced reinsertion.

use std::fmt::Debug;
use std::sync::Arc;

use super::SpatialEntry;

/// Chooses which entries of an overflowing node are reinserted, and in which
/// order.
pub trait ReinsertStrategy: Debug + Send + Sync {
    /// Indexes of the `amount` entries to remove, in reinsertion order.
    /// `center` is the center of the node's bounding rectangle.
    fn select(&self, entries: &[SpatialEntry], center: &[f64], amount: usize) -> Vec<usize>;
}

/// Entry indexes sorted by squared distance between the entry center and
/// `center`, farthest first.
fn farthest_first(entries: &[SpatialEntry], center: &[f64]) -> Vec<usize> {
    let mut keyed: Vec<(usize, f64)> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let d: f64 = center
                .iter()
                .enumerate()
                .map(|(d, c)| {
                    let diff = e.center_along(d) - c;
                    diff * diff
                })
                .sum();
            (i, d)
        })
        .collect();
    keyed.sort_by(|a, b| b.1.total_cmp(&a.1));
    keyed.into_iter().map(|(i, _)| i).collect()
}

/// Removes the entries farthest from the center and reinserts the closest of
/// them first.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseReinsert;

impl ReinsertStrategy for CloseReinsert {
    fn select(&self, entries: &[SpatialEntry], center: &[f64], amount: usize) -> Vec<usize> {
        let mut chosen = farthest_first(entries, center);
        chosen.truncate(amount);
        chosen.reverse();
        chosen
    }
}

/// Removes the entries farthest from the center and reinserts the farthest
/// first.
#[derive(Debug, Clone, Copy, Default)]
pub struct FarReinsert;

impl ReinsertStrategy for FarReinsert {
    fn select(&self, entries: &[SpatialEntry], center: &[f64], amount: usize) -> Vec<usize> {
        let mut chosen = farthest_first(entries, center);
        chosen.truncate(amount);
        chosen
    }
}

/// What happens when a node exceeds its capacity.
#[derive(Debug, Clone)]
pub enum OverflowTreatment {
    /// Reinsert part of the node once per level and insertion, split after.
    Reinsert(Arc<dyn ReinsertStrategy>),
    /// Always split.
    SplitOnly,
}

impl Default for OverflowTreatment {
    fn default() -> Self {
        OverflowTreatment::Reinsert(Arc::new(CloseReinsert))
    }
}

/// Per-insertion record of the levels that already had a forced reinsertion.
/// Levels count from the leaves (leaves are level 0).
#[derive(Debug, Default)]
pub(crate) struct ReinsertGuard {
    levels: Vec<bool>,
}

impl ReinsertGuard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Marks `level` and returns whether it was unmarked before.
    pub(crate) fn claim(&mut self, level: usize) -> bool {
        if self.levels.len() <= level {
            self.levels.resize(level + 1, false);
        }
        !std::mem::replace(&mut self.levels[level], true)
    }
}
