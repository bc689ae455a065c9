//! Subtree choice in metric trees.

use std::fmt::Debug;

/// Picks the directory entry a new object descends into.
///
/// `candidates` holds, per entry of a directory node, the distance from the
/// new object to the entry's routing object and the entry's covering radius.
pub trait MetricInsertion: Debug + Send + Sync {
    fn choose(&self, candidates: &[(f64, f64)]) -> usize;
}

/// Among the entries already covering the object take the one with the
/// closest routing object; otherwise the one whose radius grows least.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinimumEnlargement;

impl MetricInsertion for MinimumEnlargement {
    fn choose(&self, candidates: &[(f64, f64)]) -> usize {
        let mut covering: Option<(usize, f64)> = None;
        let mut growing: Option<(usize, f64)> = None;
        for (i, &(distance, radius)) in candidates.iter().enumerate() {
            if distance <= radius {
                if covering.map_or(true, |(_, best)| distance < best) {
                    covering = Some((i, distance));
                }
            } else {
                let enlargement = distance - radius;
                if growing.map_or(true, |(_, best)| enlargement < best) {
                    growing = Some((i, enlargement));
                }
            }
        }
        covering.or(growing).map_or(0, |(i, _)| i)
    }
}
