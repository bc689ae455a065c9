//! The metric tree family: an M-tree over arbitrary objects, pruned with
//! routing objects and covering radii, and the MkMax reverse-kNN index built
//! on it.

mod insertion;
mod mkmax;
mod node;
mod query;
mod settings;
mod split;
mod tree;

pub use insertion::{MetricInsertion, MinimumEnlargement};
pub use mkmax::MkMaxTree;
pub use node::{MetricEntry, MetricNode};
pub use settings::{MTreeSettings, MTreeSettingsBuilder};
pub use split::{
    Assignment, Balanced, DistanceMatrix, Distribution, FarthestPoints, GeneralizedHyperplane,
    MlbDist, MmRad, Promotion, RandomPromotion,
};
pub use tree::MTree;
