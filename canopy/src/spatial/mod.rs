//! The spatial tree family: an R*-tree over points, pruned with minimum
//! bounding rectangles.

mod bulk;
mod curves;
mod insertion;
mod mbr;
mod node;
mod query;
mod reinsert;
mod settings;
mod split;
mod tree;

pub use bulk::{
    trivial_partition, BulkSplit, HilbertCurve, MaxExtension, OneDimSort, SortTileRecursive,
    ZCurve,
};
pub use curves::{hilbert_key, quantize, z_order_key, CURVE_BITS};
pub use insertion::{
    ApproximativeLeastOverlap, Combined, InsertionStrategy, LeastEnlargement, LeastOverlap,
};
pub use mbr::Mbr;
pub use node::{SpatialEntry, SpatialNode};
pub use reinsert::{CloseReinsert, FarReinsert, OverflowTreatment, ReinsertStrategy};
pub use settings::{RTreeSettings, RTreeSettingsBuilder};
pub use split::{LinearSplit, QuadraticSplit, SplitStrategy, TopologicalSplit};
pub use tree::RStarTree;
