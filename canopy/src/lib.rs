//! # Canopy - Paged Similarity Search Trees
//!
//! Balanced, page-based index trees answering exact k-nearest-neighbor,
//! range and reverse-kNN queries faster than a linear scan.
//!
//! ## Features
//!
//! - **R\*-tree**: points under any distance with a rectangle lower bound,
//!   forced reinsertion, several split and insertion strategies, bulk loading
//!   with sort-tile-recursive, Z-order or Hilbert orderings
//! - **M-tree**: arbitrary objects under a metric, with pluggable promotion
//!   and distribution policies
//! - **MkMax tree**: reverse kNN on top of the M-tree
//! - **Paged storage**: fixed-size pages in memory or in a file, an LRU cache
//!   of decoded nodes and CRC-checked page frames
//! - **Shared search**: one best-first branch-and-bound search drives kNN,
//!   range and incremental queries of both tree families
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use canopy::{RStarTree, RTreeSettings};
//!
//! let mut tree = RStarTree::in_memory(RTreeSettings::default())?;
//! tree.insert(1, &[0.5, 0.5])?;
//! tree.insert(2, &[2.0, 1.0])?;
//! let nearest = tree.knn(&[0.0, 0.0], 1)?;
//! assert_eq!(nearest[0].id, 1);
//! ```
//!
//! ## Metric objects
//!
//! ```rust,ignore
//! use canopy::{LevenshteinDistance, MTree, MTreeSettings};
//!
//! let mut tree = MTree::in_memory(LevenshteinDistance, MTreeSettings::default())?;
//! tree.initialize(vec!["kitten".to_string(), "sitting".to_string()])?;
//! let hits = tree.range(&"mitten".to_string(), 1.0)?;
//! ```

pub mod distance;
pub mod errors;
pub mod metric;
pub mod search;
pub mod settings;
pub mod spatial;
pub mod stats;
pub mod storage;

pub use distance::{
    Distance, EuclideanDistance, LevenshteinDistance, ManhattanDistance, MaximumDistance,
    SpatialDistance,
};
pub use errors::{IndexError, IndexResult};
pub use metric::{MTree, MTreeSettings, MkMaxTree};
pub use search::{Neighbor, PrioritySearch};
pub use settings::TreeSettings;
pub use spatial::{Mbr, RStarTree, RTreeSettings};
pub use stats::{StatisticsSnapshot, TreeStatistics, TreeStats};
pub use storage::{FilePageStore, MemoryPageStore, ObjectId, PageId, PageStore};
