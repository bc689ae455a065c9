use std::sync::Arc;

use super::bulk::BulkSplit;
use super::insertion::{Combined, InsertionStrategy};
use super::reinsert::OverflowTreatment;
use super::split::{SplitStrategy, TopologicalSplit};
use crate::errors::IndexResult;
use crate::settings::{validate_fraction, TreeSettings, DEFAULT_REINSERT_AMOUNT};
use crate::stats::TreeStatistics;

/// Configuration of an [`RStarTree`](super::RStarTree).
///
/// ## Example
///
/// ```rust,ignore
/// use canopy::spatial::{RTreeSettings, QuadraticSplit, HilbertCurve};
///
/// let settings = RTreeSettings::builder()
///     .leaf_capacity(20)
///     .dir_capacity(20)
///     .split(QuadraticSplit)
///     .bulk_split(HilbertCurve)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct RTreeSettings {
    pub tree: TreeSettings,
    pub insertion: Arc<dyn InsertionStrategy>,
    pub split: Arc<dyn SplitStrategy>,
    pub overflow: OverflowTreatment,
    /// Fraction of a node's entries removed by a forced reinsertion.
    pub reinsert_amount: f64,
    /// Partitioning used by `initialize`; `None` inserts one by one.
    pub bulk_split: Option<Arc<dyn BulkSplit>>,
}

impl Default for RTreeSettings {
    fn default() -> Self {
        Self {
            tree: TreeSettings::default(),
            insertion: Arc::new(Combined::default()),
            split: Arc::new(TopologicalSplit),
            overflow: OverflowTreatment::default(),
            reinsert_amount: DEFAULT_REINSERT_AMOUNT,
            bulk_split: None,
        }
    }
}

impl RTreeSettings {
    #[inline]
    pub fn builder() -> RTreeSettingsBuilder {
        RTreeSettingsBuilder::new()
    }

    pub fn validate(&self) -> IndexResult<()> {
        self.tree.validate()?;
        validate_fraction("reinsert amount", self.reinsert_amount)
    }
}

/// Fluent builder for [`RTreeSettings`].
pub struct RTreeSettingsBuilder {
    settings: RTreeSettings,
}

impl Default for RTreeSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RTreeSettingsBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            settings: RTreeSettings::default(),
        }
    }

    /// Page size of in-memory trees. Default: 4096 bytes
    #[inline]
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.settings.tree.page_size = bytes;
        self
    }

    /// Number of decoded pages kept in memory. Default: 1024
    #[inline]
    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.settings.tree.cache_pages = pages;
        self
    }

    /// Default: 0.4
    #[inline]
    pub fn relative_min_fill(mut self, fraction: f64) -> Self {
        self.settings.tree.relative_min_fill = fraction;
        self
    }

    #[inline]
    pub fn leaf_capacity(mut self, entries: usize) -> Self {
        self.settings.tree.leaf_capacity = Some(entries);
        self
    }

    #[inline]
    pub fn dir_capacity(mut self, entries: usize) -> Self {
        self.settings.tree.dir_capacity = Some(entries);
        self
    }

    #[inline]
    pub fn integrity_checks(mut self, enabled: bool) -> Self {
        self.settings.tree.integrity_checks = enabled;
        self
    }

    #[inline]
    pub fn statistics(mut self, statistics: Arc<TreeStatistics>) -> Self {
        self.settings.tree.statistics = Some(statistics);
        self
    }

    #[inline]
    pub fn insertion(mut self, strategy: impl InsertionStrategy + 'static) -> Self {
        self.settings.insertion = Arc::new(strategy);
        self
    }

    #[inline]
    pub fn split(mut self, strategy: impl SplitStrategy + 'static) -> Self {
        self.settings.split = Arc::new(strategy);
        self
    }

    #[inline]
    pub fn overflow(mut self, treatment: OverflowTreatment) -> Self {
        self.settings.overflow = treatment;
        self
    }

    /// Default: 0.3
    #[inline]
    pub fn reinsert_amount(mut self, fraction: f64) -> Self {
        self.settings.reinsert_amount = fraction;
        self
    }

    #[inline]
    pub fn bulk_split(mut self, strategy: impl BulkSplit + 'static) -> Self {
        self.settings.bulk_split = Some(Arc::new(strategy));
        self
    }

    /// Validates and returns the settings.
    pub fn build(self) -> IndexResult<RTreeSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
