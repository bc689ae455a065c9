use std::sync::Arc;

use super::insertion::{MetricInsertion, MinimumEnlargement};
use super::split::{Balanced, Distribution, MmRad, Promotion};
use crate::errors::IndexResult;
use crate::settings::TreeSettings;
use crate::stats::TreeStatistics;

/// Configuration of an [`MTree`](super::MTree).
#[derive(Debug, Clone)]
pub struct MTreeSettings {
    pub tree: TreeSettings,
    pub insertion: Arc<dyn MetricInsertion>,
    pub promotion: Arc<dyn Promotion>,
    pub distribution: Arc<dyn Distribution>,
}

impl Default for MTreeSettings {
    fn default() -> Self {
        Self {
            tree: TreeSettings::default(),
            insertion: Arc::new(MinimumEnlargement),
            promotion: Arc::new(MmRad),
            distribution: Arc::new(Balanced),
        }
    }
}

impl MTreeSettings {
    #[inline]
    pub fn builder() -> MTreeSettingsBuilder {
        MTreeSettingsBuilder::new()
    }

    pub fn validate(&self) -> IndexResult<()> {
        self.tree.validate()
    }
}

/// Fluent builder for [`MTreeSettings`].
#[derive(Default)]
pub struct MTreeSettingsBuilder {
    settings: MTreeSettings,
}

impl MTreeSettingsBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Page size of in-memory trees. Default: 4096 bytes
    #[inline]
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.settings.tree.page_size = bytes;
        self
    }

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
    pub fn insertion(mut self, strategy: impl MetricInsertion + 'static) -> Self {
        self.settings.insertion = Arc::new(strategy);
        self
    }

    #[inline]
    pub fn promotion(mut self, promotion: impl Promotion + 'static) -> Self {
        self.settings.promotion = Arc::new(promotion);
        self
    }

    #[inline]
    pub fn distribution(mut self, distribution: impl Distribution + 'static) -> Self {
        self.settings.distribution = Arc::new(distribution);
        self
    }

    pub fn build(self) -> IndexResult<MTreeSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::IndexError;
    use crate::metric::{GeneralizedHyperplane, RandomPromotion};

    #[test]
    fn test_builder() {
        let settings = MTreeSettings::builder()
            .leaf_capacity(12)
            .promotion(RandomPromotion::new(3))
            .distribution(GeneralizedHyperplane)
            .build()
            .unwrap();
        assert_eq!(settings.tree.leaf_capacity, Some(12));
        assert_eq!(settings.tree.dir_capacity, None);
        assert!(format!("{:?}", settings.distribution).contains("GeneralizedHyperplane"));
    }

    #[test]
    fn test_builder_validates() {
        assert!(matches!(
            MTreeSettings::builder().relative_min_fill(0.7).build(),
            Err(IndexError::InvalidSettings(_))
        ));
        assert!(MTreeSettings::builder().dir_capacity(2).build().is_err());
    }
}
