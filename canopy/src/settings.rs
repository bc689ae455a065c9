//! Settings shared by both tree families.
//!
//! The spatial and metric builders embed a [`TreeSettings`] and add their own
//! strategy knobs on top of it.

use std::sync::Arc;

use log::warn;

use crate::errors::{IndexError, IndexResult};
use crate::stats::TreeStatistics;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_CACHE_PAGES: usize = 1024;
pub const DEFAULT_RELATIVE_MIN_FILL: f64 = 0.4;
pub const DEFAULT_REINSERT_AMOUNT: f64 = 0.3;

/// Below this many entries per node a warning is logged.
const SMALL_CAPACITY: usize = 10;

/// Page and node shape settings common to every tree.
#[derive(Debug, Clone)]
pub struct TreeSettings {
    /// Page size for in-memory trees. File-backed trees use the page size of
    /// their store.
    pub page_size: usize,
    pub cache_pages: usize,
    pub relative_min_fill: f64,
    /// Explicit leaf capacity; derived from the page size when `None`.
    pub leaf_capacity: Option<usize>,
    /// Explicit directory capacity; derived from the page size when `None`.
    pub dir_capacity: Option<usize>,
    /// Verify the whole tree after every mutation. Expensive, meant for tests.
    pub integrity_checks: bool,
    pub statistics: Option<Arc<TreeStatistics>>,
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: DEFAULT_CACHE_PAGES,
            relative_min_fill: DEFAULT_RELATIVE_MIN_FILL,
            leaf_capacity: None,
            dir_capacity: None,
            integrity_checks: false,
            statistics: None,
        }
    }
}

impl TreeSettings {
    pub fn validate(&self) -> IndexResult<()> {
        validate_fraction("relative minimum fill", self.relative_min_fill)?;
        if self.cache_pages == 0 {
            return Err(IndexError::InvalidSettings(
                "cache must hold at least one page".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(IndexError::InvalidSettings("page size must be positive".into()));
        }
        if let Some(capacity) = self.leaf_capacity {
            check_capacity("leaf", capacity)?;
        }
        if let Some(capacity) = self.dir_capacity {
            check_capacity("directory", capacity)?;
        }
        Ok(())
    }

    /// The configured statistics handle, or a fresh one.
    pub fn statistics_handle(&self) -> Arc<TreeStatistics> {
        self.statistics.clone().unwrap_or_else(TreeStatistics::new)
    }
}

/// Fill ratios and reinsert amounts must lie strictly between 0 and 0.5.
pub fn validate_fraction(name: &str, value: f64) -> IndexResult<()> {
    if value > 0.0 && value < 0.5 {
        Ok(())
    } else {
        Err(IndexError::InvalidSettings(format!(
            "{name} must lie in (0, 0.5), got {value}"
        )))
    }
}

/// Reject capacities a tree cannot work with.
pub fn check_capacity(kind: &str, capacity: usize) -> IndexResult<usize> {
    if capacity <= 2 {
        return Err(IndexError::InvalidSettings(format!(
            "{kind} node capacity is {capacity}, it must be larger than 2 (page size too small?)"
        )));
    }
    Ok(capacity)
}

/// Entries that fit a page, given the encoded size of an empty node and the
/// size of one entry. Warns when the page fits only a few entries.
pub fn derive_capacity(
    kind: &str,
    page_size: usize,
    overhead: usize,
    entry_size: usize,
) -> IndexResult<usize> {
    if entry_size == 0 || overhead >= page_size {
        return Err(IndexError::InvalidSettings(format!(
            "page size {page_size} cannot hold a single {kind} entry"
        )));
    }
    let capacity = check_capacity(kind, (page_size - overhead) / entry_size)?;
    if let Some(message) = small_page_warning(kind, page_size, capacity) {
        warn!("{}", message);
    }
    Ok(capacity)
}

fn small_page_warning(kind: &str, page_size: usize, capacity: usize) -> Option<String> {
    (capacity < SMALL_CAPACITY).then(|| {
        format!(
            "{kind} node capacity derived from page size {page_size} is only {capacity}; \
             the page size was probably chosen too small"
        )
    })
}

/// Minimum number of entries of a non-root node.
pub fn min_fill(capacity: usize, relative_min_fill: f64) -> usize {
    ((capacity as f64 * relative_min_fill).floor() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = TreeSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.page_size, 4096);
        assert_eq!(settings.relative_min_fill, 0.4);
    }

    #[test]
    fn test_fraction_bounds() {
        assert!(validate_fraction("x", 0.3).is_ok());
        assert!(validate_fraction("x", 0.0).is_err());
        assert!(validate_fraction("x", 0.5).is_err());
        assert!(validate_fraction("x", -0.1).is_err());
        assert!(validate_fraction("x", f64::NAN).is_err());
    }

    #[test]
    fn test_capacity_limits() {
        assert!(check_capacity("leaf", 2).is_err());
        assert_eq!(check_capacity("leaf", 3).unwrap(), 3);
        assert_eq!(check_capacity("leaf", 50).unwrap(), 50);
    }

    #[test]
    fn test_only_derived_capacities_warn() {
        // an explicit capacity of 8 is accepted as is
        assert_eq!(check_capacity("leaf", 8).unwrap(), 8);
        let message = small_page_warning("leaf", 512, 8).unwrap();
        assert!(message.contains("page size 512"), "{}", message);
        assert!(small_page_warning("leaf", 4096, 100).is_none());
        assert!(small_page_warning("leaf", 4096, SMALL_CAPACITY).is_none());
    }

    #[test]
    fn test_derive_capacity() {
        assert_eq!(derive_capacity("leaf", 4096, 96, 40).unwrap(), 100);
        assert!(derive_capacity("leaf", 64, 64, 8).is_err());
        assert!(derive_capacity("leaf", 128, 8, 60).is_err());
    }

    #[test]
    fn test_min_fill() {
        assert_eq!(min_fill(20, 0.4), 8);
        assert_eq!(min_fill(3, 0.2), 1);
        assert_eq!(min_fill(101, 0.4), 40);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = TreeSettings {
            relative_min_fill: 0.6,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(IndexError::InvalidSettings(_))));

        let settings = TreeSettings {
            leaf_capacity: Some(2),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
