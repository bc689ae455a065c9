//! Statistics handle shared between a tree, its page file and its searches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Atomic counters updated while a tree is used.
///
/// A handle is created per tree (or injected through the settings builder so
/// several trees can report into one place). Counters only ever grow until
/// [`TreeStatistics::reset`] is called.
#[derive(Debug, Default)]
pub struct TreeStatistics {
    distance_calcs: AtomicU64,
    knn_queries: AtomicU64,
    range_queries: AtomicU64,
    rknn_queries: AtomicU64,
    page_reads: AtomicU64,
    page_writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    splits: AtomicU64,
    reinsertions: AtomicU64,
}

impl TreeStatistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn count_distance_calc(&self) {
        self.distance_calcs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count_knn_query(&self) {
        self.knn_queries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count_range_query(&self) {
        self.range_queries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn count_rknn_query(&self) {
        self.rknn_queries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_page_read(&self) {
        self.page_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_page_write(&self) {
        self.page_writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_split(&self) {
        self.splits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_reinsertion(&self) {
        self.reinsertions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.distance_calcs,
            &self.knn_queries,
            &self.range_queries,
            &self.rknn_queries,
            &self.page_reads,
            &self.page_writes,
            &self.cache_hits,
            &self.cache_misses,
            &self.splits,
            &self.reinsertions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Take a consistent-enough snapshot of all counters.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            distance_calcs: self.distance_calcs.load(Ordering::Relaxed),
            knn_queries: self.knn_queries.load(Ordering::Relaxed),
            range_queries: self.range_queries.load(Ordering::Relaxed),
            rknn_queries: self.rknn_queries.load(Ordering::Relaxed),
            page_reads: self.page_reads.load(Ordering::Relaxed),
            page_writes: self.page_writes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            reinsertions: self.reinsertions.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of the counters in a [`TreeStatistics`] handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub distance_calcs: u64,
    pub knn_queries: u64,
    pub range_queries: u64,
    pub rknn_queries: u64,
    pub page_reads: u64,
    pub page_writes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub splits: u64,
    pub reinsertions: u64,
}

/// Structural summary of a tree together with its counters.
#[derive(Debug, Clone, Default)]
pub struct TreeStats {
    pub total_entries: u64,
    pub tree_height: u32,
    pub cached_pages: u64,
    pub leaf_capacity: usize,
    pub dir_capacity: usize,
    pub counters: StatisticsSnapshot,
}
