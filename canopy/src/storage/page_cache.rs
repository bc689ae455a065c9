//! LRU cache of decoded nodes.
//!
//! Pages only enter the cache when they are first read or written; nothing
//! is preloaded. Dirty pages handed back on eviction must be written to the
//! store by the caller.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::PageId;

/// A cached node with its dirty flag.
pub struct CachedPage<N> {
    pub node: Arc<N>,
    pub dirty: bool,
}

/// LRU cache for tree pages, keyed by page id.
pub struct PageCache<N> {
    pages: LruCache<PageId, CachedPage<N>>,
}

impl<N> PageCache<N> {
    pub fn new(max_pages: NonZeroUsize) -> Self {
        Self {
            pages: LruCache::new(max_pages),
        }
    }

    /// Look up a page and mark it most recently used.
    pub fn get(&mut self, page_id: PageId) -> Option<Arc<N>> {
        self.pages.get(&page_id).map(|cached| Arc::clone(&cached.node))
    }

    /// Insert or replace a page. Returns the page pushed out to make room,
    /// if any, so a dirty one can be written back.
    pub fn insert(
        &mut self,
        page_id: PageId,
        node: Arc<N>,
        dirty: bool,
    ) -> Option<(PageId, CachedPage<N>)> {
        let dirty = dirty || self.pages.peek(&page_id).is_some_and(|c| c.dirty);
        match self.pages.push(page_id, CachedPage { node, dirty }) {
            // same key: the old value was replaced, nothing was evicted
            Some((evicted_id, _)) if evicted_id == page_id => None,
            evicted => evicted,
        }
    }

    pub fn remove(&mut self, page_id: PageId) -> Option<CachedPage<N>> {
        self.pages.pop(&page_id)
    }

    /// Every dirty page, marking each one clean.
    pub fn take_dirty(&mut self) -> Vec<(PageId, Arc<N>)> {
        self.pages
            .iter_mut()
            .filter(|(_, cached)| cached.dirty)
            .map(|(id, cached)| {
                cached.dirty = false;
                (*id, Arc::clone(&cached.node))
            })
            .collect()
    }

    pub fn is_dirty(&self, page_id: PageId) -> bool {
        self.pages.peek(&page_id).is_some_and(|c| c.dirty)
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.pages.contains(&page_id)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Drop every page. Callers flush first.
    pub fn clear(&mut self) {
        self.pages.clear();
    }
}
