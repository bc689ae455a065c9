use super::PageId;
use crate::errors::IndexResult;

/// A key to bytes store of fixed-size pages.
///
/// The tree engines treat a store as opaque: they allocate ids, write encoded
/// nodes and read them back. Page 0 never holds a node, it is reserved for a
/// small header blob the owning tree uses to persist its root and shape.
pub trait PageStore: Send + Sync {
    /// Size of one page in bytes. Node capacities are derived from it.
    fn page_size(&self) -> usize;

    /// Hand out an unused page id, reusing freed ones first.
    fn allocate(&self) -> IndexResult<PageId>;

    /// Release a page id so a later `allocate` may return it again.
    fn free(&self, page_id: PageId) -> IndexResult<()>;

    /// Read a page. `None` means the page was allocated but never written.
    fn read(&self, page_id: PageId) -> IndexResult<Option<Vec<u8>>>;

    /// Write a page. Fails with `PageTooLarge` when `bytes` exceed the page size.
    fn write(&self, page_id: PageId, bytes: &[u8]) -> IndexResult<()>;

    /// Tree header bytes, `None` for a freshly created store.
    fn read_header(&self) -> IndexResult<Option<Vec<u8>>>;

    fn write_header(&self, bytes: &[u8]) -> IndexResult<()>;

    /// Persist everything written so far.
    fn sync(&self) -> IndexResult<()>;

    /// Number of allocated (not freed) pages, excluding the header page.
    fn page_count(&self) -> u64;
}
