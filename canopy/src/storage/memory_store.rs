use std::collections::HashMap;

use parking_lot::Mutex;

use super::{PageId, PageStore, NO_PAGE};
use crate::errors::{IndexError, IndexResult};

/// Page store that keeps every page in a hash map.
///
/// Used for in-memory trees. It still enforces the page size so a tree
/// behaves the same whether it is backed by memory or by a file.
pub struct MemoryPageStore {
    page_size: usize,
    inner: Mutex<MemoryInner>,
}

struct MemoryInner {
    pages: HashMap<PageId, Vec<u8>>,
    free_pages: Vec<PageId>,
    next_page_id: PageId,
    header: Option<Vec<u8>>,
}

impl MemoryPageStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            inner: Mutex::new(MemoryInner {
                pages: HashMap::new(),
                free_pages: Vec::new(),
                next_page_id: 1,
                header: None,
            }),
        }
    }
}

impl PageStore for MemoryPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self) -> IndexResult<PageId> {
        let mut inner = self.inner.lock();
        if let Some(page_id) = inner.free_pages.pop() {
            return Ok(page_id);
        }
        let page_id = inner.next_page_id;
        inner.next_page_id = page_id.checked_add(1).ok_or(IndexError::PageIdOverflow)?;
        Ok(page_id)
    }

    fn free(&self, page_id: PageId) -> IndexResult<()> {
        let mut inner = self.inner.lock();
        if page_id == NO_PAGE || page_id >= inner.next_page_id {
            return Err(IndexError::PageNotFound(page_id));
        }
        inner.pages.remove(&page_id);
        inner.free_pages.push(page_id);
        Ok(())
    }

    fn read(&self, page_id: PageId) -> IndexResult<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        if page_id == NO_PAGE || page_id >= inner.next_page_id {
            return Err(IndexError::PageNotFound(page_id));
        }
        Ok(inner.pages.get(&page_id).cloned())
    }

    fn write(&self, page_id: PageId, bytes: &[u8]) -> IndexResult<()> {
        if bytes.len() > self.page_size {
            return Err(IndexError::PageTooLarge {
                page_id,
                size: bytes.len(),
                max: self.page_size,
            });
        }
        let mut inner = self.inner.lock();
        if page_id == NO_PAGE || page_id >= inner.next_page_id {
            return Err(IndexError::PageNotFound(page_id));
        }
        inner.pages.insert(page_id, bytes.to_vec());
        Ok(())
    }

    fn read_header(&self) -> IndexResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().header.clone())
    }

    fn write_header(&self, bytes: &[u8]) -> IndexResult<()> {
        self.inner.lock().header = Some(bytes.to_vec());
        Ok(())
    }

    fn sync(&self) -> IndexResult<()> {
        Ok(())
    }

    fn page_count(&self) -> u64 {
        let inner = self.inner.lock();
        inner.next_page_id - 1 - inner.free_pages.len() as u64
    }
}
