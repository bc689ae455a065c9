//! Typed node access on top of a [`PageStore`].

use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{PageCache, PageId, PageStore};
use crate::errors::{IndexError, IndexResult};
use crate::stats::TreeStatistics;

/// On-page framing: an encoded node together with its CRC-32.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageFrame {
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl PageFrame {
    pub fn wrap<N: Serialize>(node: &N) -> IndexResult<Self> {
        let payload = bincode::serde::encode_to_vec(node, bincode::config::legacy())?;
        Ok(Self {
            checksum: crc32(&payload),
            payload,
        })
    }

    /// Verify the checksum and decode the node.
    pub fn into_node<N: DeserializeOwned>(self, page_id: PageId) -> IndexResult<N> {
        let expected = crc32(&self.payload);
        if self.checksum != expected {
            return Err(IndexError::PageCorrupted {
                page_id,
                reason: format!(
                    "checksum mismatch (expected: {:x}, got: {:x})",
                    expected, self.checksum
                ),
            });
        }
        bincode::serde::decode_from_slice(&self.payload, bincode::config::legacy())
            .map(|(node, _)| node)
            .map_err(|e| IndexError::PageCorrupted {
                page_id,
                reason: e.to_string(),
            })
    }

    pub fn to_bytes(&self) -> IndexResult<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::legacy())?)
    }

    pub fn from_bytes(page_id: PageId, bytes: &[u8]) -> IndexResult<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
            .map(|(frame, _)| frame)
            .map_err(|e| IndexError::PageCorrupted {
                page_id,
                reason: e.to_string(),
            })
    }
}

/// CRC-32/BZIP2 (MSB-first, inverted output).
fn crc32(data: &[u8]) -> u32 {
    const POLY: u32 = 0x04C1_1DB7;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }
    crc ^ 0xFFFF_FFFF
}

/// Decoded, cached access to the nodes of one tree.
///
/// Reads go through the LRU cache first; a miss costs one page read from the
/// store. Writes land in the cache as dirty pages and reach the store on
/// eviction or [`PageFile::flush`]. Every write is size-checked up front, so a
/// node that would not fit its page is rejected before it is cached.
pub struct PageFile<N> {
    store: Arc<dyn PageStore>,
    cache: Mutex<PageCache<N>>,
    stats: Arc<TreeStatistics>,
}

impl<N> PageFile<N>
where
    N: Serialize + DeserializeOwned,
{
    pub fn new(
        store: Arc<dyn PageStore>,
        cache_pages: usize,
        stats: Arc<TreeStatistics>,
    ) -> IndexResult<Self> {
        let max_pages = NonZeroUsize::new(cache_pages)
            .ok_or_else(|| IndexError::InvalidSettings("cache must hold at least one page".into()))?;
        Ok(Self {
            store,
            cache: Mutex::new(PageCache::new(max_pages)),
            stats,
        })
    }

    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    /// Bytes a node occupies on its page, frame included.
    pub fn encoded_size(node: &N) -> IndexResult<usize> {
        Ok(PageFrame::wrap(node)?.to_bytes()?.len())
    }

    pub fn allocate(&self) -> IndexResult<PageId> {
        self.store.allocate()
    }

    /// Drop a page from the cache and release it in the store.
    pub fn free(&self, page_id: PageId) -> IndexResult<()> {
        self.cache.lock().remove(page_id);
        self.store.free(page_id)
    }

    pub fn read_node(&self, page_id: PageId) -> IndexResult<Arc<N>> {
        if let Some(node) = self.cache.lock().get(page_id) {
            self.stats.count_cache_hit();
            return Ok(node);
        }

        self.stats.count_cache_miss();
        self.stats.count_page_read();
        let bytes = self
            .store
            .read(page_id)?
            .ok_or(IndexError::PageNotFound(page_id))?;
        let node: Arc<N> = Arc::new(PageFrame::from_bytes(page_id, &bytes)?.into_node(page_id)?);
        self.cache_node(page_id, Arc::clone(&node), false)?;
        Ok(node)
    }

    pub fn write_node(&self, page_id: PageId, node: N) -> IndexResult<()> {
        let size = Self::encoded_size(&node)?;
        let max = self.page_size();
        if size > max {
            return Err(IndexError::PageTooLarge { page_id, size, max });
        }
        self.cache_node(page_id, Arc::new(node), true)
    }

    fn cache_node(&self, page_id: PageId, node: Arc<N>, dirty: bool) -> IndexResult<()> {
        let mut cache = self.cache.lock();
        if let Some((evicted_id, evicted)) = cache.insert(page_id, node, dirty) {
            if evicted.dirty {
                self.write_through(evicted_id, &evicted.node)?;
            }
        }
        Ok(())
    }

    fn write_through(&self, page_id: PageId, node: &N) -> IndexResult<()> {
        let bytes = PageFrame::wrap(node)?.to_bytes()?;
        self.store.write(page_id, &bytes)?;
        self.stats.count_page_write();
        Ok(())
    }

    /// Write every dirty page to the store. Does not sync the store.
    pub fn flush(&self) -> IndexResult<()> {
        let dirty = self.cache.lock().take_dirty();
        for (page_id, node) in dirty {
            self.write_through(page_id, &node)?;
        }
        Ok(())
    }

    pub fn cached_pages(&self) -> usize {
        self.cache.lock().len()
    }

    /// Flush, then forget every cached page.
    pub fn clear_cache(&self) -> IndexResult<()> {
        self.flush()?;
        self.cache.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FilePageStore, MemoryPageStore};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestNode {
        id: u64,
        values: Vec<f64>,
    }

    fn memory_file(cache_pages: usize) -> PageFile<TestNode> {
        PageFile::new(
            Arc::new(MemoryPageStore::new(256)),
            cache_pages,
            TreeStatistics::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xFC89_1918);
    }

    #[test]
    fn test_write_then_read_hits_cache() {
        let stats = TreeStatistics::new();
        let file: PageFile<TestNode> =
            PageFile::new(Arc::new(MemoryPageStore::new(256)), 8, Arc::clone(&stats)).unwrap();
        let id = file.allocate().unwrap();
        let node = TestNode { id: 1, values: vec![1.0, 2.0] };
        file.write_node(id, node.clone()).unwrap();

        assert_eq!(*file.read_node(id).unwrap(), node);
        assert_eq!(stats.snapshot().cache_hits, 1);
        assert_eq!(stats.snapshot().page_writes, 0);
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let file = memory_file(1);
        let a = file.allocate().unwrap();
        let b = file.allocate().unwrap();
        file.write_node(a, TestNode { id: a, values: vec![0.5] }).unwrap();
        // pushes `a` out of the single-slot cache
        file.write_node(b, TestNode { id: b, values: vec![1.5] }).unwrap();

        assert!(file.store().read(a).unwrap().is_some());
        assert_eq!(file.read_node(a).unwrap().values, vec![0.5]);
    }

    #[test]
    fn test_oversized_node_rejected() {
        let file = memory_file(4);
        let id = file.allocate().unwrap();
        let node = TestNode { id, values: vec![0.0; 64] };
        let result = file.write_node(id, node);
        assert!(matches!(result, Err(IndexError::PageTooLarge { .. })));
        assert_eq!(file.cached_pages(), 0);
    }

    #[test]
    fn test_corruption_detected() {
        let store = Arc::new(MemoryPageStore::new(256));
        let file: PageFile<TestNode> =
            PageFile::new(store.clone(), 4, TreeStatistics::new()).unwrap();
        let id = file.allocate().unwrap();
        file.write_node(id, TestNode { id, values: vec![3.0] }).unwrap();
        file.clear_cache().unwrap();

        let mut bytes = store.read(id).unwrap().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        store.write(id, &bytes).unwrap();

        let result = file.read_node(id);
        assert!(matches!(result, Err(IndexError::PageCorrupted { .. })));
    }

    #[test]
    fn test_flush_to_file_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.canopy");
        let id;
        {
            let store = Arc::new(FilePageStore::create(&path, 256).unwrap());
            let file: PageFile<TestNode> =
                PageFile::new(store.clone(), 4, TreeStatistics::new()).unwrap();
            id = file.allocate().unwrap();
            file.write_node(id, TestNode { id, values: vec![4.0, 5.0] }).unwrap();
            file.flush().unwrap();
            store.sync().unwrap();
        }
        let store = Arc::new(FilePageStore::open(&path).unwrap());
        let file: PageFile<TestNode> = PageFile::new(store, 4, TreeStatistics::new()).unwrap();
        assert_eq!(file.read_node(id).unwrap().values, vec![4.0, 5.0]);
    }

    #[test]
    fn test_zero_cache_rejected() {
        let result: IndexResult<PageFile<TestNode>> =
            PageFile::new(Arc::new(MemoryPageStore::new(256)), 0, TreeStatistics::new());
        assert!(matches!(result, Err(IndexError::InvalidSettings(_))));
    }
}
