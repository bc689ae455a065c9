//! Single-file page store.
//!
//! Pages live at `page_id * page_size`. Page 0 holds the [`StoreHeader`],
//! which carries the allocation state and the owning tree's header bytes.
//! Freed pages are chained through their first bytes into an on-disk free
//! list, so the list survives a close and reopen.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::{PageId, PageStore, NO_PAGE};
use crate::errors::{IndexError, IndexResult};

const MAGIC: u32 = 0x434E_5059; // "CNPY"
const VERSION: u32 = 1;
const MIN_PAGE_SIZE: usize = 64;

/// Header stored on page 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub next_page_id: PageId,
    pub free_list_head: PageId,
    pub free_page_count: u64,
    pub tree_header: Option<Vec<u8>>,
}

impl StoreHeader {
    fn new(page_size: usize) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            page_size: page_size as u32,
            next_page_id: 1,
            free_list_head: NO_PAGE,
            free_page_count: 0,
            tree_header: None,
        }
    }

    fn validate(&self) -> IndexResult<()> {
        if self.magic != MAGIC {
            return Err(IndexError::PageCorrupted {
                page_id: 0,
                reason: "bad magic number".into(),
            });
        }
        if self.version != VERSION {
            return Err(IndexError::InvalidOperation(format!(
                "unsupported store version {}",
                self.version
            )));
        }
        Ok(())
    }
}

/// A freed page, linking to the next free page (0 ends the chain).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FreePage {
    next_free: PageId,
}

/// Reads and writes individual pages of one file.
///
/// Each read is one seek plus one read of exactly one page; nothing is
/// preloaded. Caching happens one layer up in the page file.
pub struct FilePageStore {
    file: Mutex<File>,
    path: PathBuf,
    page_size: usize,
    header: RwLock<StoreHeader>,
}

impl FilePageStore {
    /// Create (or truncate) a store file with the given page size.
    pub fn create(path: impl AsRef<Path>, page_size: usize) -> IndexResult<Self> {
        if page_size < MIN_PAGE_SIZE || page_size > u32::MAX as usize {
            return Err(IndexError::InvalidSettings(format!(
                "page size must be at least {MIN_PAGE_SIZE} bytes, got {page_size}"
            )));
        }
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let store = Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            page_size,
            header: RwLock::new(StoreHeader::new(page_size)),
        };
        store.persist_header()?;
        store.file.lock().sync_all()?;
        debug!("Created page store {:?} with page size {}", path, page_size);
        Ok(store)
    }

    /// Open an existing store file. Only the header page is read.
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        file.seek(SeekFrom::Start(0))?;
        let header: StoreHeader =
            bincode::serde::decode_from_std_read(&mut file, bincode::config::legacy())?;
        header.validate()?;

        debug!(
            "Opened page store {:?}: page size {}, next page {}, {} free pages",
            path, header.page_size, header.next_page_id, header.free_page_count
        );
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            page_size: header.page_size as usize,
            header: RwLock::new(header),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn offset(&self, page_id: PageId) -> IndexResult<u64> {
        page_id
            .checked_mul(self.page_size as u64)
            .ok_or(IndexError::PageIdOverflow)
    }

    fn check_page(&self, page_id: PageId) -> IndexResult<()> {
        if page_id == NO_PAGE || page_id >= self.header.read().next_page_id {
            return Err(IndexError::PageNotFound(page_id));
        }
        Ok(())
    }

    fn persist_header(&self) -> IndexResult<()> {
        let bytes = bincode::serde::encode_to_vec(&*self.header.read(), bincode::config::legacy())?;
        if bytes.len() > self.page_size {
            return Err(IndexError::PageTooLarge {
                page_id: 0,
                size: bytes.len(),
                max: self.page_size,
            });
        }
        self.write_raw(0, &bytes)
    }

    fn write_raw(&self, page_id: PageId, bytes: &[u8]) -> IndexResult<()> {
        let offset = self.offset(page_id)?;
        let mut padded = bytes.to_vec();
        padded.resize(self.page_size, 0);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&padded)?;
        Ok(())
    }

    fn read_raw(&self, page_id: PageId) -> IndexResult<Option<Vec<u8>>> {
        let offset = self.offset(page_id)?;
        let mut file = self.file.lock();
        if file.metadata()?.len() < offset + self.page_size as u64 {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; self.page_size];
        file.read_exact(&mut buffer)?;
        Ok(Some(buffer))
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate(&self) -> IndexResult<PageId> {
        let head = self.header.read().free_list_head;
        if head != NO_PAGE {
            let bytes = self.read_raw(head)?.ok_or_else(|| IndexError::PageCorrupted {
                page_id: head,
                reason: "free list points past the end of the file".into(),
            })?;
            let (free, _): (FreePage, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
            let mut header = self.header.write();
            header.free_list_head = free.next_free;
            header.free_page_count = header.free_page_count.saturating_sub(1);
            return Ok(head);
        }

        let mut header = self.header.write();
        let page_id = header.next_page_id;
        // the page after this one must still be addressable
        let next = page_id.checked_add(1).ok_or(IndexError::PageIdOverflow)?;
        next.checked_mul(self.page_size as u64)
            .ok_or(IndexError::PageIdOverflow)?;
        header.next_page_id = next;
        Ok(page_id)
    }

    fn free(&self, page_id: PageId) -> IndexResult<()> {
        self.check_page(page_id)?;
        let next_free = self.header.read().free_list_head;
        let bytes = bincode::serde::encode_to_vec(&FreePage { next_free }, bincode::config::legacy())?;
        self.write_raw(page_id, &bytes)?;

        let mut header = self.header.write();
        header.free_list_head = page_id;
        header.free_page_count += 1;
        Ok(())
    }

    fn read(&self, page_id: PageId) -> IndexResult<Option<Vec<u8>>> {
        self.check_page(page_id)?;
        self.read_raw(page_id)
    }

    fn write(&self, page_id: PageId, bytes: &[u8]) -> IndexResult<()> {
        self.check_page(page_id)?;
        if bytes.len() > self.page_size {
            return Err(IndexError::PageTooLarge {
                page_id,
                size: bytes.len(),
                max: self.page_size,
            });
        }
        self.write_raw(page_id, bytes)
    }

    fn read_header(&self) -> IndexResult<Option<Vec<u8>>> {
        Ok(self.header.read().tree_header.clone())
    }

    fn write_header(&self, bytes: &[u8]) -> IndexResult<()> {
        self.header.write().tree_header = Some(bytes.to_vec());
        self.persist_header()
    }

    fn sync(&self) -> IndexResult<()> {
        self.persist_header()?;
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn page_count(&self) -> u64 {
        let header = self.header.read();
        header.next_page_id - 1 - header.free_page_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.canopy");
        {
            let store = FilePageStore::create(&path, 512).unwrap();
            assert_eq!(store.page_size(), 512);
            assert_eq!(store.path(), path.as_path());
        }
        let store = FilePageStore::open(&path).unwrap();
        assert_eq!(store.page_size(), 512);
        assert_eq!(store.page_count(), 0);
    }

    #[test]
    fn test_page_write_read() {
        let dir = tempdir().unwrap();
        let store = FilePageStore::create(dir.path().join("p.canopy"), 256).unwrap();
        let a = store.allocate().unwrap();
        let b = store.allocate().unwrap();
        assert_eq!((a, b), (1, 2));

        // allocated but never written
        assert_eq!(store.read(b).unwrap(), None);

        store.write(a, b"first").unwrap();
        let page = store.read(a).unwrap().unwrap();
        assert_eq!(page.len(), 256);
        assert_eq!(&page[..5], b"first");
    }

    #[test]
    fn test_page_zero_rejected() {
        let dir = tempdir().unwrap();
        let store = FilePageStore::create(dir.path().join("z.canopy"), 256).unwrap();
        assert!(store.write(0, b"x").is_err());
        assert!(store.read(0).is_err());
        assert!(store.free(0).is_err());
    }

    #[test]
    fn test_oversized_write_rejected() {
        let dir = tempdir().unwrap();
        let store = FilePageStore::create(dir.path().join("o.canopy"), 64).unwrap();
        let id = store.allocate().unwrap();
        let result = store.write(id, &[7u8; 65]);
        assert!(matches!(result, Err(IndexError::PageTooLarge { size: 65, max: 64, .. })));
    }

    #[test]
    fn test_tiny_page_size_rejected() {
        let dir = tempdir().unwrap();
        let result = FilePageStore::create(dir.path().join("t.canopy"), 16);
        assert!(matches!(result, Err(IndexError::InvalidSettings(_))));
    }

    #[test]
    fn test_free_list_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("free.canopy");
        {
            let store = FilePageStore::create(&path, 128).unwrap();
            let ids: Vec<_> = (0..4).map(|_| store.allocate().unwrap()).collect();
            for id in &ids {
                store.write(*id, b"node").unwrap();
            }
            store.free(ids[1]).unwrap();
            store.free(ids[3]).unwrap();
            assert_eq!(store.page_count(), 2);
            store.sync().unwrap();
        }

        let store = FilePageStore::open(&path).unwrap();
        assert_eq!(store.page_count(), 2);
        // last freed comes back first
        assert_eq!(store.allocate().unwrap(), 4);
        assert_eq!(store.allocate().unwrap(), 2);
        assert_eq!(store.allocate().unwrap(), 5);
    }

    #[test]
    fn test_tree_header_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.canopy");
        {
            let store = FilePageStore::create(&path, 128).unwrap();
            assert_eq!(store.read_header().unwrap(), None);
            store.write_header(&[9, 8, 7]).unwrap();
            store.sync().unwrap();
        }
        let store = FilePageStore::open(&path).unwrap();
        assert_eq!(store.read_header().unwrap(), Some(vec![9, 8, 7]));
    }

    #[test]
    fn test_open_garbage_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.canopy");
        std::fs::write(&path, vec![0xAB; 256]).unwrap();
        assert!(FilePageStore::open(&path).is_err());
    }
}
