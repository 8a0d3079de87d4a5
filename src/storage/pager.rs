use super::cache::PageCache;
use super::disk::FileIo;
use super::header::{DatabaseHeader, HEADER_SIZE};
use super::page::{Page, PageId, PageType, PAGE_HEADER_SIZE};
use crate::error::{DbError, Result};
use parking_lot::Mutex;
use std::path::Path;
use tracing::{instrument, trace, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct PageManagerStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub total_pages: u32,
    pub cached_pages: usize,
}

struct Inner {
    io: FileIo,
    header: DatabaseHeader,
    cache: PageCache,
}

/// Owns the main database file and a bounded page cache.
///
/// Every public operation takes the single internal mutex; the cache-hit
/// path does only a hashmap lookup and a touch-log push under that lock, so
/// contention stays low even though the lock itself is coarse-grained.
pub struct PageManager {
    inner: Mutex<Inner>,
}

impl PageManager {
    #[instrument(skip(path), fields(page_size))]
    pub fn open(path: impl AsRef<Path>, page_size: u32, cache_capacity: usize) -> Result<Self> {
        let mut io = FileIo::open(path)?;
        let file_len = io.length()?;
        let header = if file_len == 0 {
            let header = DatabaseHeader::new(page_size);
            let mut buf = vec![0u8; page_size as usize];
            buf[0..HEADER_SIZE].copy_from_slice(&header.encode());
            io.write_at(0, &buf)?;
            io.flush()?;
            header
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            io.read_at(0, &mut buf)?;
            DatabaseHeader::decode(&buf)?
        };
        tracing::Span::current().record("page_size", header.page_size);
        Ok(Self {
            inner: Mutex::new(Inner {
                io,
                header,
                cache: PageCache::new(cache_capacity),
            }),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.inner.lock().header.page_size
    }

    pub fn header(&self) -> DatabaseHeader {
        self.inner.lock().header
    }

    pub fn set_collection_directory_root(&self, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.header.collection_directory_root = page_id;
        Self::persist_header(&mut inner)
    }

    fn offset_of(inner: &Inner, id: PageId) -> u64 {
        inner.header.page_size as u64 * id as u64
    }

    fn persist_header(inner: &mut Inner) -> Result<()> {
        inner.header.touch_modified();
        let bytes = inner.header.encode();
        inner.io.write_at(0, &bytes)?;
        Ok(())
    }

    /// Allocates a page, preferring the free-list head, else extending the
    /// file by one page.
    #[instrument(skip(self))]
    pub fn allocate(&self, page_type: PageType) -> Result<PageId> {
        let mut inner = self.inner.lock();
        let id = if inner.header.free_list_head != 0 {
            let id = inner.header.free_list_head;
            let freed = Self::load_page_locked(&mut inner, id)?;
            let header = freed.header()?;
            inner.header.free_list_head = header.next_page_id;
            id
        } else {
            inner.header.total_pages += 1;
            let id = inner.header.total_pages;
            let size = inner.header.page_size as u64;
            // Page 0's slot holds the header block; page `id` therefore
            // starts at `page_size * id`, so the file must span `id + 1`
            // page-sized blocks.
            inner.io.set_length(size * (id as u64 + 1))?;
            id
        };
        let page = Page::new(id, inner.header.page_size as usize, page_type);
        inner.cache.insert(id, page);
        Self::persist_header(&mut inner)?;
        trace!(page_id = id, ?page_type, "allocated page");
        Ok(id)
    }

    /// Frees a page: clears its type to `Empty` and pushes it onto the
    /// free-list head.
    #[instrument(skip(self))]
    pub fn free(&self, id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        let old_head = inner.header.free_list_head;
        let size = inner.header.page_size as usize;
        let mut page = Page::new(id, size, PageType::Empty);
        let mut header = page.header()?;
        header.next_page_id = old_head;
        page.set_header(&header);
        page.recompute_checksum();
        Self::write_through(&mut inner, id, &page)?;
        inner.cache.insert(id, page);
        inner.header.free_list_head = id;
        Self::persist_header(&mut inner)
    }

    fn load_page_locked(inner: &mut Inner, id: PageId) -> Result<Page> {
        if let Some(page) = inner.cache.get(id) {
            return Ok(page.clone());
        }
        let size = inner.header.page_size as usize;
        let mut buf = vec![0u8; size];
        let offset = Self::offset_of(inner, id);
        inner.io.read_at(offset, &mut buf)?;
        let page = Page::from_bytes(buf);
        page.verify_checksum()?;
        Self::maybe_evict(inner)?;
        inner.cache.insert(id, page.clone());
        Ok(page)
    }

    fn maybe_evict(inner: &mut Inner) -> Result<()> {
        if !inner.cache.is_full() {
            return Ok(());
        }
        if let Some(victim) = inner.cache.evict_candidate() {
            if let Some(page) = inner.cache.get(victim).cloned() {
                if page.is_dirty {
                    Self::write_through(inner, victim, &page)?;
                }
            }
            inner.cache.remove(victim);
        } else {
            warn!("page cache full and every resident page is pinned");
        }
        Ok(())
    }

    fn write_through(inner: &mut Inner, id: PageId, page: &Page) -> Result<()> {
        let offset = Self::offset_of(inner, id);
        inner.io.write_at(offset, &page.data)?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn read(&self, id: PageId) -> Result<Page> {
        if id == 0 {
            return Err(DbError::InvalidArgument("page id 0 denotes none".into()));
        }
        let mut inner = self.inner.lock();
        Self::load_page_locked(&mut inner, id)
    }

    /// Stores the page back into the cache, marking it dirty. Caller is
    /// responsible for having called `recompute_checksum` beforehand.
    pub fn write(&self, id: PageId, page: Page) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::maybe_evict(&mut inner)?;
        inner.cache.insert(id, page);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn flush_page(&self, id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        let page = match inner.cache.get_mut(id) {
            Some(page) => {
                page.is_dirty = false;
                page.clone()
            }
            None => return Ok(()),
        };
        Self::write_through(&mut inner, id, &page)
    }

    pub fn flush_all_dirty(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for id in inner.cache.dirty_ids() {
            if let Some(page) = inner.cache.get_mut(id) {
                page.is_dirty = false;
                let page = page.clone();
                Self::write_through(&mut inner, id, &page)?;
            }
        }
        inner.io.flush()
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.lock().io.flush()
    }

    /// Ids of pages currently dirty in the cache, for a caller (the flush
    /// scheduler) that needs to flush exactly the pages a commit touched.
    pub fn dirty_page_ids(&self) -> Vec<PageId> {
        self.inner.lock().cache.dirty_ids()
    }

    /// Reads a page straight from disk, bypassing the cache and the
    /// checksum check a normal `read` performs. Used to capture a page's
    /// pre-transaction bytes before its in-cache, dirty version overwrites
    /// them, for WAL pre-image logging at commit/rollback time.
    pub fn read_from_disk(&self, id: PageId) -> Result<Page> {
        let mut inner = self.inner.lock();
        let size = inner.header.page_size as usize;
        let mut buf = vec![0u8; size];
        let offset = Self::offset_of(&inner, id);
        inner.io.read_at(offset, &mut buf)?;
        Ok(Page::from_bytes(buf))
    }

    pub fn statistics(&self) -> PageManagerStats {
        let inner = self.inner.lock();
        PageManagerStats {
            cache_hits: inner.cache.hits,
            cache_misses: inner.cache.misses,
            total_pages: inner.header.total_pages,
            cached_pages: inner.cache.len(),
        }
    }
}

#[allow(dead_code)]
pub(crate) const fn payload_capacity(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pager = PageManager::open(dir.path().join("data.db"), 4096, 16).unwrap();
        let id = pager.allocate(PageType::Data).unwrap();
        let mut page = pager.read(id).unwrap();
        page.payload_mut()[0] = 7;
        page.recompute_checksum();
        pager.write(id, page).unwrap();
        pager.flush_page(id).unwrap();
        let back = pager.read(id).unwrap();
        assert_eq!(back.payload()[0], 7);
    }

    #[test]
    fn free_then_reallocate_reuses_page() {
        let dir = tempfile::tempdir().unwrap();
        let pager = PageManager::open(dir.path().join("data.db"), 4096, 16).unwrap();
        let a = pager.allocate(PageType::Data).unwrap();
        pager.free(a).unwrap();
        let b = pager.allocate(PageType::Data).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn statistics_track_hits_and_misses() {
        let dir = tempfile::tempdir().unwrap();
        let pager = PageManager::open(dir.path().join("data.db"), 4096, 16).unwrap();
        let id = pager.allocate(PageType::Data).unwrap();
        let _ = pager.read(id).unwrap();
        let stats = pager.statistics();
        assert_eq!(stats.total_pages, 1);
        assert!(stats.cache_hits >= 1);
    }
}
