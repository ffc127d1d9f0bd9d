//! The buffer pool: a fixed-size in-memory cache of one file's pages.
//!
//! Bookkeeping (frame metadata, page table, LRU order, the pager, and the
//! hit/miss counters) lives behind a single mutex; the page bytes live in
//! per-frame read-write locks so a pinned frame can be read and written
//! while unrelated pool traffic proceeds.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::pager::Pager;
use crate::{Page, PageId, BUFFER_POOL_SIZE, PAGE_SIZE};

#[derive(Debug, Clone, Copy)]
struct FrameMeta {
    page_id: PageId,
    is_dirty: bool,
    is_pinned: bool,
    /// Whether the frame holds a page at all.
    in_use: bool,
}

impl FrameMeta {
    fn empty() -> Self {
        Self {
            page_id: 0,
            is_dirty: false,
            is_pinned: false,
            in_use: false,
        }
    }
}

struct PoolInner {
    meta: Vec<FrameMeta>,
    page_table: HashMap<PageId, usize>,
    /// LRU order over frame indices, most recently used at the front.
    lru: VecDeque<usize>,
    pager: Pager,
    page_hits: u64,
    page_misses: u64,
}

impl PoolInner {
    fn touch(&mut self, frame_index: usize) {
        if let Some(pos) = self.lru.iter().position(|&i| i == frame_index) {
            self.lru.remove(pos);
        }
        self.lru.push_front(frame_index);
    }

    /// The least recently used unpinned frame, removed from the LRU order.
    fn find_victim(&mut self) -> Option<usize> {
        let pos = self
            .lru
            .iter()
            .rposition(|&i| !self.meta[i].is_pinned)?;
        self.lru.remove(pos)
    }
}

/// A cache of up to `capacity` pages of one file, with LRU eviction of
/// unpinned frames. Dirty pages reach the file on eviction, on explicit
/// flush, and on drop.
pub struct BufferPool {
    frames: Vec<RwLock<Page>>,
    inner: Mutex<PoolInner>,
}

/// An RAII pin on one cached page. Dropping the guard releases the pin;
/// `write()` marks the frame dirty.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    page_id: PageId,
    frame_index: usize,
}

impl PageGuard<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.pool.frames[self.frame_index].read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.pool.mark_dirty(self.page_id);
        self.pool.frames[self.frame_index].write().unwrap()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.release_page(self.page_id);
    }
}

impl BufferPool {
    /// Open a pool of `BUFFER_POOL_SIZE` frames over the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_capacity(path, BUFFER_POOL_SIZE)
    }

    pub fn with_capacity<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let pager = Pager::open(path)?;
        let mut frames = Vec::with_capacity(capacity);
        let mut lru = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            frames.push(RwLock::new(Page::new(0)));
            // frame 0 ends up oldest so empty frames fill in index order
            lru.push_front(i);
        }
        Ok(Self {
            frames,
            inner: Mutex::new(PoolInner {
                meta: vec![FrameMeta::empty(); capacity],
                page_table: HashMap::new(),
                lru,
                pager,
                page_hits: 0,
                page_misses: 0,
            }),
        })
    }

    /// Fetch and pin a page, reading it from disk on a miss. Fails with
    /// `Error::Full` when every frame is pinned.
    pub fn get_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&frame_index) = inner.page_table.get(&page_id) {
            inner.meta[frame_index].is_pinned = true;
            inner.touch(frame_index);
            inner.page_hits += 1;
            return Ok(PageGuard {
                pool: self,
                page_id,
                frame_index,
            });
        }

        inner.page_misses += 1;
        crate::basalt_debug_log!("[BufferPool::get_page] Miss on page {page_id}");

        let frame_index = inner.find_victim().ok_or(Error::Full)?;
        let victim = inner.meta[frame_index];
        if victim.in_use {
            if victim.is_dirty {
                let page = self.frames[frame_index].read().unwrap().clone();
                inner.pager.write_page(&page)?;
            }
            inner.page_table.remove(&victim.page_id);
        }

        let page = inner.pager.read_page(page_id)?;
        *self.frames[frame_index].write().unwrap() = page;
        inner.meta[frame_index] = FrameMeta {
            page_id,
            is_dirty: false,
            is_pinned: true,
            in_use: true,
        };
        inner.page_table.insert(page_id, frame_index);
        inner.lru.push_front(frame_index);

        Ok(PageGuard {
            pool: self,
            page_id,
            frame_index,
        })
    }

    /// Clear the pin on a cached page. Not an error if the page is absent.
    pub fn release_page(&self, page_id: PageId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&frame_index) = inner.page_table.get(&page_id) {
            inner.meta[frame_index].is_pinned = false;
        }
    }

    /// Mark a cached page dirty. A no-op for pages not in the pool.
    pub fn mark_dirty(&self, page_id: PageId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&frame_index) = inner.page_table.get(&page_id) {
            inner.meta[frame_index].is_dirty = true;
        }
    }

    /// Write a cached dirty page to disk and mark it clean.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&frame_index) = inner.page_table.get(&page_id) {
            if inner.meta[frame_index].is_dirty {
                let page = self.frames[frame_index].read().unwrap().clone();
                inner.pager.write_page(&page)?;
                inner.meta[frame_index].is_dirty = false;
            }
        }
        Ok(())
    }

    /// Write every dirty frame to disk. Afterwards no frame is dirty.
    pub fn flush_all(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for frame_index in 0..inner.meta.len() {
            let meta = inner.meta[frame_index];
            if meta.in_use && meta.is_dirty {
                let page = self.frames[frame_index].read().unwrap().clone();
                inner.pager.write_page(&page)?;
                inner.meta[frame_index].is_dirty = false;
            }
        }
        Ok(())
    }

    pub fn page_hits(&self) -> u64 {
        self.inner.lock().unwrap().page_hits
    }

    pub fn page_misses(&self) -> u64 {
        self.inner.lock().unwrap().page_misses
    }

    /// Fraction of requests served from memory.
    pub fn hit_ratio(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let total = inner.page_hits + inner.page_misses;
        if total == 0 {
            0.0
        } else {
            inner.page_hits as f64 / total as f64
        }
    }

    /// Raw bytes of one page, via the cache.
    pub fn page_image(&self, page_id: PageId) -> Result<Box<[u8; PAGE_SIZE]>> {
        let guard = self.get_page(page_id)?;
        let data = guard.read().data;
        Ok(Box::new(data))
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // every dirty frame must reach disk before the file handle goes away
        let _ = self.flush_all();
    }
}
