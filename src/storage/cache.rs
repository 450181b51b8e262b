//! Page cache.
//!
//! A fixed number of page frames maps page numbers to in-memory copies with
//! LRU replacement. Readers share a frame lock, writers exclude; a held
//! reference pins its page against eviction. Lock order is mapping lock,
//! then LRU list lock, then frame lock; the LRU lock is never held while
//! waiting on a frame.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::error::Result;
use crate::os::FileIo;
use crate::types::{page_addr, OpenMode, PageNr, PAGE_SIZE};

/// Default number of cached pages (40 MiB).
pub const DEFAULT_CACHE_PAGES: usize = 10_240;

// ============================================================================
// Frames and page references
// ============================================================================

struct Frame {
    page_nr: PageNr,
    mapped: bool,
    dirty: bool,
    data: Box<[u8; PAGE_SIZE]>,
}

impl Frame {
    fn empty() -> Frame {
        Frame {
            page_nr: 0,
            mapped: false,
            dirty: false,
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }
}

/// Shared reference to a cached page. The page cannot change or be evicted
/// for the lifetime of the reference.
pub struct ReadRef {
    guard: ArcRwLockReadGuard<RawRwLock, Frame>,
}

impl ReadRef {
    pub fn page_nr(&self) -> PageNr {
        self.guard.page_nr
    }

    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.guard.data
    }

    /// Little-endian word at a page offset.
    pub fn word(&self, offset: usize) -> u64 {
        crate::types::read_u64(self.guard.data.as_ref(), offset)
    }
}

/// Exclusive reference to a cached page, marked dirty on creation.
pub struct WriteRef {
    guard: ArcRwLockWriteGuard<RawRwLock, Frame>,
}

impl WriteRef {
    pub fn page_nr(&self) -> PageNr {
        self.guard.page_nr
    }

    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.guard.data
    }
}

// ============================================================================
// LRU list
// ============================================================================

const NIL: u32 = u32::MAX;

/// Index-linked LRU list over the frame table. Head is least recent.
struct LruList {
    prev: Vec<u32>,
    next: Vec<u32>,
    head: u32,
    tail: u32,
}

impl LruList {
    fn new(n: usize) -> LruList {
        let mut list = LruList {
            prev: vec![NIL; n],
            next: vec![NIL; n],
            head: NIL,
            tail: NIL,
        };
        for i in 0..n as u32 {
            list.push_tail(i);
        }
        list
    }

    fn unlink(&mut self, idx: u32) {
        let (p, n) = (self.prev[idx as usize], self.next[idx as usize]);
        if p == NIL {
            self.head = n;
        } else {
            self.next[p as usize] = n;
        }
        if n == NIL {
            self.tail = p;
        } else {
            self.prev[n as usize] = p;
        }
        self.prev[idx as usize] = NIL;
        self.next[idx as usize] = NIL;
    }

    fn push_tail(&mut self, idx: u32) {
        self.prev[idx as usize] = self.tail;
        self.next[idx as usize] = NIL;
        if self.tail == NIL {
            self.head = idx;
        } else {
            self.next[self.tail as usize] = idx;
        }
        self.tail = idx;
    }

    fn bump(&mut self, idx: u32) {
        if self.tail == idx {
            return;
        }
        self.unlink(idx);
        self.push_tail(idx);
    }
}

// ============================================================================
// Cache
// ============================================================================

pub struct Cache {
    file: FileIo,
    frames: Vec<Arc<RwLock<Frame>>>,
    map: RwLock<HashMap<PageNr, u32>>,
    lru: Mutex<LruList>,
}

impl Cache {
    /// Open the database file and set up `nr_pages` empty frames.
    pub fn open(path: &Path, mode: OpenMode, nr_pages: usize) -> Result<Cache> {
        assert!(nr_pages > 0);
        let file = FileIo::open(path, mode)?;
        let frames = (0..nr_pages)
            .map(|_| Arc::new(RwLock::new(Frame::empty())))
            .collect();
        Ok(Cache {
            file,
            frames,
            map: RwLock::new(HashMap::new()),
            lru: Mutex::new(LruList::new(nr_pages)),
        })
    }

    /// True if opening created (or truncated) the underlying file.
    pub fn created(&self) -> bool {
        self.file.created()
    }

    /// Shared-locked reference to a page, loading it on miss.
    pub fn read_page(&self, nr: PageNr) -> Result<ReadRef> {
        {
            let map = self.map.read();
            if let Some(&idx) = map.get(&nr) {
                self.bump(idx);
                let guard = self.frames[idx as usize].read_arc();
                return Ok(ReadRef { guard });
            }
        }

        let mut map = self.map.write();
        if let Some(&idx) = map.get(&nr) {
            // another thread loaded it while we upgraded
            self.bump(idx);
            let guard = self.frames[idx as usize].read_arc();
            return Ok(ReadRef { guard });
        }

        let guard = self.load_frame(&mut map, nr)?;
        Ok(ReadRef {
            guard: ArcRwLockWriteGuard::downgrade(guard),
        })
    }

    /// Exclusively locked reference to a page, loading it on miss. The page
    /// is marked dirty.
    pub fn write_page(&self, nr: PageNr) -> Result<WriteRef> {
        {
            let map = self.map.read();
            if let Some(&idx) = map.get(&nr) {
                self.bump(idx);
                let mut guard = self.frames[idx as usize].write_arc();
                guard.dirty = true;
                return Ok(WriteRef { guard });
            }
        }

        let mut map = self.map.write();
        if let Some(&idx) = map.get(&nr) {
            self.bump(idx);
            let mut guard = self.frames[idx as usize].write_arc();
            guard.dirty = true;
            return Ok(WriteRef { guard });
        }

        let mut guard = self.load_frame(&mut map, nr)?;
        guard.dirty = true;
        Ok(WriteRef { guard })
    }

    /// Write every dirty page through to the file and sync.
    pub fn flush(&self) -> Result<()> {
        for frame in &self.frames {
            let mut guard = frame.write();
            if guard.mapped && guard.dirty {
                self.file
                    .write_at(page_addr(guard.page_nr), guard.data.as_ref())?;
                guard.dirty = false;
            }
        }
        self.file.sync()
    }

    fn bump(&self, idx: u32) {
        self.lru.lock().bump(idx);
    }

    /// Map `nr` into a free frame. Called with the mapping lock held
    /// exclusively and `nr` known to be absent.
    fn load_frame(
        &self,
        map: &mut HashMap<PageNr, u32>,
        nr: PageNr,
    ) -> Result<ArcRwLockWriteGuard<RawRwLock, Frame>> {
        let (idx, mut guard) = self.grab_frame();

        if guard.mapped {
            if guard.dirty {
                trace!("evicting dirty page {}", guard.page_nr);
                self.file
                    .write_at(page_addr(guard.page_nr), guard.data.as_ref())?;
                guard.dirty = false;
            }
            map.remove(&guard.page_nr);
        }

        // a page past the end of the file grows it by 8 pages
        if (nr + 1) * PAGE_SIZE as u64 > self.file.len() {
            debug!("extending file for page {}", nr);
            self.file.extend((nr + 8) * PAGE_SIZE as u64)?;
        }
        self.file.read_page(nr, &mut guard.data)?;
        guard.page_nr = nr;
        guard.mapped = true;

        map.insert(nr, idx);
        Ok(guard)
    }

    /// Pop the least recently used frame whose lock is free. Frames with
    /// outstanding references are skipped; if every frame is pinned the
    /// search retries after yielding.
    fn grab_frame(&self) -> (u32, ArcRwLockWriteGuard<RawRwLock, Frame>) {
        loop {
            {
                let mut lru = self.lru.lock();
                let mut idx = lru.head;
                while idx != NIL {
                    if let Some(guard) = self.frames[idx as usize].try_write_arc() {
                        lru.bump(idx);
                        return (idx, guard);
                    }
                    idx = lru.next[idx as usize];
                }
            }
            std::thread::yield_now();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_cache(nr_pages: usize) -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(&dir.path().join("t.db"), OpenMode::CreateAlways, nr_pages).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_write_then_read_hits_cache() {
        let (_dir, cache) = scratch_cache(4);
        {
            let mut w = cache.write_page(1).unwrap();
            w.data_mut()[17] = 0x5A;
        }
        let r = cache.read_page(1).unwrap();
        assert_eq!(r.data()[17], 0x5A);
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let (_dir, cache) = scratch_cache(2);
        {
            let mut w = cache.write_page(1).unwrap();
            w.data_mut()[0] = 0x11;
        }
        // touch enough other pages to evict page 1
        for nr in 2..6 {
            let _ = cache.read_page(nr).unwrap();
        }
        // reload from file
        let r = cache.read_page(1).unwrap();
        assert_eq!(r.data()[0], 0x11);
    }

    #[test]
    fn test_pinned_page_is_not_evicted() {
        let (_dir, cache) = scratch_cache(2);
        let pinned = {
            let mut w = cache.write_page(1).unwrap();
            w.data_mut()[3] = 0x77;
            drop(w);
            cache.read_page(1).unwrap()
        };
        for nr in 2..8 {
            let _ = cache.read_page(nr).unwrap();
        }
        // the pinned ref still sees its page
        assert_eq!(pinned.page_nr(), 1);
        assert_eq!(pinned.data()[3], 0x77);
    }

    #[test]
    fn test_parallel_readers_see_identical_pages() {
        let (_dir, cache) = scratch_cache(8);
        {
            let mut w = cache.write_page(2).unwrap();
            w.data_mut()[100] = 0x42;
        }
        let cache = std::sync::Arc::new(cache);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = std::sync::Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let r = cache.read_page(2).unwrap();
                        assert_eq!(r.data()[100], 0x42);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_flush_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        {
            let cache = Cache::open(&path, OpenMode::CreateAlways, 4).unwrap();
            let mut w = cache.write_page(0).unwrap();
            w.data_mut()[8] = 0x99;
            drop(w);
            cache.flush().unwrap();
        }
        let cache = Cache::open(&path, OpenMode::OpenExisting, 4).unwrap();
        let r = cache.read_page(0).unwrap();
        assert_eq!(r.data()[8], 0x99);
    }
}
