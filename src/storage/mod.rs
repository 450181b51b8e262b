//! Storage engine: page cache, block allocator, key interning, B+trees and
//! value serialization.

pub mod alloc;
pub mod btree;
pub mod cache;
pub mod keycache;
pub mod value;

use std::path::Path;

use crate::error::{Error, Result};
use crate::types::{page_nr, page_offset, OpenMode, PageNr, Writes, PAGE_SIZE};

pub use cache::{Cache, ReadRef, WriteRef, DEFAULT_CACHE_PAGES};

/// Disk representation of a database instance: the page cache plus the
/// all-or-nothing write batch entry point.
pub struct Storage {
    cache: Cache,
}

impl Storage {
    pub fn open(path: &Path, mode: OpenMode, cache_pages: usize) -> Result<Storage> {
        Ok(Storage {
            cache: Cache::open(path, mode, cache_pages)?,
        })
    }

    /// True if opening created a fresh file (page 0 is uninitialized).
    pub fn created(&self) -> bool {
        self.cache.created()
    }

    /// Shared-locked reference to a page.
    pub fn load_page(&self, nr: PageNr) -> Result<ReadRef> {
        self.cache.read_page(nr)
    }

    /// Copy `N` bytes starting at an absolute address. On-disk structures
    /// never straddle a page boundary.
    pub fn load_array<const N: usize>(&self, addr: u64) -> Result<[u8; N]> {
        let offset = page_offset(addr);
        if offset + N > PAGE_SIZE {
            return Err(Error::Corrupt("structure crosses a page boundary"));
        }
        let page = self.cache.read_page(page_nr(addr))?;
        let mut out = [0u8; N];
        out.copy_from_slice(&page.data()[offset..offset + N]);
        Ok(out)
    }

    /// Little-endian word at an absolute address.
    pub fn load_word(&self, addr: u64) -> Result<u64> {
        Ok(u64::from_le_bytes(self.load_array::<8>(addr)?))
    }

    /// Apply a committed batch to the cache. Writes are sorted by address
    /// and applied page by page under exclusive page locks, so concurrent
    /// readers see each page change atomically. Only one page lock is held
    /// at a time.
    pub fn store_write(&self, mut writes: Writes) -> Result<()> {
        writes.sort_by_key(|w| w.addr);

        // page-local chunks, in address order
        let mut chunks: Vec<(PageNr, usize, &[u8])> = Vec::new();
        for w in &writes {
            let mut addr = w.addr;
            let mut data = w.data.as_slice();
            while !data.is_empty() {
                let offset = page_offset(addr);
                let take = data.len().min(PAGE_SIZE - offset);
                chunks.push((page_nr(addr), offset, &data[..take]));
                addr += take as u64;
                data = &data[take..];
            }
        }

        let mut i = 0;
        while i < chunks.len() {
            let nr = chunks[i].0;
            let mut page = self.cache.write_page(nr)?;
            while i < chunks.len() && chunks[i].0 == nr {
                let (_, offset, data) = chunks[i];
                page.data_mut()[offset..offset + data.len()].copy_from_slice(data);
                i += 1;
            }
        }
        Ok(())
    }

    /// Write dirty pages through to the file and sync.
    pub fn flush(&self) -> Result<()> {
        self.cache.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Write;

    fn scratch() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let store = Storage::open(&dir.path().join("t.db"), OpenMode::CreateAlways, 16).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_write_applies_sorted_batch() {
        let (_dir, store) = scratch();
        store
            .store_write(vec![
                Write::word(4096 + 16, 0xBBBB),
                Write::word(4096, 0xAAAA),
                Write::bytes(2 * 4096 + 8, vec![1, 2, 3]),
            ])
            .unwrap();
        assert_eq!(store.load_word(4096).unwrap(), 0xAAAA);
        assert_eq!(store.load_word(4096 + 16).unwrap(), 0xBBBB);
        assert_eq!(store.load_array::<3>(2 * 4096 + 8).unwrap(), [1, 2, 3]);
    }

    #[test]
    fn test_load_array_rejects_page_straddle() {
        let (_dir, store) = scratch();
        assert!(store.load_array::<16>(4096 - 8).is_err());
    }
}
