//! Database instance and the transaction coordinator.
//!
//! A `Database` owns the storage (page cache), the block allocator and the
//! key cache. A `Transaction` couples one allocator transaction with one
//! key-cache transaction; the allocator mutex makes it the single writer.
//! Commit gathers key-cache writes (they allocate, so they run first),
//! allocator writes and the caller's tree writes into one batch applied to
//! the page cache while the locks are still held.

use std::path::Path;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::alloc::{AllocTxn, Allocator, BlockHdr, BlockTier, HdrState};
use crate::storage::btree::node::NODE_SIZE;
use crate::storage::btree::BtreeWritable;
use crate::storage::cache::DEFAULT_CACHE_PAGES;
use crate::storage::keycache::{KeyCache, KeyTxn};
use crate::storage::{ReadRef, Storage};
use crate::types::{
    page_nr, page_offset, Addr, Block, Key, OpenMode, Write, Writes, BLOCK_HDR_SIZE,
    HDR_EOF_OFFSET, HDR_FREE_OFFSETS, KEY_CACHE_SEED, MAGIC, NULL_ADDR, PAGE_SIZE, ROOT_ADDR,
};

/// Open configuration.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub mode: OpenMode,
    /// Page cache capacity in pages.
    pub cache_pages: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            mode: OpenMode::OpenAlways,
            cache_pages: DEFAULT_CACHE_PAGES,
        }
    }
}

pub struct Database {
    store: Storage,
    alloc: Allocator,
    keys: KeyCache,
}

impl Database {
    /// Open or create the database file with default options.
    pub fn open(path: &Path) -> Result<Database> {
        Database::open_with(path, Options::default())
    }

    pub fn open_with(path: &Path, options: Options) -> Result<Database> {
        let store = Storage::open(path, options.mode, options.cache_pages)?;
        if store.created() {
            Database::create(store)
        } else {
            Database::load(store)
        }
    }

    /// Initialize page 0 (header plus the key-cache seed block) and create
    /// the root object tree at its well-known address.
    fn create(store: Storage) -> Result<Database> {
        debug!("creating fresh database");
        store.store_write(vec![
            Write::word(0, MAGIC),
            Write::word(HDR_EOF_OFFSET, PAGE_SIZE as u64),
            Write::word(HDR_FREE_OFFSETS[0], 0),
            Write::word(HDR_FREE_OFFSETS[1], 0),
            Write::word(HDR_FREE_OFFSETS[2], 0),
            Write::word(HDR_FREE_OFFSETS[3], 0),
            Write::word(HDR_FREE_OFFSETS[4], 0),
            Write::word(KEY_CACHE_SEED, BlockHdr::new(BlockTier::T1, NULL_ADDR).word()),
            Write::bytes(KEY_CACHE_SEED + BLOCK_HDR_SIZE as u64, vec![0, 0]),
        ])?;

        let keys = KeyCache::open(&store, key_cache_seed_block())?;
        let db = Database {
            alloc: Allocator::new(HdrState {
                eof: PAGE_SIZE as Addr,
                free: [NULL_ADDR; 5],
            }),
            keys,
            store,
        };

        {
            let mut ta = db.transaction();
            let tree = BtreeWritable::create(&mut ta)?;
            debug_assert_eq!(tree.addr(), ROOT_ADDR);
            ta.commit(tree.writes())?;
        }
        Ok(db)
    }

    /// Validate the header of an existing file and load the key cache.
    fn load(store: Storage) -> Result<Database> {
        let state = {
            let page0 = store.load_page(0)?;
            if page0.word(0) != MAGIC {
                return Err(Error::Corrupt("bad database magic"));
            }
            let eof = page0.word(HDR_EOF_OFFSET as usize);
            if eof % PAGE_SIZE as u64 != 0 || eof < PAGE_SIZE as u64 {
                return Err(Error::Corrupt("bad end-of-file address"));
            }
            let mut free = [NULL_ADDR; 5];
            for (i, head) in free.iter_mut().enumerate() {
                *head = page0.word(HDR_FREE_OFFSETS[i] as usize);
                let tier_size = (PAGE_SIZE >> i) as u64;
                if *head % tier_size != 0 {
                    return Err(Error::Corrupt("misaligned free list head"));
                }
            }
            let seed = BlockHdr::from_word(page0.word(KEY_CACHE_SEED as usize))?;
            if seed.tier != BlockTier::T1 {
                return Err(Error::Corrupt("bad key cache seed block"));
            }
            HdrState { eof, free }
        };

        let keys = KeyCache::open(&store, key_cache_seed_block())?;
        let db = Database {
            alloc: Allocator::new(state),
            keys,
            store,
        };

        // the root tree must parse as a node
        let image = db.load_array::<NODE_SIZE>(ROOT_ADDR + BLOCK_HDR_SIZE as u64)?;
        if image[7] != b'L' && image[7] != b'I' {
            return Err(Error::Corrupt("root tree node missing"));
        }
        Ok(db)
    }

    /// Begin the (single) writer transaction. Readers keep running against
    /// the committed state.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            store: &self.store,
            alloc: self.alloc.begin(&self.store),
            keys: self.keys.begin_txn(),
        }
    }

    /// Force all dirty pages to the file.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    // ---- read-side access ----------------------------------------------

    pub(crate) fn load_page(&self, nr: u64) -> Result<ReadRef> {
        self.store.load_page(nr)
    }

    pub(crate) fn load_array<const N: usize>(&self, addr: Addr) -> Result<[u8; N]> {
        self.store.load_array::<N>(addr)
    }

    pub(crate) fn load_word(&self, addr: Addr) -> Result<u64> {
        self.store.load_word(addr)
    }

    /// Copy `len` bytes at `addr`; must not cross a page boundary.
    pub(crate) fn load_bytes(&self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        let offset = page_offset(addr);
        if offset + len > PAGE_SIZE {
            return Err(Error::Corrupt("byte range crosses a page boundary"));
        }
        let page = self.load_page(page_nr(addr))?;
        Ok(page.data()[offset..offset + len].to_vec())
    }

    /// String behind an interned key.
    pub fn resolve_key(&self, key: Key) -> Result<String> {
        self.keys.get_string(key)
    }

    /// Interned key of a string, if committed.
    pub fn get_key(&self, s: &str) -> Option<Key> {
        self.keys.get_key(s)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.store.flush() {
            warn!("flush on close failed: {err}");
        }
    }
}

fn key_cache_seed_block() -> Block {
    Block {
        addr: KEY_CACHE_SEED,
        size: BlockTier::T1.size(),
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// One writer transaction. Dropping without commit discards every staged
/// mutation; nothing reaches the page cache before `commit`.
pub struct Transaction<'db> {
    store: &'db Storage,
    alloc: AllocTxn<'db>,
    keys: KeyTxn<'db>,
}

impl<'db> Transaction<'db> {
    /// Allocate a block with at least `size` bytes of payload.
    pub fn alloc(&mut self, size: usize) -> Result<Block> {
        self.alloc.alloc(size)
    }

    /// Allocate a block chained behind `tail`.
    pub fn alloc_extension(&mut self, tail: Addr, size: usize) -> Result<Block> {
        self.alloc.alloc_extension(tail, size)
    }

    /// Free a block and everything chained behind it.
    pub fn free(&mut self, addr: Addr) -> Result<()> {
        self.alloc.free(addr)
    }

    /// Intern a key string; staged until commit.
    pub fn key(&mut self, s: &str) -> Result<Key> {
        self.keys.get_key(s)
    }

    /// Copy `N` bytes of committed state at `addr`.
    pub fn load_array<const N: usize>(&self, addr: Addr) -> Result<[u8; N]> {
        self.store.load_array::<N>(addr)
    }

    /// Commit: key-cache writes first (they allocate), then the allocator's,
    /// then the caller's tree writes, applied as one sorted batch. The
    /// transaction's locks are held until it is dropped.
    pub fn commit(&mut self, tree_writes: Writes) -> Result<()> {
        let mut writes = self.keys.commit(&mut self.alloc)?;
        writes.extend(self.alloc.commit());
        writes.extend(tree_writes);
        debug!("committing {} writes", writes.len());
        self.store.store_write(writes)
    }
}
