//! Key interning.
//!
//! Object field names are replaced on disk by 48-bit keys: the MurmurHash3
//! of the string in the high 32 bits, a bucket index disambiguating hash
//! collisions in the low 16. New strings are staged inside a `KeyTxn` and
//! persisted on commit into a linked chain of blocks as `(u16 len, bytes)`
//! records with a zero-length terminator.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::storage::alloc::{AllocTxn, BlockHdr};
use crate::storage::Storage;
use crate::types::{page_nr, page_offset, read_u16, Block, Key, Write, Writes};
use crate::types::{BLOCK_HDR_SIZE, NULL_ADDR, PAGE_SIZE};

/// Longest allowed key string.
pub const MAX_KEY_STRING: usize = 256;

// ============================================================================
// Hashing and key composition
// ============================================================================

/// MurmurHash3 x86-32, seed 0. Public-domain algorithm by Austin Appleby.
pub fn hash_string(s: &str) -> u32 {
    murmur3_x86_32(s.as_bytes(), 0)
}

fn murmur3_x86_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, &b) in tail.iter().enumerate() {
            k ^= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[inline]
pub fn make_key(hash: u32, index: u16) -> Key {
    ((hash as Key) << 16) | index as Key
}

#[inline]
pub fn split_key(key: Key) -> (u32, u16) {
    ((key >> 16) as u32, (key & 0xFFFF) as u16)
}

// ============================================================================
// Key cache
// ============================================================================

struct KeyStore {
    /// hash -> strings; the position in the vector is the 16-bit index.
    buckets: HashMap<u32, Vec<String>>,
    /// Tail block of the on-disk chain and the write position inside it.
    block: Block,
    offset: usize,
}

pub struct KeyCache {
    state: RwLock<KeyStore>,
}

impl KeyCache {
    /// Load every interned string by walking the block chain starting at
    /// `first`. The empty string is always present.
    pub fn open(store: &Storage, first: Block) -> Result<KeyCache> {
        let mut buckets: HashMap<u32, Vec<String>> = HashMap::new();
        buckets
            .entry(hash_string(""))
            .or_default()
            .push(String::new());

        let mut block = first;
        let mut offset = BLOCK_HDR_SIZE;
        let mut next = first.addr;
        while next != NULL_ADDR {
            let hdr = BlockHdr::from_word(store.load_word(next)?)?;
            block = Block {
                addr: next,
                size: hdr.tier.size(),
            };
            next = hdr.next;
            offset = BLOCK_HDR_SIZE;

            let page = store.load_page(page_nr(block.addr))?;
            let base = page_offset(block.addr);
            let data = &page.data()[base..base + block.size];

            while offset + 2 <= block.size {
                let len = read_u16(data, offset) as usize;
                if len == 0 {
                    break;
                }
                if offset + 2 + len > block.size {
                    return Err(Error::Corrupt("key record overruns its block"));
                }
                offset += 2;
                let s = String::from_utf8(data[offset..offset + len].to_vec())
                    .map_err(|_| Error::Corrupt("key record is not UTF-8"))?;
                offset += len;
                buckets.entry(hash_string(&s)).or_default().push(s);
            }
        }

        Ok(KeyCache {
            state: RwLock::new(KeyStore {
                buckets,
                block,
                offset,
            }),
        })
    }

    /// String for an interned key. Every key stored in the database resolves
    /// here; failure means corruption or an uncommitted key.
    pub fn get_string(&self, key: Key) -> Result<String> {
        let (hash, index) = split_key(key);
        let state = self.state.read();
        state
            .buckets
            .get(&hash)
            .and_then(|v| v.get(index as usize))
            .cloned()
            .ok_or(Error::UnknownKey)
    }

    /// Key for a string, if it has been committed.
    pub fn get_key(&self, s: &str) -> Option<Key> {
        let hash = hash_string(s);
        let state = self.state.read();
        find_in(&state, hash, s)
    }

    /// Start a transaction able to intern new strings.
    pub fn begin_txn(&self) -> KeyTxn<'_> {
        KeyTxn {
            cache: self,
            lock: KeyLock::None,
            staged: BTreeMap::new(),
        }
    }
}

fn find_in(store: &KeyStore, hash: u32, s: &str) -> Option<Key> {
    let bucket = store.buckets.get(&hash)?;
    bucket
        .iter()
        .position(|x| x == s)
        .map(|i| make_key(hash, i as u16))
}

// ============================================================================
// Key transaction
// ============================================================================

enum KeyLock<'a> {
    None,
    Upgradable(RwLockUpgradableReadGuard<'a, KeyStore>),
    Write(RwLockWriteGuard<'a, KeyStore>),
}

struct StagedBucket {
    /// Length of the shared bucket when staging began; staged strings get
    /// indices base, base+1, ...
    base: usize,
    strings: Vec<String>,
}

/// Stages new key strings. `get_key` hands out the key the string will have
/// after commit; a dropped transaction discards the staged strings and the
/// keys become invalid. The upgradable lease taken on the first miss keeps
/// other writers out while readers continue.
pub struct KeyTxn<'a> {
    cache: &'a KeyCache,
    lock: KeyLock<'a>,
    staged: BTreeMap<u32, StagedBucket>,
}

impl<'a> KeyTxn<'a> {
    /// Intern a string, staging it if unknown. The same string always yields
    /// the same key within one transaction.
    pub fn get_key(&mut self, s: &str) -> Result<Key> {
        if s.len() > MAX_KEY_STRING {
            return Err(Error::KeyCache("key string longer than 256 bytes"));
        }
        let hash = hash_string(s);

        if let Some(bucket) = self.staged.get(&hash) {
            if let Some(pos) = bucket.strings.iter().position(|x| x == s) {
                return Ok(make_key(hash, (bucket.base + pos) as u16));
            }
        }

        if matches!(self.lock, KeyLock::None) {
            {
                let guard = self.cache.state.read();
                if let Some(key) = find_in(&guard, hash, s) {
                    return Ok(key);
                }
            }
            // miss: take the upgrade lease; the string is re-checked below
            // since another transaction may have committed it meanwhile
            self.lock = KeyLock::Upgradable(self.cache.state.upgradable_read());
        }

        let store: &KeyStore = match &self.lock {
            KeyLock::Upgradable(guard) => &**guard,
            KeyLock::Write(guard) => &**guard,
            KeyLock::None => return Err(Error::Corrupt("key transaction lock state")),
        };
        if let Some(key) = find_in(store, hash, s) {
            return Ok(key);
        }
        let base = store.buckets.get(&hash).map_or(0, |v| v.len());

        let bucket = self.staged.entry(hash).or_insert(StagedBucket {
            base,
            strings: Vec::new(),
        });
        let index = bucket.base + bucket.strings.len();
        if index > u16::MAX as usize {
            return Err(Error::KeyCache("hash bucket index space exhausted"));
        }
        bucket.strings.push(s.to_owned());
        Ok(make_key(hash, index as u16))
    }

    /// Persist the staged strings, allocating chain extensions through the
    /// shared allocator transaction, and publish them to the in-memory map.
    /// The exclusive lock taken here is held until the transaction is
    /// dropped, after the batch has reached the page cache.
    pub fn commit(&mut self, alloc: &mut AllocTxn<'_>) -> Result<Writes> {
        if self.staged.is_empty() {
            return Ok(Writes::new());
        }

        let lock = std::mem::replace(&mut self.lock, KeyLock::None);
        let mut guard = match lock {
            KeyLock::Upgradable(g) => RwLockUpgradableReadGuard::upgrade(g),
            KeyLock::Write(g) => g,
            KeyLock::None => self.cache.state.write(),
        };
        let store = &mut *guard;

        let mut writes = Writes::new();
        let mut block = store.block;
        let mut offset = store.offset;

        let staged = std::mem::take(&mut self.staged);
        for (hash, staged_bucket) in staged {
            let bucket = store.buckets.entry(hash).or_default();
            debug_assert_eq!(staged_bucket.base, bucket.len());

            for s in staged_bucket.strings {
                let len = s.len();
                if block.size < offset + 2 + len {
                    // terminate this block and continue in a fresh extension
                    if block.size >= offset + 2 {
                        writes.push(Write::bytes(block.addr + offset as u64, vec![0, 0]));
                    }
                    block = alloc.alloc_extension(block.addr, PAGE_SIZE - BLOCK_HDR_SIZE)?;
                    offset = BLOCK_HDR_SIZE;
                }
                writes.push(Write::bytes(
                    block.addr + offset as u64,
                    (len as u16).to_le_bytes().to_vec(),
                ));
                offset += 2;
                writes.push(Write::bytes(block.addr + offset as u64, s.clone().into_bytes()));
                offset += len;
                bucket.push(s);
            }
        }

        if block.size >= offset + 2 {
            writes.push(Write::bytes(block.addr + offset as u64, vec![0, 0]));
        }

        store.block = block;
        store.offset = offset;
        self.lock = KeyLock::Write(guard);
        Ok(writes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::alloc::{Allocator, BlockTier, HdrState};
    use crate::types::{Addr, OpenMode, HDR_EOF_OFFSET, KEY_CACHE_SEED};

    fn seed_block() -> Block {
        Block {
            addr: KEY_CACHE_SEED,
            size: BlockTier::T1.size(),
        }
    }

    fn fresh() -> (tempfile::TempDir, Storage, Allocator) {
        let dir = tempfile::tempdir().unwrap();
        let store = Storage::open(&dir.path().join("t.db"), OpenMode::CreateAlways, 64).unwrap();
        store
            .store_write(vec![
                Write::word(HDR_EOF_OFFSET, PAGE_SIZE as u64),
                Write::word(KEY_CACHE_SEED, BlockHdr::new(BlockTier::T1, 0).word()),
                Write::bytes(KEY_CACHE_SEED + 8, vec![0, 0]),
            ])
            .unwrap();
        let alloc = Allocator::new(HdrState {
            eof: PAGE_SIZE as Addr,
            free: [0; 5],
        });
        (dir, store, alloc)
    }

    #[test]
    fn test_different_strings_different_keys() {
        let (_dir, store, alloc) = fresh();
        let keys = KeyCache::open(&store, seed_block()).unwrap();
        let mut ta = alloc.begin(&store);
        let mut tk = keys.begin_txn();
        let k1 = tk.get_key("test string 1").unwrap();
        let k2 = tk.get_key("test string 2").unwrap();
        assert_ne!(k1, k2);
        let _ = ta.commit();
    }

    #[test]
    fn test_same_string_same_key() {
        let (_dir, store, _alloc) = fresh();
        let keys = KeyCache::open(&store, seed_block()).unwrap();
        let mut tk = keys.begin_txn();
        let k1 = tk.get_key("test string").unwrap();
        let k2 = tk.get_key("test string").unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_committed_keys_are_known() {
        let (_dir, store, alloc) = fresh();
        let keys = KeyCache::open(&store, seed_block()).unwrap();
        assert!(keys.get_key("test string").is_none());

        let mut ta = alloc.begin(&store);
        let mut tk = keys.begin_txn();
        let k1 = tk.get_key("test string").unwrap();
        let mut writes = tk.commit(&mut ta).unwrap();
        writes.extend(ta.commit());
        store.store_write(writes).unwrap();
        drop(tk);
        drop(ta);

        assert_eq!(keys.get_key("test string"), Some(k1));
        assert_eq!(keys.get_string(k1).unwrap(), "test string");
    }

    #[test]
    fn test_uncommitted_keys_are_unknown() {
        let (_dir, store, _alloc) = fresh();
        let keys = KeyCache::open(&store, seed_block()).unwrap();
        let k1 = {
            let mut tk = keys.begin_txn();
            tk.get_key("test string").unwrap()
        };
        assert!(keys.get_key("test string").is_none());
        assert!(matches!(keys.get_string(k1), Err(Error::UnknownKey)));
    }

    #[test]
    fn test_empty_string_is_preseeded() {
        let (_dir, store, _alloc) = fresh();
        let keys = KeyCache::open(&store, seed_block()).unwrap();
        let k = keys.get_key("").unwrap();
        assert_eq!(keys.get_string(k).unwrap(), "");
    }

    #[test]
    fn test_key_too_long() {
        let (_dir, store, _alloc) = fresh();
        let keys = KeyCache::open(&store, seed_block()).unwrap();
        let mut tk = keys.begin_txn();
        let long = "x".repeat(MAX_KEY_STRING + 1);
        assert!(matches!(tk.get_key(&long), Err(Error::KeyCache(_))));
        assert!(tk.get_key(&"x".repeat(MAX_KEY_STRING)).is_ok());
    }

    #[test]
    fn test_many_keys_survive_reopen() {
        let (_dir, store, alloc) = fresh();
        let keys = KeyCache::open(&store, seed_block()).unwrap();

        // enough strings to overflow the seed block into extensions
        let names: Vec<String> = (0..1000).map(|i| format!("test string #{i}")).collect();
        let mut assigned = Vec::new();
        {
            let mut ta = alloc.begin(&store);
            let mut tk = keys.begin_txn();
            for name in &names {
                assigned.push(tk.get_key(name).unwrap());
            }
            let mut writes = tk.commit(&mut ta).unwrap();
            writes.extend(ta.commit());
            store.store_write(writes).unwrap();
        }

        let reopened = KeyCache::open(&store, seed_block()).unwrap();
        for (name, key) in names.iter().zip(&assigned) {
            assert_eq!(reopened.get_key(name), Some(*key));
            assert_eq!(reopened.get_string(*key).unwrap(), *name);
        }
    }

    #[test]
    fn test_murmur3_reference_vectors() {
        assert_eq!(murmur3_x86_32(b"", 0), 0);
        assert_eq!(murmur3_x86_32(b"", 1), 0x514e28b7);
        assert_eq!(murmur3_x86_32(b"test", 0x9747b28c), 0x704b81dc);
        assert_eq!(murmur3_x86_32(b"Hello, world!", 0x9747b28c), 0x24884cba);
    }

    #[test]
    fn test_key_split_roundtrip() {
        let k = make_key(0xdead_beef, 42);
        assert_eq!(split_key(k), (0xdead_beef, 42));
        assert!(k <= crate::types::MAX_KEY);
    }
}
