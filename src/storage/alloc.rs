//! Tiered block allocator.
//!
//! Pages are carved into aligned power-of-two sub-blocks (4096 down to 256
//! bytes) through five free lists threaded through the blocks' own headers,
//! with the list heads in the database header. All mutation is staged inside
//! an `AllocTxn`; the shared head state is only published on commit, so a
//! dropped transaction has no effect.

use std::collections::BTreeMap;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::{
    Addr, Block, Write, Writes, BLOCK_HDR_SIZE, HDR_EOF_OFFSET, HDR_FREE_OFFSETS, NULL_ADDR,
    PAGE_SIZE,
};

// ============================================================================
// Tiers and block headers
// ============================================================================

/// The five block size classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTier {
    Page,
    T1,
    T2,
    T3,
    T4,
}

pub const TIERS: [BlockTier; 5] = [
    BlockTier::Page,
    BlockTier::T1,
    BlockTier::T2,
    BlockTier::T3,
    BlockTier::T4,
];

impl BlockTier {
    pub fn size(self) -> usize {
        PAGE_SIZE >> self.index()
    }

    /// Largest payload a block of this tier can hold.
    pub fn payload(self) -> usize {
        self.size() - BLOCK_HDR_SIZE
    }

    pub fn index(self) -> usize {
        match self {
            BlockTier::Page => 0,
            BlockTier::T1 => 1,
            BlockTier::T2 => 2,
            BlockTier::T3 => 3,
            BlockTier::T4 => 4,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            BlockTier::Page => b'P',
            BlockTier::T1 => b'1',
            BlockTier::T2 => b'2',
            BlockTier::T3 => b'3',
            BlockTier::T4 => b'4',
        }
    }

    pub fn from_tag(tag: u8) -> Option<BlockTier> {
        match tag {
            b'P' => Some(BlockTier::Page),
            b'1' => Some(BlockTier::T1),
            b'2' => Some(BlockTier::T2),
            b'3' => Some(BlockTier::T3),
            b'4' => Some(BlockTier::T4),
            _ => None,
        }
    }

    /// Smallest tier whose payload holds `size` bytes.
    pub fn fitting(size: usize) -> Option<BlockTier> {
        TIERS.iter().rev().copied().find(|t| size <= t.payload())
    }
}

/// 8-byte header at the start of every block: type tag in the high byte,
/// next address in the low 56 bits. The next field chains free lists and
/// multi-block values alike.
#[derive(Debug, Clone, Copy)]
pub struct BlockHdr {
    pub tier: BlockTier,
    pub next: Addr,
}

impl BlockHdr {
    pub fn new(tier: BlockTier, next: Addr) -> BlockHdr {
        debug_assert!(next < 1 << 56);
        BlockHdr { tier, next }
    }

    pub fn word(self) -> u64 {
        ((self.tier.tag() as u64) << 56) | self.next
    }

    pub fn from_word(word: u64) -> Result<BlockHdr> {
        let tier = BlockTier::from_tag((word >> 56) as u8)
            .ok_or(Error::Corrupt("invalid block type tag"))?;
        Ok(BlockHdr {
            tier,
            next: word & ((1 << 56) - 1),
        })
    }
}

// ============================================================================
// Allocator
// ============================================================================

/// The mutable part of the database header: end-of-file plus the five free
/// list heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdrState {
    pub eof: Addr,
    pub free: [Addr; 5],
}

/// Owns the header state; one transaction at a time via the mutex, which
/// doubles as the single-writer guard for the whole database.
pub struct Allocator {
    state: Mutex<HdrState>,
}

impl Allocator {
    pub fn new(state: HdrState) -> Allocator {
        Allocator {
            state: Mutex::new(state),
        }
    }

    pub fn begin<'a>(&'a self, store: &'a Storage) -> AllocTxn<'a> {
        let shared = self.state.lock();
        let hdr = *shared;
        AllocTxn {
            shared,
            store,
            hdr,
            writes: BTreeMap::new(),
        }
    }
}

/// A staging allocator transaction. Holds the allocator mutex until dropped.
pub struct AllocTxn<'a> {
    shared: MutexGuard<'a, HdrState>,
    store: &'a Storage,
    hdr: HdrState,
    writes: BTreeMap<Addr, u64>,
}

impl<'a> AllocTxn<'a> {
    /// Allocate one block with at least `size` bytes of payload.
    pub fn alloc(&mut self, size: usize) -> Result<Block> {
        match BlockTier::fitting(size) {
            Some(tier) => self.alloc_tier(tier),
            None => Err(Error::AllocTooLarge(size)),
        }
    }

    /// Free a block, identified by its header tag, and every block chained
    /// behind it.
    pub fn free(&mut self, addr: Addr) -> Result<()> {
        let mut addr = addr;
        while addr != NULL_ADDR {
            let hdr = self.read_hdr(addr)?;
            let idx = hdr.tier.index();
            if addr % hdr.tier.size() as Addr != 0 {
                return Err(Error::Corrupt("freed block is misaligned for its tier"));
            }
            let old_head = self.hdr.free[idx];
            self.hdr.free[idx] = addr;
            self.stage(HDR_FREE_OFFSETS[idx], addr);
            self.stage(addr, BlockHdr::new(hdr.tier, old_head).word());
            addr = hdr.next;
        }
        Ok(())
    }

    /// Allocate a block and chain it behind `tail`, which must currently end
    /// its chain.
    pub fn alloc_extension(&mut self, tail: Addr, size: usize) -> Result<Block> {
        let hdr = self.read_hdr(tail)?;
        if hdr.next != NULL_ADDR {
            return Err(Error::Corrupt("extended block is not a chain tail"));
        }
        let block = self.alloc(size)?;
        self.stage(tail, BlockHdr::new(hdr.tier, block.addr).word());
        Ok(block)
    }

    /// Publish the staged header state and emit all staged words. The
    /// allocator mutex stays held until the transaction is dropped, after
    /// the batch has reached the page cache.
    pub fn commit(&mut self) -> Writes {
        *self.shared = self.hdr;
        let writes = std::mem::take(&mut self.writes);
        writes
            .into_iter()
            .map(|(addr, word)| Write::word(addr, word))
            .collect()
    }

    /// Block header at `addr`, staged writes taking precedence over the
    /// committed state.
    pub fn read_hdr(&self, addr: Addr) -> Result<BlockHdr> {
        let word = match self.writes.get(&addr) {
            Some(w) => *w,
            None => self.store.load_word(addr)?,
        };
        BlockHdr::from_word(word)
    }

    fn stage(&mut self, addr: Addr, word: u64) {
        self.writes.insert(addr, word);
    }

    fn alloc_tier(&mut self, tier: BlockTier) -> Result<Block> {
        let idx = tier.index();
        let size = tier.size();
        let head = self.hdr.free[idx];

        if head != NULL_ADDR {
            // pop the free list
            let hdr = self.read_hdr(head)?;
            if hdr.tier != tier || hdr.next % size as Addr != 0 {
                return Err(Error::Corrupt("invalid header in free list block"));
            }
            self.hdr.free[idx] = hdr.next;
            self.stage(HDR_FREE_OFFSETS[idx], hdr.next);
            self.stage(head, BlockHdr::new(tier, NULL_ADDR).word());
            Ok(Block { addr: head, size })
        } else if tier == BlockTier::Page {
            // the page tier allocates from the end of the file
            let addr = self.hdr.eof;
            self.hdr.eof += PAGE_SIZE as Addr;
            self.stage(HDR_EOF_OFFSET, self.hdr.eof);
            self.stage(addr, BlockHdr::new(tier, NULL_ADDR).word());
            Ok(Block { addr, size })
        } else {
            // split a block of the parent tier in half
            let parent = self.alloc_tier(TIERS[idx - 1])?;
            debug_assert_eq!(parent.size, size * 2);
            debug_assert_eq!(parent.addr % size as Addr, 0);

            let upper = parent.addr + size as Addr;
            self.hdr.free[idx] = upper;
            self.stage(HDR_FREE_OFFSETS[idx], upper);
            self.stage(upper, BlockHdr::new(tier, NULL_ADDR).word());
            self.stage(parent.addr, BlockHdr::new(tier, NULL_ADDR).word());
            Ok(Block {
                addr: parent.addr,
                size,
            })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
