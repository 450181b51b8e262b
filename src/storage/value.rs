//! Value serialization.
//!
//! Scalars are stored inline in leaf entries; objects and arrays become
//! child B+trees and long strings become linked block chains, with the leaf
//! holding only the root address.

use crate::db::Transaction;
use crate::error::{Error, Result};
use crate::model::Value;
use crate::storage::btree::{BtreeWritable, Overwrite};
use crate::types::{Addr, Block, Key, Write, Writes, BLOCK_HDR_SIZE, PAGE_SIZE};

// ============================================================================
// Type tags
// ============================================================================

pub const TAG_OBJECT: u8 = b'O';
pub const TAG_ARRAY: u8 = b'A';
pub const TAG_NUMBER: u8 = b'N';
pub const TAG_STRING: u8 = b'S';
pub const TAG_TRUE: u8 = b'T';
pub const TAG_FALSE: u8 = b'F';
pub const TAG_NULL: u8 = b'0';

/// Tags with the high bit set encode an inline string; the low 6 bits are
/// its length.
pub const SHORT_STRING_BIT: u8 = 0b1000_0000;

/// Longest string stored inline in a leaf.
pub const SHORT_STRING_MAX: usize = 24;

/// Type tag a value serializes under.
pub fn value_tag(val: &Value) -> u8 {
    match val {
        Value::Null => TAG_NULL,
        Value::Bool(true) => TAG_TRUE,
        Value::Bool(false) => TAG_FALSE,
        Value::Number(_) => TAG_NUMBER,
        Value::Object(_) => TAG_OBJECT,
        Value::Array(_) => TAG_ARRAY,
        Value::String(s) => {
            if s.len() > SHORT_STRING_MAX {
                TAG_STRING
            } else {
                SHORT_STRING_BIT | s.len() as u8
            }
        }
    }
}

/// Words following a leaf entry's header word for this tag.
pub fn extra_words(tag: u8) -> Result<usize> {
    if tag & SHORT_STRING_BIT != 0 {
        let len = (tag & 0b0011_1111) as usize;
        return Ok((len + 7) / 8);
    }
    match tag {
        TAG_OBJECT | TAG_ARRAY | TAG_NUMBER | TAG_STRING => Ok(1),
        TAG_TRUE | TAG_FALSE | TAG_NULL => Ok(0),
        _ => Err(Error::Corrupt("unknown value type tag")),
    }
}

/// True if the value's storage lives outside the leaf.
pub fn is_stored_out_of_line(tag: u8) -> bool {
    matches!(tag, TAG_OBJECT | TAG_ARRAY | TAG_STRING)
}

// ============================================================================
// Inline scalars
// ============================================================================

/// Extra words of an inline scalar: the bits of a number, or the packed
/// bytes of a short string (low byte first within each word).
pub fn scalar_words(val: &Value) -> Vec<u64> {
    match val {
        Value::Number(n) => vec![n.to_bits()],
        Value::String(s) if s.len() <= SHORT_STRING_MAX => pack_short_string(s),
        _ => Vec::new(),
    }
}

pub fn pack_short_string(s: &str) -> Vec<u64> {
    s.as_bytes()
        .chunks(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes[..chunk.len()].copy_from_slice(chunk);
            u64::from_le_bytes(bytes)
        })
        .collect()
}

pub fn unpack_short_string(len: usize, words: &[u64]) -> Result<String> {
    let mut bytes = Vec::with_capacity(len);
    for i in 0..len {
        bytes.push((words[i / 8] >> (8 * (i % 8))) as u8);
    }
    String::from_utf8(bytes).map_err(|_| Error::Corrupt("inline string is not UTF-8"))
}

// ============================================================================
// Out-of-line writers
// ============================================================================

/// A value stored outside its leaf, pending commit. The leaf keeps the root
/// address and owns the writer until `collect_writes` drains it.
pub(crate) enum ValueW {
    Object(BtreeWritable),
    Array(BtreeWritable),
    String(StringW),
}

impl ValueW {
    pub(crate) fn addr(&self) -> Addr {
        match self {
            ValueW::Object(tree) | ValueW::Array(tree) => tree.addr(),
            ValueW::String(s) => s.addr(),
        }
    }

    pub(crate) fn collect_writes(&self, out: &mut Writes) {
        match self {
            ValueW::Object(tree) | ValueW::Array(tree) => tree.collect_writes(out),
            ValueW::String(s) => s.collect_writes(out),
        }
    }

    pub(crate) fn destroy(self, ta: &mut Transaction) -> Result<()> {
        match self {
            ValueW::Object(tree) | ValueW::Array(tree) => tree.destroy(ta),
            ValueW::String(s) => s.destroy(ta),
        }
    }
}

/// Build the out-of-line representation of a value, or `None` for values
/// stored inline.
pub(crate) fn build_out_of_line(ta: &mut Transaction, val: &Value) -> Result<Option<ValueW>> {
    match val {
        Value::Object(fields) => {
            let mut tree = BtreeWritable::create(ta)?;
            for (name, field_val) in fields {
                let key = ta.key(name)?;
                tree.insert(ta, key, field_val, Overwrite::Insert)?;
            }
            Ok(Some(ValueW::Object(tree)))
        }
        Value::Array(items) => {
            let mut tree = BtreeWritable::create(ta)?;
            for (index, item) in items.iter().enumerate() {
                tree.insert(ta, index as Key, item, Overwrite::Insert)?;
            }
            Ok(Some(ValueW::Array(tree)))
        }
        Value::String(s) if s.len() > SHORT_STRING_MAX => {
            Ok(Some(ValueW::String(StringW::create(ta, s)?)))
        }
        _ => Ok(None),
    }
}

/// Destroy a value already on disk, given its tag and root address.
pub(crate) fn destroy_stored(ta: &mut Transaction, tag: u8, addr: Addr) -> Result<()> {
    match tag {
        TAG_OBJECT | TAG_ARRAY => BtreeWritable::open(ta, addr)?.destroy(ta),
        TAG_STRING => StringW::open(addr).destroy(ta),
        _ => Err(Error::Corrupt("destroy of a value stored inline")),
    }
}

// ============================================================================
// Long strings
// ============================================================================

/// String header word: magic in the high 16 bits, byte length below.
pub const STRING_HDR_MAGIC: u64 = (b'T' as u64) << 56 | (b'S' as u64) << 48;
pub const STRING_SIZE_MASK: u64 = (1 << 48) - 1;

/// Payload bytes of the first block (block header + string header removed).
pub const STRING_FIRST_CAP: usize = PAGE_SIZE - 2 * BLOCK_HDR_SIZE;

/// Payload bytes of every further chain block.
pub const STRING_CHAIN_CAP: usize = PAGE_SIZE - BLOCK_HDR_SIZE;

struct StagedString {
    bytes: Vec<u8>,
    blocks: Vec<Block>,
}

/// A long string. Freshly created strings carry their bytes and allocated
/// chain until committed; reopened ones only know their first block.
pub(crate) struct StringW {
    addr: Addr,
    staged: Option<StagedString>,
}

impl StringW {
    /// Allocate the whole chain: every block is the smallest tier fitting
    /// the remaining payload, linked through the block headers.
    pub(crate) fn create(ta: &mut Transaction, s: &str) -> Result<StringW> {
        let bytes = s.as_bytes().to_vec();
        let mut remaining = bytes.len();

        let take = remaining.min(STRING_FIRST_CAP);
        let first = ta.alloc(BLOCK_HDR_SIZE + take)?;
        remaining -= take;

        let mut blocks = vec![first];
        while remaining > 0 {
            let take = remaining.min(STRING_CHAIN_CAP);
            let tail = blocks[blocks.len() - 1].addr;
            blocks.push(ta.alloc_extension(tail, take)?);
            remaining -= take;
        }

        Ok(StringW {
            addr: first.addr,
            staged: Some(StagedString { bytes, blocks }),
        })
    }

    pub(crate) fn open(addr: Addr) -> StringW {
        StringW { addr, staged: None }
    }

    pub(crate) fn addr(&self) -> Addr {
        self.addr
    }

    pub(crate) fn collect_writes(&self, out: &mut Writes) {
        let staged = match &self.staged {
            Some(s) => s,
            None => return,
        };
        out.push(Write::word(
            self.addr + BLOCK_HDR_SIZE as u64,
            STRING_HDR_MAGIC | staged.bytes.len() as u64,
        ));
        let mut off = 0;
        for (i, block) in staged.blocks.iter().enumerate() {
            let (data_at, cap) = if i == 0 {
                (block.addr + 2 * BLOCK_HDR_SIZE as u64, STRING_FIRST_CAP)
            } else {
                (block.addr + BLOCK_HDR_SIZE as u64, STRING_CHAIN_CAP)
            };
            let take = (staged.bytes.len() - off).min(cap);
            out.push(Write::bytes(data_at, staged.bytes[off..off + take].to_vec()));
            off += take;
        }
        debug_assert_eq!(off, staged.bytes.len());
    }

    pub(crate) fn destroy(self, ta: &mut Transaction) -> Result<()> {
        ta.free(self.addr)
    }
}

// ============================================================================
// Tests
// ============================================================================
